//! Notifications about simulation state transitions.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::{
    activity::{ActivityId, ActivityState},
    actor::ActorId,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TraceEvent {
    ActorStarted {
        time: f64,
        actor: ActorId,
        name: String,
        host: String,
    },
    ActorTerminated {
        time: f64,
        actor: ActorId,
        name: String,
        killed: bool,
    },
    ActivityStarted {
        time: f64,
        activity: ActivityId,
        name: String,
        kind: String,
    },
    ActivityCompleted {
        time: f64,
        activity: ActivityId,
        name: String,
        kind: String,
        state: ActivityState,
    },
    HostStateChanged {
        time: f64,
        host: String,
        on: bool,
    },
    HostPstateChanged {
        time: f64,
        host: String,
        pstate: usize,
    },
    LinkStateChanged {
        time: f64,
        link: String,
        on: bool,
    },
}

impl TraceEvent {
    pub fn time(&self) -> f64 {
        match self {
            TraceEvent::ActorStarted { time, .. }
            | TraceEvent::ActorTerminated { time, .. }
            | TraceEvent::ActivityStarted { time, .. }
            | TraceEvent::ActivityCompleted { time, .. }
            | TraceEvent::HostStateChanged { time, .. }
            | TraceEvent::HostPstateChanged { time, .. }
            | TraceEvent::LinkStateChanged { time, .. } => *time,
        }
    }
}

/// In-memory record of all trace events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub hosts: Vec<String>,
    pub events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            events: Vec::new(),
        }
    }

    pub fn log(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    /// Completion times of all activities in the order of completion.
    pub fn completion_times(&self) -> Vec<(String, f64)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TraceEvent::ActivityCompleted { time, name, .. } => Some((name.clone(), *time)),
                _ => None,
            })
            .collect()
    }
}

/// Receiver of trace events.
///
/// Errors returned by a sink are logged and otherwise ignored, they never affect the simulation.
pub trait TraceSink {
    fn on_event(&mut self, event: &TraceEvent) -> Result<(), Box<dyn std::error::Error>>;
}

/// Writes each event as a JSON line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> TraceSink for JsonLinesSink<W> {
    fn on_event(&mut self, event: &TraceEvent) -> Result<(), Box<dyn std::error::Error>> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}
