//! Some stats from a completed simulation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::activity::ActivityState;

/// Some stats from a completed simulation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Time of the last simulation event.
    pub makespan: f64,
    /// Total number of created actors, including restarted ones.
    pub actors_created: usize,
    /// Number of actors whose code returned.
    pub actors_finished: usize,
    /// Number of killed actors.
    pub actors_killed: usize,
    pub finished_activities: usize,
    pub canceled_activities: usize,
    pub failed_activities: usize,
    /// Total flops of finished executions.
    pub total_flops: f64,
    /// Total bytes of finished communications. Includes transfers with `src == dst`.
    pub total_network_traffic: f64,
    /// Total bytes of finished communications between different hosts.
    pub network_traffic_between_hosts: f64,
    /// Total bytes of finished disk reads and writes.
    pub total_io: f64,
    /// Energy consumed by each host with an energy model, in joules.
    pub host_energy: BTreeMap<String, f64>,
    pub total_energy: f64,
    /// Actors which were blocked forever when the simulation ran out of events.
    pub deadlocked_actors: Vec<String>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register activity which reached a terminal state.
    pub fn register_activity(&mut self, state: ActivityState) {
        match state {
            ActivityState::Finished => self.finished_activities += 1,
            ActivityState::Canceled => self.canceled_activities += 1,
            ActivityState::Failed => self.failed_activities += 1,
            _ => {}
        }
    }

    /// Register finished execution with a given computation size.
    pub fn register_execution(&mut self, flops: f64) {
        self.total_flops += flops;
    }

    /// Register finished transfer of `size` bytes.
    pub fn register_transfer(&mut self, size: f64, same_host: bool) {
        self.total_network_traffic += size;
        if !same_host {
            self.network_traffic_between_hosts += size;
        }
    }

    pub fn register_io(&mut self, size: f64) {
        self.total_io += size;
    }

    /// Finalize result given the current simulation time and energy counters.
    pub fn finalize(&mut self, makespan: f64, host_energy: BTreeMap<String, f64>) {
        self.makespan = makespan;
        self.total_energy = host_energy.values().sum();
        self.host_energy = host_energy;
    }
}
