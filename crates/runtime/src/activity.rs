//! Activity state machine.
//!
//! Activities live in the kernel arena for the whole simulation and are referenced by [ActivityId]. Dependency edges
//! between activities are stored as ids too: each activity keeps its successors and the number of its predecessors
//! which have not finished yet.

use std::{any::Any, collections::BTreeMap};

use serde::{Deserialize, Serialize};

use dslab_platform::{
    disk::{DiskId, IoOp},
    host::HostId,
    link::LinkId,
    model::ActionId,
};

use crate::{
    actor::ActorId,
    error::{Failure, SimError},
    kernel::{Kernel, WaitTarget, WakeReason},
    log_debug, log_warn,
    trace::TraceEvent,
};

pub type ActivityId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityState {
    /// Created but not started.
    Inited,
    /// Started but waiting for predecessors, for a host assignment or for a matching mailbox request.
    Starting,
    Running,
    Suspended,
    Finished,
    Canceled,
    Failed,
}

impl ActivityState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActivityState::Finished | ActivityState::Canceled | ActivityState::Failed
        )
    }
}

pub(crate) enum ActivityKind {
    Exec {
        host: Option<HostId>,
    },
    Comm {
        mailbox: Option<String>,
        sender: Option<ActorId>,
        receiver: Option<ActorId>,
        src_host: Option<HostId>,
        dst_host: Option<HostId>,
        payload: Option<Box<dyn Any>>,
        detached: bool,
        links: Vec<LinkId>,
    },
    Io {
        disk: DiskId,
        op: IoOp,
    },
    /// Computation and transfers spread over several hosts, progressing as a whole.
    Parallel {
        hosts: Vec<HostId>,
        flops: Vec<f64>,
        bytes: Vec<f64>,
        links: Vec<LinkId>,
    },
    Message {
        queue: String,
        is_put: bool,
        payload: Option<Box<dyn Any>>,
    },
}

impl ActivityKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActivityKind::Exec { .. } => "exec",
            ActivityKind::Comm { .. } => "comm",
            ActivityKind::Io { .. } => "io",
            ActivityKind::Parallel { .. } => "parallel_exec",
            ActivityKind::Message { .. } => "message",
        }
    }
}

pub(crate) struct ActivityRecord {
    pub id: ActivityId,
    pub name: String,
    pub kind: ActivityKind,
    pub state: ActivityState,
    pub amount: f64,
    pub remaining: f64,
    pub priority: f64,
    pub bound: Option<f64>,
    pub action: Option<ActionId>,
    /// `start()` was called, the activity launches as soon as it can.
    pub start_requested: bool,
    /// `suspend()` was called before the activity launched.
    pub suspend_requested: bool,
    pub pending_predecessors: usize,
    pub successors: Vec<ActivityId>,
    pub callbacks: Vec<Box<dyn FnOnce(ActivityState)>>,
    pub waiters: Vec<ActorId>,
    pub owners: Vec<ActorId>,
    pub start_time: Option<f64>,
    pub finish_time: Option<f64>,
    pub failure: Option<Failure>,
}

impl ActivityRecord {
    pub fn new(id: ActivityId, name: String, kind: ActivityKind, amount: f64, owner: Option<ActorId>) -> Self {
        Self {
            id,
            name,
            kind,
            state: ActivityState::Inited,
            amount,
            remaining: amount,
            priority: 1.,
            bound: None,
            action: None,
            start_requested: false,
            suspend_requested: false,
            pending_predecessors: 0,
            successors: Vec::new(),
            callbacks: Vec::new(),
            waiters: Vec::new(),
            owners: owner.into_iter().collect(),
            start_time: None,
            finish_time: None,
            failure: None,
        }
    }

    /// Outcome reported to an actor which awaited this activity.
    pub fn result(&self) -> Result<(), SimError> {
        match self.state {
            ActivityState::Finished => Ok(()),
            ActivityState::Canceled => Err(SimError::Cancelled),
            ActivityState::Failed => Err(self
                .failure
                .as_ref()
                .map(SimError::from)
                .unwrap_or(SimError::TransferFailure)),
            state => Err(SimError::InvalidState(format!(
                "activity {} is not complete ({:?})",
                self.name, state
            ))),
        }
    }
}

impl Kernel {
    pub(crate) fn create_activity(
        &mut self,
        name: Option<String>,
        kind: ActivityKind,
        amount: f64,
        owner: Option<ActorId>,
    ) -> ActivityId {
        let id = self.next_activity_id;
        self.next_activity_id += 1;
        let name = name.unwrap_or_else(|| format!("{}-{}", kind.label(), id));
        self.activities
            .insert(id, ActivityRecord::new(id, name, kind, amount, owner));
        if let Some(actor) = owner.and_then(|owner| self.actors.get_mut(&owner)) {
            actor.owned.push(id);
        }
        id
    }

    /// Follows merges of mailbox requests.
    pub(crate) fn resolve(&self, id: ActivityId) -> ActivityId {
        resolve_alias(&self.aliases, id)
    }

    pub(crate) fn activity(&self, id: ActivityId) -> &ActivityRecord {
        let id = self.resolve(id);
        self.activities.get(&id).expect("activity ids are never reused")
    }

    pub(crate) fn activity_mut(&mut self, id: ActivityId) -> &mut ActivityRecord {
        let id = self.resolve(id);
        self.activities.get_mut(&id).expect("activity ids are never reused")
    }

    pub(crate) fn activity_remaining(&self, id: ActivityId) -> f64 {
        let record = self.activity(id);
        record
            .action
            .and_then(|action| self.platform.action_remaining(action))
            .unwrap_or(record.remaining)
    }

    pub(crate) fn start_activity(&mut self, id: ActivityId) -> Result<(), SimError> {
        let id = self.resolve(id);
        let record = self.activity_mut(id);
        if record.state != ActivityState::Inited {
            return Err(SimError::InvalidState(format!(
                "can't start activity {} in state {:?}",
                record.name, record.state
            )));
        }
        record.start_requested = true;
        if record.pending_predecessors > 0 {
            record.state = ActivityState::Starting;
            return Ok(());
        }
        self.activate(id);
        Ok(())
    }

    /// Starts an activity whose predecessors are all finished.
    pub(crate) fn activate(&mut self, id: ActivityId) {
        let unmatched = match &self.activity(id).kind {
            ActivityKind::Comm { src_host, dst_host, .. } => src_host.is_none() || dst_host.is_none(),
            ActivityKind::Message { .. } => true,
            _ => false,
        };
        if !unmatched {
            self.launch(id);
        } else if matches!(self.activity(id).kind, ActivityKind::Message { .. }) {
            self.post_message(id);
        } else {
            self.post_comm(id);
        }
    }

    /// Registers the activity in the resource model.
    pub(crate) fn launch(&mut self, id: ActivityId) {
        enum Target {
            Unassigned,
            Exec(HostId),
            Io(DiskId, IoOp),
            Comm(HostId, HostId),
            Parallel(Vec<HostId>, Vec<f64>, Vec<f64>),
        }

        let id = self.resolve(id);
        let record = &self.activities[&id];
        let (remaining, priority, bound) = (record.remaining, record.priority, record.bound);
        let target = match &record.kind {
            ActivityKind::Exec { host: Some(host) } => Target::Exec(*host),
            ActivityKind::Io { disk, op } => Target::Io(*disk, *op),
            ActivityKind::Comm {
                src_host: Some(src),
                dst_host: Some(dst),
                ..
            } => Target::Comm(*src, *dst),
            ActivityKind::Parallel {
                hosts, flops, bytes, ..
            } => Target::Parallel(hosts.clone(), flops.clone(), bytes.clone()),
            _ => Target::Unassigned,
        };
        let action = match target {
            Target::Unassigned => {
                self.activity_mut(id).state = ActivityState::Starting;
                return;
            }
            Target::Exec(host) => {
                if !self.platform.host(host).is_on() {
                    let failure = Failure::Host(self.platform.host(host).name().to_string());
                    self.complete_activity(id, ActivityState::Failed, Some(failure));
                    return;
                }
                self.platform.start_exec(host, remaining, priority, bound)
            }
            Target::Io(disk, op) => {
                let disk_host = self.platform.disk(disk).host();
                if !self.platform.disk(disk).is_on() || !self.platform.host(disk_host).is_on() {
                    let failure = Failure::Host(self.platform.host(disk_host).name().to_string());
                    self.complete_activity(id, ActivityState::Failed, Some(failure));
                    return;
                }
                self.platform.start_io(disk, op, remaining, priority)
            }
            Target::Comm(src, dst) => {
                if !self.platform.host(src).is_on() || !self.platform.host(dst).is_on() {
                    self.complete_activity(id, ActivityState::Failed, Some(Failure::Transfer));
                    return;
                }
                let route = match self.platform.route(src, dst) {
                    Ok(route) => route,
                    Err(e) => {
                        log_warn!(self, "communication {} can't start: {}", id, e);
                        self.complete_activity(id, ActivityState::Failed, Some(Failure::Transfer));
                        return;
                    }
                };
                if route.links.iter().any(|&link| !self.platform.link(link).is_on()) {
                    self.complete_activity(id, ActivityState::Failed, Some(Failure::Transfer));
                    return;
                }
                let action = self.platform.start_comm(&route, remaining, priority, bound);
                if let ActivityKind::Comm { links, .. } = &mut self.activity_mut(id).kind {
                    *links = route.links;
                }
                action
            }
            Target::Parallel(hosts, flops, bytes) => {
                if let Some(&host) = hosts.iter().find(|&&host| !self.platform.host(host).is_on()) {
                    let failure = Failure::Host(self.platform.host(host).name().to_string());
                    self.complete_activity(id, ActivityState::Failed, Some(failure));
                    return;
                }
                let n = hosts.len();
                let mut used_links = Vec::new();
                for (index, _) in bytes.iter().enumerate().filter(|(_, &amount)| amount > 0.) {
                    match self.platform.route(hosts[index / n], hosts[index % n]) {
                        Ok(route) => used_links.extend(route.links),
                        Err(e) => {
                            log_warn!(self, "parallel execution {} can't start: {}", id, e);
                            self.complete_activity(id, ActivityState::Failed, Some(Failure::Transfer));
                            return;
                        }
                    }
                }
                used_links.sort_unstable();
                used_links.dedup();
                if used_links.iter().any(|&link| !self.platform.link(link).is_on()) {
                    self.complete_activity(id, ActivityState::Failed, Some(Failure::Transfer));
                    return;
                }
                let action = match self.platform.start_parallel_exec(&hosts, &flops, &bytes, priority, bound) {
                    Ok(action) => action,
                    Err(e) => {
                        log_warn!(self, "parallel execution {} can't start: {}", id, e);
                        self.complete_activity(id, ActivityState::Failed, Some(Failure::Transfer));
                        return;
                    }
                };
                if let ActivityKind::Parallel { links, .. } = &mut self.activity_mut(id).kind {
                    *links = used_links;
                }
                action
            }
        };

        self.action_activity.insert(action, id);
        let clock = self.clock;
        let record = self.activity_mut(id);
        record.action = Some(action);
        record.state = ActivityState::Running;
        record.start_time = Some(clock);
        let suspend = record.suspend_requested;
        let event = TraceEvent::ActivityStarted {
            time: clock,
            activity: id,
            name: record.name.clone(),
            kind: record.kind.label().to_string(),
        };
        if suspend {
            self.platform.suspend_action(action);
            self.activity_mut(id).state = ActivityState::Suspended;
        }
        self.emit(event);
    }

    /// Moves the activity to a terminal state, wakes its awaiters and notifies its successors.
    pub(crate) fn complete_activity(&mut self, id: ActivityId, state: ActivityState, failure: Option<Failure>) {
        debug_assert!(state.is_terminal());
        let id = self.resolve(id);
        let clock = self.clock;
        let Some(record) = self.activities.get_mut(&id) else {
            return;
        };
        if record.state.is_terminal() {
            return;
        }
        if let Some(action) = record.action.take() {
            let remaining = self.platform.remove_action(action);
            self.action_activity.remove(&action);
            record.remaining = remaining.unwrap_or(record.remaining);
        }
        if state == ActivityState::Finished {
            record.remaining = 0.;
        }
        assert!(
            record.remaining >= -self.config.precision,
            "activity {} has negative remaining amount {}",
            record.name,
            record.remaining
        );
        record.state = state;
        record.finish_time = Some(clock);
        record.failure = failure;
        let callbacks = std::mem::take(&mut record.callbacks);
        let waiters = std::mem::take(&mut record.waiters);
        let successors = record.successors.clone();
        let owners = record.owners.clone();
        let event = TraceEvent::ActivityCompleted {
            time: clock,
            activity: id,
            name: record.name.clone(),
            kind: record.kind.label().to_string(),
            state,
        };

        if state == ActivityState::Finished {
            let amount = record.amount;
            match &record.kind {
                ActivityKind::Exec { .. } => self.stats.register_execution(amount),
                ActivityKind::Comm { src_host, dst_host, .. } => {
                    let same_host = src_host == dst_host;
                    self.stats.register_transfer(amount, same_host);
                }
                ActivityKind::Io { .. } => self.stats.register_io(amount),
                ActivityKind::Parallel { flops, .. } => self.stats.register_execution(flops.iter().sum()),
                ActivityKind::Message { .. } => {}
            }
        }
        self.stats.register_activity(state);
        log_debug!(self, "activity {} is {:?}", self.activities[&id].name, state);

        for owner in owners {
            if let Some(actor) = self.actors.get_mut(&owner) {
                let aliases = &self.aliases;
                actor.owned.retain(|&activity| resolve_alias(aliases, activity) != id);
            }
        }

        self.detach_request(id);
        for callback in callbacks {
            self.defer(Box::new(move || callback(state)));
        }
        for actor in waiters {
            self.check_activity_wait(actor, id);
        }
        for successor in successors {
            let successor = self.resolve(successor);
            if state == ActivityState::Finished {
                let record = self.activity_mut(successor);
                record.pending_predecessors = record.pending_predecessors.saturating_sub(1);
                if record.pending_predecessors == 0 && record.start_requested && record.state == ActivityState::Starting
                {
                    self.activate(successor);
                }
            } else {
                self.complete_activity(successor, ActivityState::Canceled, None);
            }
        }
        self.emit(event);
    }

    /// Wakes the actor if its wait on activities is satisfied by the completion of `id`.
    pub(crate) fn check_activity_wait(&mut self, actor: ActorId, id: ActivityId) {
        let Some(wait) = self.actors.get(&actor).and_then(|a| a.wait.as_ref()) else {
            return;
        };
        let WaitTarget::Activities { ids, all } = &wait.target else {
            return;
        };
        if !ids.iter().any(|&other| self.resolve(other) == id) {
            return;
        }
        let token = wait.token;
        let reason = if *all {
            if !ids.iter().all(|&other| self.activity(other).state.is_terminal()) {
                return;
            }
            WakeReason::Ready
        } else {
            WakeReason::Activity(id)
        };
        let ids = ids.clone();
        for other in ids {
            let other = self.resolve(other);
            if let Some(record) = self.activities.get_mut(&other) {
                record.waiters.retain(|&a| a != actor);
            }
        }
        self.wake(actor, token, reason);
    }

    /// Registers a wait of the current actor on some activities. Returns `None` if the wait is already satisfied.
    pub(crate) fn wait_activities(
        &mut self,
        ids: &[ActivityId],
        all: bool,
        deadline: Option<f64>,
    ) -> Option<(ActorId, u64)> {
        let actor = self.current_actor();
        let ids = ids.iter().map(|&id| self.resolve(id)).collect::<Vec<_>>();
        let satisfied = if all {
            ids.iter().all(|&id| self.activities[&id].state.is_terminal())
        } else {
            ids.iter().any(|&id| self.activities[&id].state.is_terminal())
        };
        if satisfied {
            return None;
        }
        if deadline.is_some_and(|deadline| deadline <= self.clock) {
            return Some((actor, self.immediate_timeout(actor)));
        }
        for &id in ids.iter() {
            let record = self.activities.get_mut(&id).expect("activity ids are never reused");
            if !record.waiters.contains(&actor) {
                record.waiters.push(actor);
            }
        }
        let token = self.begin_wait(actor, WaitTarget::Activities { ids, all }, deadline);
        Some((actor, token))
    }

    /// Blocking call whose deadline has already passed: the actor yields and gets a timeout.
    pub(crate) fn immediate_timeout(&mut self, actor: ActorId) -> u64 {
        let token = self.begin_wait(actor, WaitTarget::Yield, None);
        self.wake(actor, token, WakeReason::Timeout);
        token
    }

    pub(crate) fn cancel_activity(&mut self, id: ActivityId) {
        self.complete_activity(id, ActivityState::Canceled, None);
    }

    pub(crate) fn suspend_activity(&mut self, id: ActivityId) {
        let record = self.activity_mut(id);
        match record.state {
            ActivityState::Running => {
                record.state = ActivityState::Suspended;
                let action = record.action;
                if let Some(action) = action {
                    self.platform.suspend_action(action);
                }
            }
            ActivityState::Inited | ActivityState::Starting => record.suspend_requested = true,
            _ => {}
        }
    }

    pub(crate) fn resume_activity(&mut self, id: ActivityId) {
        let record = self.activity_mut(id);
        match record.state {
            ActivityState::Suspended => {
                record.state = ActivityState::Running;
                let action = record.action;
                if let Some(action) = action {
                    self.platform.resume_action(action);
                }
            }
            ActivityState::Inited | ActivityState::Starting => record.suspend_requested = false,
            _ => {}
        }
    }

    pub(crate) fn set_activity_priority(&mut self, id: ActivityId, priority: f64) -> Result<(), SimError> {
        if !(priority > 0.) {
            return Err(SimError::InvalidState(format!("priority must be positive, got {}", priority)));
        }
        let record = self.activity_mut(id);
        record.priority = priority;
        let action = record.action;
        if let Some(action) = action {
            self.platform.set_action_priority(action, priority);
        }
        Ok(())
    }

    pub(crate) fn set_activity_bound(&mut self, id: ActivityId, bound: Option<f64>) {
        let record = self.activity_mut(id);
        record.bound = bound;
        let action = record.action;
        if let Some(action) = action {
            self.platform.set_action_bound(action, bound);
        }
    }

    pub(crate) fn add_dependency(&mut self, pred: ActivityId, succ: ActivityId) -> Result<(), SimError> {
        let (pred, succ) = (self.resolve(pred), self.resolve(succ));
        if pred == succ {
            return Err(SimError::InvalidState("activity can't depend on itself".to_string()));
        }
        let succ_state = self.activities[&succ].state;
        if succ_state != ActivityState::Inited && succ_state != ActivityState::Starting {
            return Err(SimError::InvalidState(format!(
                "can't add predecessor to activity {} in state {:?}",
                self.activities[&succ].name, succ_state
            )));
        }
        match self.activities[&pred].state {
            ActivityState::Finished => {}
            ActivityState::Canceled | ActivityState::Failed => self.cancel_activity(succ),
            _ => {
                self.activity_mut(pred).successors.push(succ);
                self.activity_mut(succ).pending_predecessors += 1;
            }
        }
        Ok(())
    }

    /// Assigns a host to an execution created without one.
    pub(crate) fn set_exec_host(&mut self, id: ActivityId, new_host: HostId) -> Result<(), SimError> {
        let record = self.activity_mut(id);
        if !matches!(record.kind, ActivityKind::Exec { .. }) {
            return Err(SimError::InvalidState(format!("activity {} is not an execution", record.name)));
        }
        if record.action.is_some() || record.state.is_terminal() {
            return Err(SimError::InvalidState(format!(
                "can't move activity {} in state {:?}",
                record.name, record.state
            )));
        }
        record.kind = ActivityKind::Exec { host: Some(new_host) };
        if record.state == ActivityState::Starting && record.pending_predecessors == 0 {
            self.launch(id);
        }
        Ok(())
    }

    pub(crate) fn on_activity_completion(&mut self, id: ActivityId, callback: Box<dyn FnOnce(ActivityState)>) {
        let record = self.activity_mut(id);
        if record.state.is_terminal() {
            let state = record.state;
            self.defer(Box::new(move || callback(state)));
        } else {
            record.callbacks.push(callback);
        }
    }
}

fn resolve_alias(aliases: &BTreeMap<ActivityId, ActivityId>, mut id: ActivityId) -> ActivityId {
    while let Some(&target) = aliases.get(&id) {
        id = target;
    }
    id
}
