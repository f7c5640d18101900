//! Actors: cooperatively scheduled logical processes bound to a host.

use std::{collections::BTreeMap, future::Future, rc::Rc};

use futures::{future::LocalBoxFuture, FutureExt};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use dslab_platform::host::HostId;

use crate::{
    activity::{ActivityId, ActivityKind, ActivityState},
    context::ActorContext,
    error::{Failure, SimError},
    executor::Suspend,
    handle::Activity,
    kernel::{Kernel, KernelRef, Timer, TimerKey, Wait, WaitTarget, WakeReason},
    log_debug,
    resource::Host,
    trace::TraceEvent,
};

pub type ActorId = u64;

/// Function creating the code of a restartable actor.
pub type ActorFactory = Rc<dyn Fn(ActorContext) -> LocalBoxFuture<'static, ()>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorState {
    /// Waiting for its start time.
    Created,
    Runnable,
    BlockedOnActivity,
    BlockedOnSync,
    Sleeping,
    Suspended,
    Dead,
}

impl ActorState {
    pub(crate) fn blocked_on(target: &WaitTarget) -> Self {
        match target {
            WaitTarget::Activities { .. } => ActorState::BlockedOnActivity,
            WaitTarget::Sync(_) | WaitTarget::Join(_) => ActorState::BlockedOnSync,
            WaitTarget::Sleep => ActorState::Sleeping,
            WaitTarget::Yield => ActorState::Runnable,
            WaitTarget::Suspended => ActorState::Suspended,
        }
    }
}

pub(crate) struct ActorRecord {
    pub id: ActorId,
    pub name: String,
    pub host: HostId,
    pub state: ActorState,
    pub daemon: bool,
    pub auto_restart: bool,
    pub suspended: bool,
    pub future: Option<LocalBoxFuture<'static, ()>>,
    /// Code of an actor which was not polled yet.
    pub body: Option<ActorBody>,
    pub factory: Option<ActorFactory>,
    pub wait: Option<Wait>,
    pub wake: Option<(u64, WakeReason)>,
    pub on_exit: Vec<Box<dyn FnOnce(bool)>>,
    pub joiners: Vec<ActorId>,
    pub owned: Vec<ActivityId>,
    /// Activities suspended together with the actor.
    pub frozen: Vec<ActivityId>,
    pub kill_timer: Option<TimerKey>,
    pub properties: BTreeMap<String, String>,
}

/// What is needed to start an actor again after its host is turned back on.
pub(crate) struct RestartInfo {
    pub name: String,
    pub factory: ActorFactory,
    pub daemon: bool,
    pub properties: BTreeMap<String, String>,
}

/// Options of a new actor.
pub(crate) struct ActorOptions {
    pub name: String,
    pub host: HostId,
    pub daemon: bool,
    pub auto_restart: bool,
    pub start_time: Option<f64>,
    pub kill_time: Option<f64>,
    pub properties: BTreeMap<String, String>,
}

pub(crate) enum ActorBody {
    Once(Box<dyn FnOnce(ActorContext) -> LocalBoxFuture<'static, ()>>),
    Restartable(ActorFactory),
}

impl Kernel {
    pub(crate) fn add_actor(
        &mut self,
        options: ActorOptions,
        body: ActorBody,
    ) -> Result<ActorId, SimError> {
        let host = self.platform.host(options.host);
        if !host.is_on() {
            return Err(SimError::HostFailure(host.name().to_string()));
        }
        let id = self.next_actor_id;
        self.next_actor_id += 1;
        let factory = match &body {
            ActorBody::Once(_) => None,
            ActorBody::Restartable(factory) => Some(factory.clone()),
        };
        let delayed = options.start_time.is_some_and(|time| time > self.clock);
        self.actors.insert(
            id,
            ActorRecord {
                id,
                name: options.name,
                host: options.host,
                state: ActorState::Created,
                daemon: options.daemon,
                auto_restart: options.auto_restart && factory.is_some(),
                suspended: false,
                future: None,
                body: Some(body),
                factory,
                wait: None,
                wake: None,
                on_exit: Vec::new(),
                joiners: Vec::new(),
                owned: Vec::new(),
                frozen: Vec::new(),
                kill_timer: None,
                properties: options.properties,
            },
        );
        self.stats.actors_created += 1;
        if !options.daemon {
            self.regular_actors += 1;
        }
        if let Some(kill_time) = options.kill_time {
            self.set_kill_time(id, Some(kill_time));
        }
        match options.start_time {
            Some(time) if delayed => {
                self.add_timer(time, Timer::ActorStart(id));
            }
            _ => self.start_actor(id),
        }
        Ok(id)
    }

    pub(crate) fn start_actor(&mut self, id: ActorId) {
        let clock = self.clock;
        let Some(record) = self.actors.get_mut(&id) else {
            return;
        };
        if record.state != ActorState::Created {
            return;
        }
        if record.suspended {
            record.state = ActorState::Suspended;
        } else {
            record.state = ActorState::Runnable;
            self.runnable.push_back(id);
        }
        let event = TraceEvent::ActorStarted {
            time: clock,
            actor: id,
            name: record.name.clone(),
            host: self.platform.host(record.host).name().to_string(),
        };
        log_debug!(self, "actor {} started", self.actors[&id].name);
        self.emit(event);
    }

    pub(crate) fn set_kill_time(&mut self, id: ActorId, time: Option<f64>) {
        let Some(previous) = self.actors.get_mut(&id).map(|a| a.kill_timer.take()) else {
            return;
        };
        if let Some(key) = previous {
            self.cancel_timer(key);
        }
        if let Some(time) = time {
            let key = self.add_timer(time, Timer::ActorKill(id));
            if let Some(record) = self.actors.get_mut(&id) {
                record.kill_timer = Some(key);
            }
        }
    }

    /// Actor code returned.
    pub(crate) fn actor_finished(&mut self, id: ActorId) {
        log_debug!(self, "actor {} finished", self.actors[&id].name);
        self.stats.actors_finished += 1;
        self.terminate_actor(id, false);
    }

    /// Kills the actor: its activities are canceled, it leaves all wait queues and its on-exit callbacks run with
    /// `failed = true`.
    pub(crate) fn kill_actor(&mut self, id: ActorId) {
        if !self.is_alive(id) {
            return;
        }
        log_debug!(self, "killing actor {}", self.actors[&id].name);
        self.stats.actors_killed += 1;

        let owned = self.actors.get(&id).map(|a| a.owned.clone()).unwrap_or_default();
        for activity in owned {
            let activity = self.resolve(activity);
            let record = &self.activities[&activity];
            if record.state.is_terminal() {
                continue;
            }
            // matched communications toward a live peer fail, everything else is canceled
            let peer_alive = match &record.kind {
                ActivityKind::Comm {
                    sender,
                    receiver,
                    detached,
                    ..
                } if record.action.is_some() => {
                    let peer = if *sender == Some(id) { *receiver } else { *sender };
                    *detached || peer.is_some_and(|peer| peer != id && self.is_alive(peer))
                }
                _ => false,
            };
            if peer_alive {
                self.complete_activity(activity, ActivityState::Failed, Some(Failure::Transfer));
            } else {
                self.cancel_activity(activity);
            }
        }
        self.terminate_actor(id, true);
    }

    fn terminate_actor(&mut self, id: ActorId, killed: bool) {
        let clock = self.clock;
        let Some(record) = self.actors.get_mut(&id) else {
            return;
        };
        record.state = ActorState::Dead;
        record.suspended = false;
        record.wake = None;
        let regular = !record.daemon;
        let wait = record.wait.take();
        let future = record.future.take();
        let body = record.body.take();
        let kill_timer = record.kill_timer.take();
        let on_exit = std::mem::take(&mut record.on_exit);
        let joiners = std::mem::take(&mut record.joiners);
        let event = TraceEvent::ActorTerminated {
            time: clock,
            actor: id,
            name: record.name.clone(),
            killed,
        };

        self.runnable.retain(|&a| a != id);
        if let Some(wait) = wait {
            if let Some(key) = wait.timer {
                self.cancel_timer(key);
            }
            self.clear_wait_target(id, &wait.target);
        }
        if let Some(key) = kill_timer {
            self.cancel_timer(key);
        }
        self.release_mutexes(id);
        self.return_semaphore_permits(id);
        if let Some(future) = future {
            self.graveyard.push(Box::new(future));
        }
        if let Some(body) = body {
            self.graveyard.push(Box::new(body));
        }
        for callback in on_exit {
            self.defer(Box::new(move || callback(killed)));
        }
        for joiner in joiners {
            self.wake_join(joiner, id);
        }
        self.emit(event);
        if regular {
            self.drop_regular_actor();
        }
    }

    fn drop_regular_actor(&mut self) {
        self.regular_actors -= 1;
        if self.regular_actors == 0 {
            self.kill_daemons();
        }
    }

    pub(crate) fn daemonize(&mut self, id: ActorId) {
        let Some(record) = self.actors.get_mut(&id) else {
            return;
        };
        if record.daemon {
            return;
        }
        record.daemon = true;
        if record.state != ActorState::Dead {
            self.drop_regular_actor();
        }
    }

    fn wake_join(&mut self, joiner: ActorId, target: ActorId) {
        let token = match self.actors.get(&joiner).and_then(|a| a.wait.as_ref()) {
            Some(Wait {
                token,
                target: WaitTarget::Join(awaited),
                ..
            }) if *awaited == target => *token,
            _ => return,
        };
        self.wake(joiner, token, WakeReason::Ready);
    }

    /// Suspends the actor and the executions and I/O operations it runs.
    pub(crate) fn suspend_actor(&mut self, id: ActorId) {
        let Some(record) = self.actors.get_mut(&id) else {
            return;
        };
        if record.state == ActorState::Dead || record.suspended {
            return;
        }
        record.suspended = true;
        if record.state != ActorState::Created {
            record.state = ActorState::Suspended;
        }
        let owned = record.owned.clone();
        self.runnable.retain(|&a| a != id);
        let mut frozen = Vec::new();
        for activity in owned {
            let activity = self.resolve(activity);
            let record = &self.activities[&activity];
            if record.state == ActivityState::Running
                && matches!(
                    record.kind,
                    ActivityKind::Exec { .. } | ActivityKind::Io { .. } | ActivityKind::Parallel { .. }
                )
            {
                self.suspend_activity(activity);
                frozen.push(activity);
            }
        }
        if let Some(record) = self.actors.get_mut(&id) {
            record.frozen = frozen;
        }
        log_debug!(self, "actor {} suspended", self.actors[&id].name);
    }

    pub(crate) fn resume_actor(&mut self, id: ActorId) {
        let Some(record) = self.actors.get_mut(&id) else {
            return;
        };
        if record.state == ActorState::Dead || !record.suspended {
            return;
        }
        record.suspended = false;
        let frozen = std::mem::take(&mut record.frozen);
        let self_suspended = matches!(
            record.wait,
            Some(Wait {
                target: WaitTarget::Suspended,
                ..
            })
        );
        if record.wake.is_some() {
            record.state = ActorState::Runnable;
            self.runnable.push_back(id);
        } else if let Some(wait) = record.wait.as_ref() {
            record.state = ActorState::blocked_on(&wait.target);
        } else if record.state == ActorState::Suspended {
            record.state = ActorState::Runnable;
            self.runnable.push_back(id);
        }
        for activity in frozen {
            self.resume_activity(activity);
        }
        if self_suspended {
            self.wake_waiting(id, WakeReason::Ready);
        }
        log_debug!(self, "actor {} resumed", self.actors[&id].name);
    }

    /// Moves the actor to another host. Activities which are already running stay where they are.
    pub(crate) fn migrate_actor(&mut self, id: ActorId, host: HostId) {
        if let Some(record) = self.actors.get_mut(&id) {
            record.host = host;
        }
    }
}

/// Handle of an actor.
#[derive(Clone)]
pub struct ActorHandle {
    kernel: KernelRef,
    id: ActorId,
}

impl ActorHandle {
    pub(crate) fn new(kernel: KernelRef, id: ActorId) -> Self {
        Self { kernel, id }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> String {
        self.kernel.borrow().actors[&self.id].name.clone()
    }

    pub fn host(&self) -> Host {
        let host = self.kernel.borrow().actors[&self.id].host;
        Host::new(self.kernel.clone(), host)
    }

    pub fn state(&self) -> ActorState {
        self.kernel.borrow().actors[&self.id].state
    }

    pub fn is_alive(&self) -> bool {
        self.kernel.borrow().is_alive(self.id)
    }

    pub fn is_daemon(&self) -> bool {
        self.kernel.borrow().actors[&self.id].daemon
    }

    pub fn is_suspended(&self) -> bool {
        self.kernel.borrow().actors[&self.id].suspended
    }

    /// Daemons do not keep the simulation alive and are killed when the last regular actor dies.
    pub fn daemonize(&self) {
        self.kernel.borrow_mut().daemonize(self.id);
    }

    /// Restart the actor when its host is turned back on. Only has effect for restartable actors.
    pub fn set_auto_restart(&self, auto_restart: bool) {
        if let Some(record) = self.kernel.borrow_mut().actors.get_mut(&self.id) {
            record.auto_restart = auto_restart && record.factory.is_some();
        }
    }

    /// Registers a callback invoked when the actor terminates, the argument tells whether it was killed.
    pub fn on_exit<F: FnOnce(bool) + 'static>(&self, callback: F) {
        let mut kernel = self.kernel.borrow_mut();
        if kernel.is_alive(self.id) {
            if let Some(record) = kernel.actors.get_mut(&self.id) {
                record.on_exit.push(Box::new(callback));
            }
        } else {
            kernel.defer(Box::new(move || callback(true)));
        }
    }

    pub fn kill(&self) {
        self.kernel.borrow_mut().kill_actor(self.id);
    }

    /// Activities created by the actor which are not complete yet.
    pub fn activities(&self) -> Vec<Activity> {
        let kernel = self.kernel.borrow();
        let Some(record) = kernel.actors.get(&self.id) else {
            return Vec::new();
        };
        record
            .owned
            .iter()
            .map(|&id| kernel.resolve(id))
            .unique()
            .map(|id| Activity::new(self.kernel.clone(), id))
            .collect()
    }

    /// Kills the actor at a given time, `None` cancels the scheduled kill.
    pub fn set_kill_time(&self, time: Option<f64>) {
        self.kernel.borrow_mut().set_kill_time(self.id, time);
    }

    pub fn suspend(&self) {
        self.kernel.borrow_mut().suspend_actor(self.id);
    }

    pub fn resume(&self) {
        self.kernel.borrow_mut().resume_actor(self.id);
    }

    pub fn set_host(&self, host: &Host) {
        self.kernel.borrow_mut().migrate_actor(self.id, host.id());
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.kernel.borrow().actors[&self.id].properties.get(key).cloned()
    }

    pub fn set_property(&self, key: &str, value: &str) {
        if let Some(record) = self.kernel.borrow_mut().actors.get_mut(&self.id) {
            record.properties.insert(key.to_string(), value.to_string());
        }
    }

    /// Blocks the calling actor until this actor terminates.
    pub async fn join(&self) -> Result<(), SimError> {
        self.join_until(None).await
    }

    /// Blocks the calling actor until this actor terminates or the timeout elapses.
    pub async fn join_for(&self, timeout: f64) -> Result<(), SimError> {
        let deadline = self.kernel.borrow().clock + timeout;
        self.join_until(Some(deadline)).await
    }

    async fn join_until(&self, deadline: Option<f64>) -> Result<(), SimError> {
        let suspend = {
            let mut kernel = self.kernel.borrow_mut();
            let me = kernel.current_actor();
            if me == self.id {
                return Err(SimError::InvalidState("actor can't join itself".to_string()));
            }
            if !kernel.is_alive(self.id) {
                return Ok(());
            }
            let token = if deadline.is_some_and(|deadline| deadline <= kernel.clock) {
                kernel.immediate_timeout(me)
            } else {
                if let Some(record) = kernel.actors.get_mut(&self.id) {
                    record.joiners.push(me);
                }
                kernel.begin_wait(me, WaitTarget::Join(self.id), deadline)
            };
            Suspend::new(self.kernel.clone(), me, token)
        };
        match suspend.await {
            WakeReason::Timeout => Err(SimError::Timeout),
            _ => Ok(()),
        }
    }
}

/// Builder of a new actor.
pub struct ActorBuilder {
    kernel: KernelRef,
    options: ActorOptions,
}

impl ActorBuilder {
    pub(crate) fn new(kernel: KernelRef, name: &str, host: HostId) -> Self {
        Self {
            kernel,
            options: ActorOptions {
                name: name.to_string(),
                host,
                daemon: false,
                auto_restart: false,
                start_time: None,
                kill_time: None,
                properties: BTreeMap::new(),
            },
        }
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.options.daemon = daemon;
        self
    }

    /// Only restartable actors (see [spawn_restartable](Self::spawn_restartable)) can be restarted.
    pub fn auto_restart(mut self, auto_restart: bool) -> Self {
        self.options.auto_restart = auto_restart;
        self
    }

    pub fn start_time(mut self, time: f64) -> Self {
        self.options.start_time = Some(time);
        self
    }

    pub fn kill_time(mut self, time: f64) -> Self {
        self.options.kill_time = Some(time);
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.options.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// Creates the actor running `f`.
    pub fn spawn<F, Fut>(self, f: F) -> Result<ActorHandle, SimError>
    where
        F: FnOnce(ActorContext) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let body = ActorBody::Once(Box::new(move |ctx| f(ctx).boxed_local()));
        self.spawn_body(body)
    }

    /// Creates the actor running `f`, which can be called again to restart the actor.
    pub fn spawn_restartable<F, Fut>(self, f: F) -> Result<ActorHandle, SimError>
    where
        F: Fn(ActorContext) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let factory: ActorFactory = Rc::new(move |ctx| f(ctx).boxed_local());
        self.spawn_body(ActorBody::Restartable(factory))
    }

    pub(crate) fn spawn_body(self, body: ActorBody) -> Result<ActorHandle, SimError> {
        let id = self.kernel.borrow_mut().add_actor(self.options, body)?;
        Ok(ActorHandle::new(self.kernel, id))
    }
}
