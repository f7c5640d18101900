//! Simulation kernel: the logical clock, the registries of actors and activities, timers, and the state of
//! mailboxes and synchronization objects.
//!
//! All state lives in a single [Kernel] shared by the handles through `Rc<RefCell<_>>`. The kernel is never
//! borrowed while actor code runs, see [executor](crate::executor).

use std::{
    any::Any,
    cell::RefCell,
    cmp::Ordering,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
};

use rand::SeedableRng;
use rand_pcg::Pcg64;

use dslab_platform::{host::HostId, link::LinkId, model::ActionId, platform::Platform};

use crate::{
    activity::{ActivityId, ActivityRecord},
    actor::{ActorId, ActorRecord, ActorState, RestartInfo},
    config::EngineConfig,
    log_debug, log_warn,
    mailbox::{MailboxState, QueueState},
    run_stats::RunStats,
    sync::{SyncId, SyncObject},
    trace::{Trace, TraceEvent, TraceSink},
};

pub(crate) type KernelRef = Rc<RefCell<Kernel>>;

/// Simulation time with a total order, used as a timer key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct TimerTime(pub f64);

impl Eq for TimerTime {}

impl PartialOrd for TimerTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Timers fire in (time, registration order).
pub(crate) type TimerKey = (TimerTime, u64);

pub(crate) enum Timer {
    WaitTimeout { actor: ActorId, token: u64 },
    ActorStart(ActorId),
    ActorKill(ActorId),
    HostAvailability { host: HostId, scale: f64 },
    HostState { host: HostId, on: bool },
    LinkAvailability { link: LinkId, scale: f64 },
    LinkState { link: LinkId, on: bool },
}

/// Outcome of a blocking call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WakeReason {
    Ready,
    Timeout,
    /// One of the awaited activities reached a terminal state.
    Activity(ActivityId),
}

pub(crate) enum WaitTarget {
    Activities { ids: Vec<ActivityId>, all: bool },
    Sync(SyncId),
    Sleep,
    Yield,
    Join(ActorId),
    Suspended,
}

/// Blocking call of an actor. A wake carrying another token is discarded.
pub(crate) struct Wait {
    pub token: u64,
    pub target: WaitTarget,
    pub timer: Option<TimerKey>,
}

pub(crate) struct Kernel {
    pub clock: f64,
    pub config: EngineConfig,
    pub platform: Platform,
    pub actors: BTreeMap<ActorId, ActorRecord>,
    pub runnable: VecDeque<ActorId>,
    /// Actor whose code is being executed.
    pub current: Option<ActorId>,
    pub next_actor_id: ActorId,
    /// Number of alive actors which are not daemons.
    pub regular_actors: usize,
    pub activities: BTreeMap<ActivityId, ActivityRecord>,
    pub next_activity_id: ActivityId,
    /// Activities merged into another one when two mailbox requests are matched.
    pub aliases: BTreeMap<ActivityId, ActivityId>,
    pub action_activity: BTreeMap<ActionId, ActivityId>,
    timers: BTreeMap<TimerKey, Timer>,
    next_timer_seq: u64,
    next_wait_token: u64,
    pub mailboxes: BTreeMap<String, MailboxState>,
    pub queues: BTreeMap<String, QueueState>,
    pub syncs: BTreeMap<SyncId, SyncObject>,
    pub next_sync_id: SyncId,
    /// Actors to be restarted when their host is turned on.
    pub restarts: BTreeMap<HostId, Vec<RestartInfo>>,
    pub rng: Pcg64,
    pub trace: Option<Trace>,
    pub sinks: Vec<Box<dyn TraceSink>>,
    pub stats: RunStats,
    /// Callbacks which must run after the kernel borrow is released.
    pub deferred: Vec<Box<dyn FnOnce()>>,
    /// Code of terminated actors, dropped after the kernel borrow is released.
    pub graveyard: Vec<Box<dyn Any>>,
}

impl Kernel {
    pub fn new(platform: Platform, config: EngineConfig) -> Self {
        let trace = config
            .record_trace
            .then(|| Trace::new(platform.hosts().iter().map(|h| h.name().to_string()).collect()));
        Self {
            clock: 0.,
            rng: Pcg64::seed_from_u64(config.seed),
            config,
            platform,
            actors: BTreeMap::new(),
            runnable: VecDeque::new(),
            current: None,
            next_actor_id: 0,
            regular_actors: 0,
            activities: BTreeMap::new(),
            next_activity_id: 0,
            aliases: BTreeMap::new(),
            action_activity: BTreeMap::new(),
            timers: BTreeMap::new(),
            next_timer_seq: 0,
            next_wait_token: 0,
            mailboxes: BTreeMap::new(),
            queues: BTreeMap::new(),
            syncs: BTreeMap::new(),
            next_sync_id: 0,
            restarts: BTreeMap::new(),
            trace,
            sinks: Vec::new(),
            stats: RunStats::new(),
            deferred: Vec::new(),
            graveyard: Vec::new(),
        }
    }

    pub fn time(&self) -> f64 {
        self.clock
    }

    pub fn name(&self) -> &str {
        "kernel"
    }

    /// Actor whose code is being executed. Blocking operations are only valid inside actor code.
    pub fn current_actor(&self) -> ActorId {
        self.current
            .expect("blocking operations must be called from actor code")
    }

    pub fn emit(&mut self, event: TraceEvent) {
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.on_event(&event) {
                log::warn!("[{:.3} WARN  kernel] trace sink failed: {}", self.clock, e);
            }
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.log(event);
        }
    }

    pub fn defer(&mut self, callback: Box<dyn FnOnce()>) {
        self.deferred.push(callback);
    }

    // Timers ----------------------------------------------------------------------------------------------------------

    pub fn add_timer(&mut self, time: f64, timer: Timer) -> TimerKey {
        let key = (TimerTime(time.max(self.clock)), self.next_timer_seq);
        self.next_timer_seq += 1;
        self.timers.insert(key, timer);
        key
    }

    pub fn cancel_timer(&mut self, key: TimerKey) {
        self.timers.remove(&key);
    }

    // Waits -----------------------------------------------------------------------------------------------------------

    /// Registers a blocking call of an actor and returns its token.
    pub fn begin_wait(&mut self, actor: ActorId, target: WaitTarget, deadline: Option<f64>) -> u64 {
        let token = self.next_wait_token;
        self.next_wait_token += 1;
        let timer = deadline.map(|time| self.add_timer(time, Timer::WaitTimeout { actor, token }));
        let record = self.actors.get_mut(&actor).expect("waiting actor is registered");
        record.state = if record.suspended {
            ActorState::Suspended
        } else {
            ActorState::blocked_on(&target)
        };
        record.wait = Some(Wait { token, target, timer });
        record.wake = None;
        token
    }

    /// Completes the blocking call identified by `token` and makes the actor runnable.
    pub fn wake(&mut self, actor: ActorId, token: u64, reason: WakeReason) -> bool {
        let Some(record) = self.actors.get_mut(&actor) else {
            return false;
        };
        if record.state == ActorState::Dead || record.wait.as_ref().map(|w| w.token) != Some(token) {
            return false;
        }
        let timer = record.wait.take().and_then(|wait| wait.timer);
        record.wake = Some((token, reason));
        if record.suspended {
            record.state = ActorState::Suspended;
        } else {
            record.state = ActorState::Runnable;
            self.runnable.push_back(actor);
        }
        if let Some(key) = timer {
            self.timers.remove(&key);
        }
        true
    }

    /// Wakes the actor from its current blocking call, whatever it is.
    pub fn wake_waiting(&mut self, actor: ActorId, reason: WakeReason) -> bool {
        let token = self.actors.get(&actor).and_then(|a| a.wait.as_ref()).map(|w| w.token);
        match token {
            Some(token) => self.wake(actor, token, reason),
            None => false,
        }
    }

    /// Returns the wake reason recorded for the blocking call, if the actor was woken.
    pub fn take_wake(&mut self, actor: ActorId, token: u64) -> Option<WakeReason> {
        let record = self.actors.get_mut(&actor)?;
        match record.wake {
            Some((wake_token, reason)) if wake_token == token => {
                record.wake = None;
                Some(reason)
            }
            _ => None,
        }
    }

    /// Removes the actor from the wait queues of its blocking call target.
    pub fn clear_wait_target(&mut self, actor: ActorId, target: &WaitTarget) {
        match target {
            WaitTarget::Sync(sync) => self.remove_from_sync(*sync, actor),
            WaitTarget::Join(other) => {
                if let Some(record) = self.actors.get_mut(other) {
                    record.joiners.retain(|&a| a != actor);
                }
            }
            WaitTarget::Activities { ids, .. } => {
                for id in ids.iter() {
                    let id = self.resolve(*id);
                    if let Some(record) = self.activities.get_mut(&id) {
                        record.waiters.retain(|&a| a != actor);
                    }
                }
            }
            WaitTarget::Sleep | WaitTarget::Yield | WaitTarget::Suspended => {}
        }
    }

    fn timeout_wait(&mut self, actor: ActorId, token: u64) {
        let target = match self.actors.get_mut(&actor) {
            Some(record) if record.wait.as_ref().map(|w| w.token) == Some(token) => {
                match record.wait.as_mut() {
                    Some(wait) => {
                        wait.timer = None;
                        std::mem::replace(&mut wait.target, WaitTarget::Sleep)
                    }
                    None => return,
                }
            }
            _ => return,
        };
        self.clear_wait_target(actor, &target);
        self.wake(actor, token, WakeReason::Timeout);
    }

    // Clock -----------------------------------------------------------------------------------------------------------

    /// Time of the next activity completion or timer, `None` if nothing can happen anymore.
    pub fn next_event_time(&mut self) -> Option<f64> {
        let model = self.platform.next_event_delay().map(|delay| self.clock + delay);
        let timer = self.timers.keys().next().map(|(time, _)| time.0);
        match (model, timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Advances the clock, completes finished activities in creation order and then fires due timers.
    pub fn advance_to(&mut self, time: f64) {
        assert!(
            time >= self.clock - self.config.precision,
            "clock can't go backwards: {} -> {}",
            self.clock,
            time
        );
        let delta = (time - self.clock).max(0.);
        let finished = self.platform.advance(delta);
        self.clock = self.clock.max(time);

        let mut completed = finished
            .iter()
            .filter_map(|action| self.action_activity.remove(action))
            .collect::<Vec<_>>();
        completed.sort_unstable();
        for id in completed {
            if let Some(record) = self.activities.get_mut(&id) {
                record.action = None;
            }
            self.complete_activity(id, crate::activity::ActivityState::Finished, None);
        }

        while let Some((&key, _)) = self.timers.first_key_value() {
            if key.0 .0 > self.clock {
                break;
            }
            if let Some(timer) = self.timers.remove(&key) {
                self.fire(timer);
            }
        }
    }

    fn fire(&mut self, timer: Timer) {
        match timer {
            Timer::WaitTimeout { actor, token } => self.timeout_wait(actor, token),
            Timer::ActorStart(actor) => self.start_actor(actor),
            Timer::ActorKill(actor) => {
                if let Some(record) = self.actors.get_mut(&actor) {
                    record.kill_timer = None;
                }
                log_debug!(self, "kill time of actor {} reached", actor);
                self.kill_actor(actor);
            }
            Timer::HostAvailability { host, scale } => {
                self.platform.set_host_availability(host, scale);
            }
            Timer::HostState { host, on } => self.set_host_state(host, on),
            Timer::LinkAvailability { link, scale } => {
                self.platform.set_link_availability(link, scale);
            }
            Timer::LinkState { link, on } => self.set_link_state(link, on),
        }
    }

    // Actor bookkeeping -----------------------------------------------------------------------------------------------

    pub fn is_alive(&self, actor: ActorId) -> bool {
        self.actors.get(&actor).is_some_and(|a| a.state != ActorState::Dead)
    }

    pub fn has_live_regular_actors(&self) -> bool {
        self.regular_actors > 0
    }

    pub fn kill_daemons(&mut self) {
        let daemons = self
            .actors
            .values()
            .filter(|a| a.state != ActorState::Dead && a.daemon)
            .map(|a| a.id)
            .collect::<Vec<_>>();
        if !daemons.is_empty() {
            log_debug!(self, "last regular actor is dead, killing {} daemons", daemons.len());
        }
        for actor in daemons {
            self.kill_actor(actor);
        }
    }

    /// Records actors which are blocked while no event can wake them.
    pub fn report_deadlock(&mut self) {
        let blocked = self
            .actors
            .values()
            .filter(|a| a.state != ActorState::Dead && !a.daemon)
            .map(|a| format!("{} ({:?})", a.name, a.state))
            .collect::<Vec<_>>();
        if blocked.is_empty() {
            return;
        }
        log_warn!(
            self,
            "deadlock: {} actors are blocked and no event can wake them: {}",
            blocked.len(),
            blocked.join(", ")
        );
        self.stats.deadlocked_actors = blocked;
    }

    pub fn finalize_stats(&mut self) {
        let energy = self
            .platform
            .hosts()
            .iter()
            .filter(|h| h.energy() > 0.)
            .map(|h| (h.name().to_string(), h.energy()))
            .collect();
        let clock = self.clock;
        self.stats.finalize(clock, energy);
    }
}
