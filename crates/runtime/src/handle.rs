//! Handles of activities.
//!
//! A handle is a cheap reference to an activity stored in the kernel. All handles of a matched mailbox request
//! (the put side and the get side) refer to the same communication.

use std::{any::Any, ops::Deref};

use crate::{
    activity::{ActivityId, ActivityKind, ActivityState},
    actor::ActorHandle,
    error::SimError,
    executor::Suspend,
    kernel::{KernelRef, WakeReason},
    resource::Host,
};

/// Handle of an activity of any kind.
#[derive(Clone)]
pub struct Activity {
    kernel: KernelRef,
    id: ActivityId,
}

impl Activity {
    pub(crate) fn new(kernel: KernelRef, id: ActivityId) -> Self {
        Self { kernel, id }
    }

    pub(crate) fn kernel(&self) -> &KernelRef {
        &self.kernel
    }

    /// Identifier of the activity. Matched mailbox requests share the identifier of the older request.
    pub fn id(&self) -> ActivityId {
        self.kernel.borrow().resolve(self.id)
    }

    pub fn name(&self) -> String {
        self.kernel.borrow().activity(self.id).name.clone()
    }

    pub fn state(&self) -> ActivityState {
        self.kernel.borrow().activity(self.id).state
    }

    /// Remaining amount of work (flops or bytes).
    pub fn remaining(&self) -> f64 {
        self.kernel.borrow().activity_remaining(self.id)
    }

    /// Remaining fraction of work, 0 for empty activities.
    pub fn remaining_ratio(&self) -> f64 {
        let kernel = self.kernel.borrow();
        let amount = kernel.activity(self.id).amount;
        if amount > 0. {
            kernel.activity_remaining(self.id) / amount
        } else {
            0.
        }
    }

    pub fn start_time(&self) -> Option<f64> {
        self.kernel.borrow().activity(self.id).start_time
    }

    pub fn finish_time(&self) -> Option<f64> {
        self.kernel.borrow().activity(self.id).finish_time
    }

    /// Whether the activity reached a terminal state.
    pub fn test(&self) -> bool {
        self.state().is_terminal()
    }

    /// Outcome of a terminal activity.
    pub fn result(&self) -> Result<(), SimError> {
        self.kernel.borrow().activity(self.id).result()
    }

    pub fn start(&self) -> Result<(), SimError> {
        self.kernel.borrow_mut().start_activity(self.id)
    }

    /// Cancels the activity, a terminal activity is not affected.
    pub fn cancel(&self) {
        self.kernel.borrow_mut().cancel_activity(self.id);
    }

    pub fn suspend(&self) {
        self.kernel.borrow_mut().suspend_activity(self.id);
    }

    pub fn resume(&self) {
        self.kernel.borrow_mut().resume_activity(self.id);
    }

    /// Sets the sharing weight of the activity, 1 by default.
    pub fn set_priority(&self, priority: f64) -> Result<(), SimError> {
        self.kernel.borrow_mut().set_activity_priority(self.id, priority)
    }

    /// Makes `successor` start only after this activity finishes.
    pub fn add_successor(&self, successor: &Activity) -> Result<(), SimError> {
        self.kernel.borrow_mut().add_dependency(self.id, successor.id)
    }

    /// Registers a callback invoked with the terminal state of the activity.
    pub fn on_completion<F: FnOnce(ActivityState) + 'static>(&self, callback: F) {
        self.kernel
            .borrow_mut()
            .on_activity_completion(self.id, Box::new(callback));
    }

    /// Starts the activity if needed and waits for its completion.
    pub async fn wait(&self) -> Result<(), SimError> {
        self.wait_until_deadline(None).await
    }

    /// Waits for the completion at most `timeout` seconds. On timeout the activity keeps running.
    pub async fn wait_for(&self, timeout: f64) -> Result<(), SimError> {
        let deadline = self.kernel.borrow().clock + timeout;
        self.wait_until_deadline(Some(deadline)).await
    }

    /// Waits for the completion until the given moment of time. On timeout the activity keeps running.
    pub async fn wait_until(&self, deadline: f64) -> Result<(), SimError> {
        self.wait_until_deadline(Some(deadline)).await
    }

    async fn wait_until_deadline(&self, deadline: Option<f64>) -> Result<(), SimError> {
        let suspend = {
            let mut kernel = self.kernel.borrow_mut();
            if kernel.activity(self.id).state == ActivityState::Inited {
                kernel.start_activity(self.id)?;
            }
            kernel
                .wait_activities(&[self.id], true, deadline)
                .map(|(actor, token)| Suspend::new(self.kernel.clone(), actor, token))
        };
        if let Some(suspend) = suspend {
            if suspend.await == WakeReason::Timeout {
                return Err(SimError::Timeout);
            }
        }
        self.result()
    }

    pub(crate) fn take_payload<T: 'static>(&self) -> Result<T, SimError> {
        let mut kernel = self.kernel.borrow_mut();
        let record = kernel.activity_mut(self.id);
        if record.state != ActivityState::Finished {
            return Err(SimError::InvalidState(format!(
                "payload of {} is not available in state {:?}",
                record.name, record.state
            )));
        }
        let slot = match &mut record.kind {
            ActivityKind::Comm { payload, .. } | ActivityKind::Message { payload, .. } => payload,
            _ => {
                return Err(SimError::InvalidState(format!("activity {} carries no payload", record.name)));
            }
        };
        let payload: Box<dyn Any> = slot
            .take()
            .ok_or_else(|| SimError::InvalidState("payload was already taken".to_string()))?;
        match payload.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(payload) => {
                *slot = Some(payload);
                Err(SimError::PayloadType)
            }
        }
    }
}

macro_rules! activity_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(Activity);

        impl $name {
            pub(crate) fn new(kernel: KernelRef, id: ActivityId) -> Self {
                Self(Activity::new(kernel, id))
            }
        }

        impl Deref for $name {
            type Target = Activity;

            fn deref(&self) -> &Activity {
                &self.0
            }
        }

        impl From<$name> for Activity {
            fn from(handle: $name) -> Activity {
                handle.0
            }
        }
    };
}

activity_handle!(
    /// Computation on a host.
    Exec
);
activity_handle!(
    /// Transfer of a payload between two actors matched through a mailbox.
    Comm
);
activity_handle!(
    /// Disk read or write.
    Io
);
activity_handle!(
    /// Message exchanged through a message queue.
    Mess
);

impl Exec {
    /// Limits the speed of the execution, `None` removes the limit.
    pub fn set_bound(&self, bound: Option<f64>) {
        self.kernel.borrow_mut().set_activity_bound(self.id, bound);
    }

    /// Assigns the execution to a host. Only possible before the execution launched.
    pub fn set_host(&self, host: &Host) -> Result<(), SimError> {
        self.kernel.borrow_mut().set_exec_host(self.id, host.id())
    }

    pub fn host(&self) -> Option<Host> {
        let host = match self.kernel.borrow().activity(self.id).kind {
            ActivityKind::Exec { host } => host,
            _ => None,
        };
        host.map(|host| Host::new(self.kernel.clone(), host))
    }
}

impl Comm {
    /// Limits the transfer rate, `None` removes the limit.
    pub fn set_rate(&self, rate: Option<f64>) {
        self.kernel.borrow_mut().set_activity_bound(self.id, rate);
    }

    /// Takes the transferred payload out of a finished communication.
    pub fn get_payload<T: 'static>(&self) -> Result<T, SimError> {
        self.take_payload()
    }

    pub fn sender(&self) -> Option<ActorHandle> {
        self.endpoint(true)
    }

    pub fn receiver(&self) -> Option<ActorHandle> {
        self.endpoint(false)
    }

    fn endpoint(&self, sender_side: bool) -> Option<ActorHandle> {
        let actor = match &self.kernel.borrow().activity(self.id).kind {
            ActivityKind::Comm { sender, receiver, .. } => {
                if sender_side {
                    *sender
                } else {
                    *receiver
                }
            }
            _ => None,
        };
        actor.map(|actor| ActorHandle::new(self.kernel.clone(), actor))
    }

    pub fn is_detached(&self) -> bool {
        matches!(
            self.kernel.borrow().activity(self.id).kind,
            ActivityKind::Comm { detached: true, .. }
        )
    }
}

impl Mess {
    /// Takes the message out of a finished get request.
    pub fn get_payload<T: 'static>(&self) -> Result<T, SimError> {
        self.take_payload()
    }
}

/// Collection of activities which can be awaited together.
#[derive(Default)]
pub struct ActivitySet {
    activities: Vec<Activity>,
    failed: Vec<Activity>,
}

impl ActivitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<A: Into<Activity>>(&mut self, activity: A) {
        self.activities.push(activity.into());
    }

    pub fn erase(&mut self, activity: &Activity) {
        let id = activity.id();
        self.activities.retain(|a| a.id() != id);
    }

    pub fn size(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    pub fn at(&self, index: usize) -> Option<&Activity> {
        self.activities.get(index)
    }

    /// Takes an activity which failed or was canceled during [wait_any](Self::wait_any).
    pub fn take_failed(&mut self) -> Option<Activity> {
        if self.failed.is_empty() {
            None
        } else {
            Some(self.failed.remove(0))
        }
    }

    pub fn has_failed(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Waits for all activities, starting those which were not started. The set is emptied.
    ///
    /// Returns the error of the first activity (in the set order) which did not finish.
    pub async fn wait_all(&mut self) -> Result<(), SimError> {
        self.wait_all_until(None).await
    }

    /// Waits for all activities at most `timeout` seconds. On timeout the set is left untouched.
    pub async fn wait_all_for(&mut self, timeout: f64) -> Result<(), SimError> {
        let Some(kernel) = self.activities.first().map(|a| a.kernel().clone()) else {
            return Ok(());
        };
        let deadline = kernel.borrow().clock + timeout;
        self.wait_all_until(Some(deadline)).await
    }

    async fn wait_all_until(&mut self, deadline: Option<f64>) -> Result<(), SimError> {
        let Some(kernel) = self.activities.first().map(|a| a.kernel().clone()) else {
            return Ok(());
        };
        let suspend = {
            let mut k = kernel.borrow_mut();
            for activity in self.activities.iter() {
                if k.activity(activity.id).state == ActivityState::Inited {
                    k.start_activity(activity.id)?;
                }
            }
            let ids = self.activities.iter().map(|a| a.id).collect::<Vec<_>>();
            k.wait_activities(&ids, true, deadline)
                .map(|(actor, token)| Suspend::new(kernel.clone(), actor, token))
        };
        if let Some(suspend) = suspend {
            if suspend.await == WakeReason::Timeout {
                return Err(SimError::Timeout);
            }
        }
        let activities = std::mem::take(&mut self.activities);
        activities.iter().map(|a| a.result()).collect()
    }

    /// Waits until any activity of the set completes, removes it from the set and returns it.
    ///
    /// If the completed activity failed or was canceled, it is kept for [take_failed](Self::take_failed) and its error
    /// is returned.
    pub async fn wait_any(&mut self) -> Result<Activity, SimError> {
        self.wait_any_until(None).await
    }

    pub async fn wait_any_for(&mut self, timeout: f64) -> Result<Activity, SimError> {
        let Some(kernel) = self.activities.first().map(|a| a.kernel().clone()) else {
            return Err(SimError::InvalidState("waiting on an empty activity set".to_string()));
        };
        let deadline = kernel.borrow().clock + timeout;
        self.wait_any_until(Some(deadline)).await
    }

    async fn wait_any_until(&mut self, deadline: Option<f64>) -> Result<Activity, SimError> {
        let Some(kernel) = self.activities.first().map(|a| a.kernel().clone()) else {
            return Err(SimError::InvalidState("waiting on an empty activity set".to_string()));
        };
        let suspend = {
            let mut k = kernel.borrow_mut();
            let ids = self.activities.iter().map(|a| a.id).collect::<Vec<_>>();
            k.wait_activities(&ids, false, deadline)
                .map(|(actor, token)| Suspend::new(kernel.clone(), actor, token))
        };
        let completed = match suspend {
            Some(suspend) => match suspend.await {
                WakeReason::Timeout => return Err(SimError::Timeout),
                WakeReason::Activity(id) => self.activities.iter().position(|a| a.id() == id),
                WakeReason::Ready => None,
            },
            None => None,
        };
        let index = completed
            .or_else(|| self.activities.iter().position(|a| a.test()))
            .ok_or_else(|| SimError::InvalidState("no activity of the set is complete".to_string()))?;
        let activity = self.activities.remove(index);
        match activity.result() {
            Ok(()) => Ok(activity),
            Err(e) => {
                self.failed.push(activity);
                Err(e)
            }
        }
    }

    /// Removes and returns a completed activity without blocking.
    pub fn test_any(&mut self) -> Option<Activity> {
        let index = self.activities.iter().position(|a| a.test())?;
        Some(self.activities.remove(index))
    }
}
