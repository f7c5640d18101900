//! Mailboxes and message queues: named rendezvous points matching put and get requests.
//!
//! A mailbox turns each matched pair of requests into a single communication. The older request survives and the
//! newer one is merged into it, so the handles of both sides refer to the same activity. A message queue matches
//! requests the same way but exchanges payloads instantly through two message activities.

use std::{any::Any, collections::VecDeque};

use crate::{
    activity::{ActivityId, ActivityKind, ActivityState},
    actor::{ActorHandle, ActorId},
    error::SimError,
    handle::{Comm, Mess},
    kernel::{Kernel, KernelRef},
    log_debug, log_warn,
};

#[derive(Default)]
pub(crate) struct MailboxState {
    pub puts: VecDeque<ActivityId>,
    pub gets: VecDeque<ActivityId>,
    /// Communications already sent to the permanent receiver.
    pub ready: VecDeque<ActivityId>,
    pub receiver: Option<ActorId>,
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub puts: VecDeque<ActivityId>,
    pub gets: VecDeque<ActivityId>,
}

impl Kernel {
    /// Matches a started communication request with a pending request of the opposite direction or queues it.
    pub(crate) fn post_comm(&mut self, id: ActivityId) {
        let (name, is_put) = match &self.activity(id).kind {
            ActivityKind::Comm {
                mailbox: Some(mailbox),
                src_host,
                ..
            } => (mailbox.clone(), src_host.is_some()),
            _ => panic!("activity {} is not a mailbox request", id),
        };
        let receiver = self
            .mailboxes
            .get(&name)
            .and_then(|mailbox| mailbox.receiver)
            .filter(|&receiver| self.is_alive(receiver));
        let mailbox = self.mailboxes.entry(name.clone()).or_default();
        if is_put {
            if let Some(get) = mailbox.gets.pop_front() {
                self.merge_comms(get, id);
                self.launch(get);
            } else if let Some(receiver) = receiver {
                mailbox.ready.push_back(id);
                let host = self.actors[&receiver].host;
                if let ActivityKind::Comm {
                    receiver: slot,
                    dst_host,
                    ..
                } = &mut self.activity_mut(id).kind
                {
                    *slot = Some(receiver);
                    *dst_host = Some(host);
                }
                log_debug!(self, "{} is sent eagerly to the receiver of mailbox {}", id, name);
                self.launch(id);
            } else {
                mailbox.puts.push_back(id);
                self.activity_mut(id).state = ActivityState::Starting;
            }
        } else if let Some(ready) = mailbox.ready.pop_front() {
            self.merge_comms(ready, id);
        } else if let Some(put) = mailbox.puts.pop_front() {
            self.merge_comms(put, id);
            self.launch(put);
        } else {
            mailbox.gets.push_back(id);
            self.activity_mut(id).state = ActivityState::Starting;
        }
    }

    /// Merges the `newer` request into the `older` one. All references to `newer` resolve to `older` afterwards.
    fn merge_comms(&mut self, older: ActivityId, newer: ActivityId) {
        let mut merged = self
            .activities
            .remove(&newer)
            .expect("matched request is registered");
        self.aliases.insert(newer, older);
        let record = self.activities.get_mut(&older).expect("matched request is registered");
        if let (
            ActivityKind::Comm {
                sender,
                receiver,
                src_host,
                dst_host,
                payload,
                detached,
                ..
            },
            ActivityKind::Comm {
                sender: new_sender,
                receiver: new_receiver,
                src_host: new_src,
                dst_host: new_dst,
                payload: new_payload,
                detached: new_detached,
                ..
            },
        ) = (&mut record.kind, &mut merged.kind)
        {
            if new_src.is_some() {
                // newer request is the put side
                *sender = *new_sender;
                *src_host = *new_src;
                *payload = new_payload.take();
                record.amount = merged.amount;
                record.remaining = merged.remaining;
            } else {
                *receiver = *new_receiver;
                if dst_host.is_none() {
                    *dst_host = *new_dst;
                }
            }
            *detached |= *new_detached;
        }
        if record.bound.is_none() {
            record.bound = merged.bound;
        }
        record.priority = record.priority.max(merged.priority);
        record.suspend_requested |= merged.suspend_requested;
        record.callbacks.append(&mut merged.callbacks);
        for actor in merged.waiters {
            if !record.waiters.contains(&actor) {
                record.waiters.push(actor);
            }
        }
        for actor in merged.owners {
            if !record.owners.contains(&actor) {
                record.owners.push(actor);
            }
        }
        record.successors.append(&mut merged.successors);
        record.state = match record.state {
            ActivityState::Inited => ActivityState::Starting,
            state => state,
        };
        let name = record.name.clone();
        log_debug!(self, "{} matched with {}", merged.name, name);

        // a get which matched an already finished communication completes immediately for its awaiters
        if self.activities[&older].state.is_terminal() {
            let waiters = self.activities[&older].waiters.clone();
            for actor in waiters {
                self.check_activity_wait(actor, older);
            }
        }
    }

    /// Exchanges the payload of a started message request with a pending request of the opposite direction.
    pub(crate) fn post_message(&mut self, id: ActivityId) {
        let (name, is_put) = match &self.activity(id).kind {
            ActivityKind::Message { queue, is_put, .. } => (queue.clone(), *is_put),
            _ => panic!("activity {} is not a message request", id),
        };
        let queue = self.queues.entry(name).or_default();
        let peer = if is_put {
            queue.gets.pop_front()
        } else {
            queue.puts.pop_front()
        };
        let Some(peer) = peer else {
            if is_put {
                queue.puts.push_back(id);
            } else {
                queue.gets.push_back(id);
            }
            self.activity_mut(id).state = ActivityState::Starting;
            return;
        };
        let (put, get) = if is_put { (id, peer) } else { (peer, id) };
        let payload = match &mut self.activity_mut(put).kind {
            ActivityKind::Message { payload, .. } => payload.take(),
            _ => None,
        };
        if let ActivityKind::Message { payload: slot, .. } = &mut self.activity_mut(get).kind {
            *slot = payload;
        }
        let clock = self.clock;
        for activity in [put, get] {
            let record = self.activity_mut(activity);
            record.state = ActivityState::Running;
            record.start_time = Some(clock);
        }
        // the older request completes first
        let (first, second) = if put < get { (put, get) } else { (get, put) };
        self.complete_activity(first, ActivityState::Finished, None);
        self.complete_activity(second, ActivityState::Finished, None);
    }

    /// Removes a terminated request from the queues. Finished communications of a permanent receiver stay until
    /// they are claimed.
    pub(crate) fn detach_request(&mut self, id: ActivityId) {
        let record = &self.activities[&id];
        match &record.kind {
            ActivityKind::Comm {
                mailbox: Some(name), ..
            } => {
                let keep_ready = record.state == ActivityState::Finished;
                if let Some(mailbox) = self.mailboxes.get_mut(name) {
                    mailbox.puts.retain(|&a| a != id);
                    mailbox.gets.retain(|&a| a != id);
                    if !keep_ready {
                        mailbox.ready.retain(|&a| a != id);
                    }
                }
            }
            ActivityKind::Message { queue, .. } => {
                if let Some(queue) = self.queues.get_mut(queue) {
                    queue.puts.retain(|&a| a != id);
                    queue.gets.retain(|&a| a != id);
                }
            }
            _ => {}
        }
    }

    fn create_put(
        &mut self,
        mailbox: &str,
        payload: Box<dyn Any>,
        size: f64,
        detached: bool,
    ) -> ActivityId {
        let sender = self.current_actor();
        let host = self.actors[&sender].host;
        let kind = ActivityKind::Comm {
            mailbox: Some(mailbox.to_string()),
            sender: Some(sender),
            receiver: None,
            src_host: Some(host),
            dst_host: None,
            payload: Some(payload),
            detached,
            links: Vec::new(),
        };
        let owner = (!detached).then_some(sender);
        self.create_activity(None, kind, size, owner)
    }

    fn create_get(&mut self, mailbox: &str) -> ActivityId {
        let receiver = self.current_actor();
        let host = self.actors[&receiver].host;
        let kind = ActivityKind::Comm {
            mailbox: Some(mailbox.to_string()),
            sender: None,
            receiver: Some(receiver),
            src_host: None,
            dst_host: Some(host),
            payload: None,
            detached: false,
            links: Vec::new(),
        };
        self.create_activity(None, kind, 0., Some(receiver))
    }

    fn create_message(&mut self, queue: &str, payload: Option<Box<dyn Any>>) -> ActivityId {
        let actor = self.current_actor();
        let kind = ActivityKind::Message {
            queue: queue.to_string(),
            is_put: payload.is_some(),
            payload,
        };
        self.create_activity(None, kind, 0., Some(actor))
    }
}

/// Named rendezvous point whose matched requests become timed communications.
///
/// Mailboxes are created on first use and live as long as the simulation, so pending requests are never dropped.
#[derive(Clone)]
pub struct Mailbox {
    kernel: KernelRef,
    name: String,
}

impl Mailbox {
    pub(crate) fn new(kernel: KernelRef, name: &str) -> Self {
        Self {
            kernel,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a put request of `size` bytes without starting it.
    pub fn put_init<T: Any>(&self, payload: T, size: f64) -> Comm {
        let id = self
            .kernel
            .borrow_mut()
            .create_put(&self.name, Box::new(payload), size, false);
        Comm::new(self.kernel.clone(), id)
    }

    pub fn put_async<T: Any>(&self, payload: T, size: f64) -> Comm {
        let comm = self.put_init(payload, size);
        comm.start().expect("new request can be started");
        comm
    }

    /// Sends the payload and waits until the transfer completes.
    pub async fn put<T: Any>(&self, payload: T, size: f64) -> Result<(), SimError> {
        self.put_async(payload, size).wait().await
    }

    /// Sends the payload waiting at most `timeout` seconds. On timeout the request is canceled.
    pub async fn put_for<T: Any>(&self, payload: T, size: f64, timeout: f64) -> Result<(), SimError> {
        let comm = self.put_async(payload, size);
        let result = comm.wait_for(timeout).await;
        if matches!(result, Err(SimError::Timeout)) {
            comm.cancel();
        }
        result
    }

    /// Sends the payload without waiting. The transfer is not affected by the termination of the sender.
    pub fn put_detached<T: Any>(&self, payload: T, size: f64) {
        let mut kernel = self.kernel.borrow_mut();
        let id = kernel.create_put(&self.name, Box::new(payload), size, true);
        if let Err(e) = kernel.start_activity(id) {
            log_warn!(kernel, "can't start detached put: {}", e);
        }
    }

    /// Creates a get request without starting it.
    pub fn get_init(&self) -> Comm {
        let id = self.kernel.borrow_mut().create_get(&self.name);
        Comm::new(self.kernel.clone(), id)
    }

    pub fn get_async(&self) -> Comm {
        let comm = self.get_init();
        comm.start().expect("new request can be started");
        comm
    }

    /// Waits for a payload of type `T`.
    pub async fn get<T: Any>(&self) -> Result<T, SimError> {
        let comm = self.get_async();
        comm.wait().await?;
        comm.get_payload()
    }

    /// Waits for a payload at most `timeout` seconds. On timeout the request is canceled.
    pub async fn get_for<T: Any>(&self, timeout: f64) -> Result<T, SimError> {
        let comm = self.get_async();
        if let Err(e) = comm.wait_for(timeout).await {
            if matches!(e, SimError::Timeout) {
                comm.cancel();
            }
            return Err(e);
        }
        comm.get_payload()
    }

    /// Whether some payload is waiting for a receiver.
    pub fn listen(&self) -> bool {
        let kernel = self.kernel.borrow();
        kernel
            .mailboxes
            .get(&self.name)
            .is_some_and(|mailbox| !mailbox.puts.is_empty() || !mailbox.ready.is_empty())
    }

    /// Whether the mailbox has no pending request.
    pub fn empty(&self) -> bool {
        let kernel = self.kernel.borrow();
        kernel.mailboxes.get(&self.name).map_or(true, |mailbox| {
            mailbox.puts.is_empty() && mailbox.gets.is_empty() && mailbox.ready.is_empty()
        })
    }

    /// Whether the oldest payload sent to the permanent receiver has already arrived.
    pub fn ready(&self) -> bool {
        let kernel = self.kernel.borrow();
        kernel
            .mailboxes
            .get(&self.name)
            .and_then(|mailbox| mailbox.ready.front())
            .is_some_and(|&id| kernel.activity(id).state == ActivityState::Finished)
    }

    /// Number of pending put requests.
    pub fn size(&self) -> usize {
        let kernel = self.kernel.borrow();
        kernel
            .mailboxes
            .get(&self.name)
            .map_or(0, |mailbox| mailbox.puts.len() + mailbox.ready.len())
    }

    /// Sets the permanent receiver: payloads put from now on are transferred to its host without waiting for a get.
    pub fn set_receiver(&self, receiver: Option<&ActorHandle>) {
        let mut kernel = self.kernel.borrow_mut();
        kernel.mailboxes.entry(self.name.clone()).or_default().receiver = receiver.map(|r| r.id());
    }

    pub fn receiver(&self) -> Option<ActorHandle> {
        let receiver = self.kernel.borrow().mailboxes.get(&self.name).and_then(|m| m.receiver);
        receiver.map(|id| ActorHandle::new(self.kernel.clone(), id))
    }
}

/// Named queue of messages delivered without simulating their transfer.
#[derive(Clone)]
pub struct MessageQueue {
    kernel: KernelRef,
    name: String,
}

impl MessageQueue {
    pub(crate) fn new(kernel: KernelRef, name: &str) -> Self {
        Self {
            kernel,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put_init<T: Any>(&self, payload: T) -> Mess {
        let id = self
            .kernel
            .borrow_mut()
            .create_message(&self.name, Some(Box::new(payload)));
        Mess::new(self.kernel.clone(), id)
    }

    pub fn put_async<T: Any>(&self, payload: T) -> Mess {
        let mess = self.put_init(payload);
        mess.start().expect("new request can be started");
        mess
    }

    /// Blocks until some actor takes the message.
    pub async fn put<T: Any>(&self, payload: T) -> Result<(), SimError> {
        self.put_async(payload).wait().await
    }

    pub fn get_init(&self) -> Mess {
        let id = self.kernel.borrow_mut().create_message(&self.name, None);
        Mess::new(self.kernel.clone(), id)
    }

    pub fn get_async(&self) -> Mess {
        let mess = self.get_init();
        mess.start().expect("new request can be started");
        mess
    }

    pub async fn get<T: Any>(&self) -> Result<T, SimError> {
        let mess = self.get_async();
        mess.wait().await?;
        mess.get_payload()
    }

    /// Waits for a message at most `timeout` seconds. On timeout the request is canceled.
    pub async fn get_for<T: Any>(&self, timeout: f64) -> Result<T, SimError> {
        let mess = self.get_async();
        if let Err(e) = mess.wait_for(timeout).await {
            if matches!(e, SimError::Timeout) {
                mess.cancel();
            }
            return Err(e);
        }
        mess.get_payload()
    }

    pub fn empty(&self) -> bool {
        let kernel = self.kernel.borrow();
        kernel
            .queues
            .get(&self.name)
            .map_or(true, |queue| queue.puts.is_empty() && queue.gets.is_empty())
    }

    /// Number of messages waiting for a receiver.
    pub fn size(&self) -> usize {
        let kernel = self.kernel.borrow();
        kernel.queues.get(&self.name).map_or(0, |queue| queue.puts.len())
    }
}
