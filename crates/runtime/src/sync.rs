//! Synchronization primitives blocking actors: mutex, semaphore, barrier and condition variable.
//!
//! All primitives keep FIFO queues of blocked actors in the kernel. A killed actor is removed from the queue it waits
//! in without changing the state of the primitive.

use std::collections::VecDeque;

use crate::{
    actor::{ActorHandle, ActorId},
    error::SimError,
    executor::Suspend,
    kernel::{Kernel, KernelRef, WaitTarget, WakeReason},
};

pub type SyncId = u64;

pub(crate) enum SyncObject {
    Mutex {
        owner: Option<ActorId>,
        queue: VecDeque<ActorId>,
    },
    Semaphore {
        value: u32,
        queue: VecDeque<ActorId>,
        /// Woken waiters which were handed a permit but did not resume yet.
        granted: Vec<ActorId>,
    },
    Barrier {
        parties: usize,
        arrived: Vec<ActorId>,
    },
    CondVar {
        /// Waiting actors with the mutexes they must reacquire.
        queue: VecDeque<(ActorId, SyncId)>,
    },
}

impl Kernel {
    pub(crate) fn create_sync(&mut self, object: SyncObject) -> SyncId {
        let id = self.next_sync_id;
        self.next_sync_id += 1;
        self.syncs.insert(id, object);
        id
    }

    fn sync_mut(&mut self, id: SyncId) -> &mut SyncObject {
        self.syncs.get_mut(&id).expect("sync objects are never removed")
    }

    pub(crate) fn remove_from_sync(&mut self, id: SyncId, actor: ActorId) {
        match self.sync_mut(id) {
            SyncObject::Mutex { queue, .. } | SyncObject::Semaphore { queue, .. } => queue.retain(|&a| a != actor),
            SyncObject::Barrier { arrived, .. } => arrived.retain(|&a| a != actor),
            SyncObject::CondVar { queue } => queue.retain(|&(a, _)| a != actor),
        }
    }

    /// Releases the mutexes held by a terminated actor.
    pub(crate) fn release_mutexes(&mut self, actor: ActorId) {
        let owned = self
            .syncs
            .iter()
            .filter(|(_, object)| matches!(object, SyncObject::Mutex { owner: Some(owner), .. } if *owner == actor))
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        for mutex in owned {
            self.unlock_mutex(mutex);
        }
    }

    /// Gives back the semaphore permits handed to an actor which died before it could resume.
    pub(crate) fn return_semaphore_permits(&mut self, actor: ActorId) {
        let mut returned = Vec::new();
        for (&id, object) in self.syncs.iter_mut() {
            if let SyncObject::Semaphore { granted, .. } = object {
                if let Some(pos) = granted.iter().position(|&a| a == actor) {
                    granted.remove(pos);
                    returned.push(id);
                }
            }
        }
        for semaphore in returned {
            self.release_semaphore(semaphore);
        }
    }

    /// Hands a permit to the longest waiting actor or adds it to the available ones.
    fn release_semaphore(&mut self, semaphore: SyncId) {
        let next = match self.sync_mut(semaphore) {
            SyncObject::Semaphore { value, queue, granted } => {
                let next = queue.pop_front();
                match next {
                    Some(actor) => granted.push(actor),
                    None => *value += 1,
                }
                next
            }
            _ => panic!("sync object {} is not a semaphore", semaphore),
        };
        if let Some(next) = next {
            self.wake_waiting(next, WakeReason::Ready);
        }
    }

    /// Passes the mutex to the longest waiting actor.
    fn unlock_mutex(&mut self, mutex: SyncId) {
        let next = match self.sync_mut(mutex) {
            SyncObject::Mutex { owner, queue } => {
                *owner = queue.pop_front();
                *owner
            }
            _ => panic!("sync object {} is not a mutex", mutex),
        };
        if let Some(next) = next {
            self.wake_waiting(next, WakeReason::Ready);
        }
    }

    /// Takes the mutex for `actor` if it is free, otherwise queues the actor. Returns whether the mutex was taken.
    fn lock_or_enqueue(&mut self, mutex: SyncId, actor: ActorId) -> bool {
        match self.sync_mut(mutex) {
            SyncObject::Mutex { owner, queue } => {
                if owner.is_none() {
                    *owner = Some(actor);
                    true
                } else {
                    queue.push_back(actor);
                    false
                }
            }
            _ => panic!("sync object {} is not a mutex", mutex),
        }
    }

    fn notify(&mut self, condvar: SyncId, all: bool) {
        let woken = match self.sync_mut(condvar) {
            SyncObject::CondVar { queue } => {
                if all {
                    queue.drain(..).collect::<Vec<_>>()
                } else {
                    queue.pop_front().into_iter().collect()
                }
            }
            _ => panic!("sync object {} is not a condition variable", condvar),
        };
        for (actor, mutex) in woken {
            // the notification is consumed, the deadline of a timed wait no longer applies
            let timer = self
                .actors
                .get_mut(&actor)
                .and_then(|a| a.wait.as_mut())
                .and_then(|wait| {
                    wait.target = WaitTarget::Sync(mutex);
                    wait.timer.take()
                });
            if let Some(key) = timer {
                self.cancel_timer(key);
            }
            if self.lock_or_enqueue(mutex, actor) {
                self.wake_waiting(actor, WakeReason::Ready);
            }
        }
    }
}

/// Mutual exclusion lock with a FIFO queue of waiting actors.
#[derive(Clone)]
pub struct Mutex {
    kernel: KernelRef,
    id: SyncId,
}

impl Mutex {
    pub(crate) fn new(kernel: KernelRef) -> Self {
        let id = kernel.borrow_mut().create_sync(SyncObject::Mutex {
            owner: None,
            queue: VecDeque::new(),
        });
        Self { kernel, id }
    }

    /// Blocks until the mutex is acquired by the calling actor.
    pub async fn lock(&self) -> Result<(), SimError> {
        let suspend = {
            let mut kernel = self.kernel.borrow_mut();
            let me = kernel.current_actor();
            if self.owner_id(&kernel) == Some(me) {
                return Err(SimError::InvalidState("mutex is already locked by this actor".to_string()));
            }
            if kernel.lock_or_enqueue(self.id, me) {
                return Ok(());
            }
            let token = kernel.begin_wait(me, WaitTarget::Sync(self.id), None);
            Suspend::new(self.kernel.clone(), me, token)
        };
        suspend.await;
        Ok(())
    }

    /// Acquires the mutex if it is free.
    pub fn try_lock(&self) -> bool {
        let mut kernel = self.kernel.borrow_mut();
        let me = kernel.current_actor();
        match kernel.sync_mut(self.id) {
            SyncObject::Mutex { owner, .. } if owner.is_none() => {
                *owner = Some(me);
                true
            }
            _ => false,
        }
    }

    /// Releases the mutex held by the calling actor and passes it to the longest waiting actor.
    pub fn unlock(&self) -> Result<(), SimError> {
        let mut kernel = self.kernel.borrow_mut();
        let me = kernel.current_actor();
        if self.owner_id(&kernel) != Some(me) {
            return Err(SimError::InvalidState("mutex is not locked by this actor".to_string()));
        }
        kernel.unlock_mutex(self.id);
        Ok(())
    }

    pub fn owner(&self) -> Option<ActorHandle> {
        let owner = self.owner_id(&self.kernel.borrow());
        owner.map(|id| ActorHandle::new(self.kernel.clone(), id))
    }

    pub fn is_locked(&self) -> bool {
        self.owner_id(&self.kernel.borrow()).is_some()
    }

    fn owner_id(&self, kernel: &Kernel) -> Option<ActorId> {
        match &kernel.syncs[&self.id] {
            SyncObject::Mutex { owner, .. } => *owner,
            _ => None,
        }
    }
}

/// Counting semaphore. Released permits are handed to waiting actors in FIFO order.
#[derive(Clone)]
pub struct Semaphore {
    kernel: KernelRef,
    id: SyncId,
}

impl Semaphore {
    pub(crate) fn new(kernel: KernelRef, capacity: u32) -> Self {
        let id = kernel.borrow_mut().create_sync(SyncObject::Semaphore {
            value: capacity,
            queue: VecDeque::new(),
            granted: Vec::new(),
        });
        Self { kernel, id }
    }

    pub async fn acquire(&self) {
        // without a deadline the wait can only end with a permit
        let _ = self.acquire_until(None).await;
    }

    /// Acquires a permit waiting at most `timeout` seconds.
    pub async fn acquire_for(&self, timeout: f64) -> Result<(), SimError> {
        let deadline = self.kernel.borrow().clock + timeout;
        self.acquire_until(Some(deadline)).await
    }

    async fn acquire_until(&self, deadline: Option<f64>) -> Result<(), SimError> {
        let (me, suspend) = {
            let mut kernel = self.kernel.borrow_mut();
            let me = kernel.current_actor();
            let acquired = match kernel.sync_mut(self.id) {
                SyncObject::Semaphore { value, .. } => {
                    if *value > 0 {
                        *value -= 1;
                        true
                    } else {
                        false
                    }
                }
                _ => panic!("sync object {} is not a semaphore", self.id),
            };
            if acquired {
                return Ok(());
            }
            let token = if deadline.is_some_and(|deadline| deadline <= kernel.clock) {
                kernel.immediate_timeout(me)
            } else {
                if let SyncObject::Semaphore { queue, .. } = kernel.sync_mut(self.id) {
                    queue.push_back(me);
                }
                kernel.begin_wait(me, WaitTarget::Sync(self.id), deadline)
            };
            (me, Suspend::new(self.kernel.clone(), me, token))
        };
        match suspend.await {
            WakeReason::Timeout => Err(SimError::Timeout),
            _ => {
                if let SyncObject::Semaphore { granted, .. } = self.kernel.borrow_mut().sync_mut(self.id) {
                    granted.retain(|&a| a != me);
                }
                Ok(())
            }
        }
    }

    /// Takes a permit if one is available.
    pub fn try_acquire(&self) -> bool {
        match self.kernel.borrow_mut().sync_mut(self.id) {
            SyncObject::Semaphore { value, .. } if *value > 0 => {
                *value -= 1;
                true
            }
            _ => false,
        }
    }

    /// Returns a permit, waking the longest waiting actor if there is one.
    pub fn release(&self) {
        self.kernel.borrow_mut().release_semaphore(self.id);
    }

    /// Number of available permits.
    pub fn capacity(&self) -> u32 {
        match &self.kernel.borrow().syncs[&self.id] {
            SyncObject::Semaphore { value, .. } => *value,
            _ => 0,
        }
    }

    pub fn would_block(&self) -> bool {
        self.capacity() == 0
    }

    /// Number of actors waiting for a permit.
    pub fn waiting(&self) -> usize {
        match &self.kernel.borrow().syncs[&self.id] {
            SyncObject::Semaphore { queue, .. } => queue.len(),
            _ => 0,
        }
    }
}

/// Barrier releasing all waiting actors when the given number of actors arrived.
#[derive(Clone)]
pub struct Barrier {
    kernel: KernelRef,
    id: SyncId,
}

impl Barrier {
    pub(crate) fn new(kernel: KernelRef, parties: usize) -> Self {
        let id = kernel.borrow_mut().create_sync(SyncObject::Barrier {
            parties,
            arrived: Vec::new(),
        });
        Self { kernel, id }
    }

    /// Blocks until all parties arrive. Returns `true` for exactly one actor, the last to arrive.
    pub async fn wait(&self) -> bool {
        let suspend = {
            let mut kernel = self.kernel.borrow_mut();
            let me = kernel.current_actor();
            let released = match kernel.sync_mut(self.id) {
                SyncObject::Barrier { parties, arrived } => {
                    arrived.push(me);
                    if arrived.len() >= *parties {
                        Some(std::mem::take(arrived))
                    } else {
                        None
                    }
                }
                _ => panic!("sync object {} is not a barrier", self.id),
            };
            match released {
                Some(arrived) => {
                    for actor in arrived.into_iter().filter(|&actor| actor != me) {
                        kernel.wake_waiting(actor, WakeReason::Ready);
                    }
                    return true;
                }
                None => {
                    let token = kernel.begin_wait(me, WaitTarget::Sync(self.id), None);
                    Suspend::new(self.kernel.clone(), me, token)
                }
            }
        };
        suspend.await;
        false
    }
}

/// Condition variable used together with a [Mutex].
#[derive(Clone)]
pub struct ConditionVariable {
    kernel: KernelRef,
    id: SyncId,
}

impl ConditionVariable {
    pub(crate) fn new(kernel: KernelRef) -> Self {
        let id = kernel.borrow_mut().create_sync(SyncObject::CondVar { queue: VecDeque::new() });
        Self { kernel, id }
    }

    /// Releases the mutex, blocks until notified and reacquires the mutex.
    pub async fn wait(&self, mutex: &Mutex) -> Result<(), SimError> {
        self.wait_until_deadline(mutex, None).await
    }

    /// Same as [wait](Self::wait) with a timeout. On timeout the mutex is reacquired before returning
    /// [SimError::Timeout].
    pub async fn wait_for(&self, mutex: &Mutex, timeout: f64) -> Result<(), SimError> {
        let deadline = self.kernel.borrow().clock + timeout;
        self.wait_until_deadline(mutex, Some(deadline)).await
    }

    pub async fn wait_until(&self, mutex: &Mutex, deadline: f64) -> Result<(), SimError> {
        self.wait_until_deadline(mutex, Some(deadline)).await
    }

    async fn wait_until_deadline(&self, mutex: &Mutex, deadline: Option<f64>) -> Result<(), SimError> {
        let suspend = {
            let mut kernel = self.kernel.borrow_mut();
            let me = kernel.current_actor();
            if mutex.owner_id(&kernel) != Some(me) {
                return Err(SimError::InvalidState(
                    "waiting on a condition variable requires holding the mutex".to_string(),
                ));
            }
            match kernel.sync_mut(self.id) {
                SyncObject::CondVar { queue } => queue.push_back((me, mutex.id)),
                _ => panic!("sync object {} is not a condition variable", self.id),
            }
            kernel.unlock_mutex(mutex.id);
            let token = kernel.begin_wait(me, WaitTarget::Sync(self.id), deadline);
            Suspend::new(self.kernel.clone(), me, token)
        };
        match suspend.await {
            WakeReason::Timeout => {
                mutex.lock().await?;
                Err(SimError::Timeout)
            }
            _ => Ok(()),
        }
    }

    pub fn notify_one(&self) {
        self.kernel.borrow_mut().notify(self.id, false);
    }

    pub fn notify_all(&self) {
        self.kernel.borrow_mut().notify(self.id, true);
    }
}
