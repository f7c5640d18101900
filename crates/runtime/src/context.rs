//! API available to the code of an actor.

use std::future::Future;

use rand::distributions::uniform::{SampleRange, SampleUniform};
use rand::Rng;

use dslab_platform::{error::PlatformError, host::HostId};

use crate::{
    activity::ActivityKind,
    actor::{ActorBuilder, ActorHandle, ActorId},
    error::SimError,
    executor::Suspend,
    handle::Exec,
    kernel::{KernelRef, WaitTarget, WakeReason},
    mailbox::{Mailbox, MessageQueue},
    resource::{Disk, Host},
    sync::{Barrier, ConditionVariable, Mutex, Semaphore},
};

/// Context of a running actor, passed to its code on start.
///
/// Blocking methods are `async` and must be awaited from the code of this actor.
#[derive(Clone)]
pub struct ActorContext {
    kernel: KernelRef,
    id: ActorId,
    name: String,
}

impl ActorContext {
    pub(crate) fn new(kernel: KernelRef, id: ActorId, name: String) -> Self {
        Self { kernel, id, name }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current simulation time.
    pub fn time(&self) -> f64 {
        self.kernel.borrow().clock
    }

    /// Host the actor is currently located on.
    pub fn host(&self) -> Host {
        let host = self.kernel.borrow().actors[&self.id].host;
        Host::new(self.kernel.clone(), host)
    }

    /// Handle of this actor.
    pub fn handle(&self) -> ActorHandle {
        ActorHandle::new(self.kernel.clone(), self.id)
    }

    // Time ------------------------------------------------------------------------------------------------------------

    /// Blocks for `duration` seconds. Non-positive durations return immediately.
    pub async fn sleep_for(&self, duration: f64) {
        let deadline = self.time() + duration;
        self.sleep_until(deadline).await
    }

    /// Blocks until the given moment of time. Moments in the past return immediately.
    pub async fn sleep_until(&self, time: f64) {
        let suspend = {
            let mut kernel = self.kernel.borrow_mut();
            if time <= kernel.clock {
                return;
            }
            let me = kernel.current_actor();
            let token = kernel.begin_wait(me, WaitTarget::Sleep, Some(time));
            Suspend::new(self.kernel.clone(), me, token)
        };
        suspend.await;
    }

    /// Lets all other actors ready at the current time run before this actor continues.
    pub async fn yield_now(&self) {
        let suspend = {
            let mut kernel = self.kernel.borrow_mut();
            let me = kernel.current_actor();
            let token = kernel.begin_wait(me, WaitTarget::Yield, None);
            kernel.wake(me, token, WakeReason::Ready);
            Suspend::new(self.kernel.clone(), me, token)
        };
        suspend.await;
    }

    // Computations ----------------------------------------------------------------------------------------------------

    /// Creates an execution of `flops` on the current host without starting it.
    pub fn exec_init(&self, flops: f64) -> Exec {
        let host = self.kernel.borrow().actors[&self.id].host;
        self.create_exec(flops, Some(host))
    }

    /// Creates an execution which is not assigned to any host, see [Exec::set_host].
    pub fn exec_unassigned(&self, flops: f64) -> Exec {
        self.create_exec(flops, None)
    }

    /// Starts an execution of `flops` on the current host.
    pub fn exec_async(&self, flops: f64) -> Exec {
        let exec = self.exec_init(flops);
        exec.start().expect("new execution can be started");
        exec
    }

    /// Executes `flops` on the current host and waits for the completion.
    pub async fn execute(&self, flops: f64) -> Result<(), SimError> {
        self.exec_async(flops).wait().await
    }

    fn create_exec(&self, flops: f64, host: Option<HostId>) -> Exec {
        let id = self
            .kernel
            .borrow_mut()
            .create_activity(None, ActivityKind::Exec { host }, flops, Some(self.id));
        Exec::new(self.kernel.clone(), id)
    }

    /// Creates a parallel execution without starting it.
    ///
    /// `hosts[i]` computes `flops[i]` while `bytes[i * n + j]` bytes are sent from `hosts[i]` to `hosts[j]`.
    /// An empty `bytes` means no communication. The whole task progresses at a single rate limited by its
    /// slowest part, so [Exec::remaining] reports the fraction of the task left.
    pub fn parallel_exec_init(&self, hosts: &[Host], flops: &[f64], bytes: &[f64]) -> Result<Exec, SimError> {
        let n = hosts.len();
        if flops.len() != n {
            return Err(PlatformError::InvalidValue {
                what: "number of flops amounts of parallel execution".to_string(),
                value: flops.len() as f64,
            }
            .into());
        }
        if !bytes.is_empty() && bytes.len() != n * n {
            return Err(PlatformError::InvalidValue {
                what: "size of bytes matrix of parallel execution".to_string(),
                value: bytes.len() as f64,
            }
            .into());
        }
        if let Some(&value) = flops.iter().chain(bytes.iter()).find(|v| !(v.is_finite() && **v >= 0.)) {
            return Err(PlatformError::InvalidValue {
                what: "amount of parallel execution".to_string(),
                value,
            }
            .into());
        }
        let kind = ActivityKind::Parallel {
            hosts: hosts.iter().map(|host| host.id()).collect(),
            flops: flops.to_vec(),
            bytes: bytes.to_vec(),
            links: Vec::new(),
        };
        let id = self.kernel.borrow_mut().create_activity(None, kind, 1., Some(self.id));
        Ok(Exec::new(self.kernel.clone(), id))
    }

    pub fn parallel_exec_async(&self, hosts: &[Host], flops: &[f64], bytes: &[f64]) -> Result<Exec, SimError> {
        let exec = self.parallel_exec_init(hosts, flops, bytes)?;
        exec.start()?;
        Ok(exec)
    }

    /// Runs a parallel execution (see [parallel_exec_init](Self::parallel_exec_init)) and waits for the completion.
    pub async fn parallel_execute(&self, hosts: &[Host], flops: &[f64], bytes: &[f64]) -> Result<(), SimError> {
        self.parallel_exec_async(hosts, flops, bytes)?.wait().await
    }

    /// Disk of the current host.
    pub fn disk(&self, name: &str) -> Result<Disk, SimError> {
        self.host().disk(name)
    }

    // Communication and synchronization -------------------------------------------------------------------------------

    pub fn mailbox(&self, name: &str) -> Mailbox {
        Mailbox::new(self.kernel.clone(), name)
    }

    pub fn message_queue(&self, name: &str) -> MessageQueue {
        MessageQueue::new(self.kernel.clone(), name)
    }

    pub fn create_mutex(&self) -> Mutex {
        Mutex::new(self.kernel.clone())
    }

    pub fn create_semaphore(&self, capacity: u32) -> Semaphore {
        Semaphore::new(self.kernel.clone(), capacity)
    }

    pub fn create_barrier(&self, parties: usize) -> Barrier {
        Barrier::new(self.kernel.clone(), parties)
    }

    pub fn create_condvar(&self) -> ConditionVariable {
        ConditionVariable::new(self.kernel.clone())
    }

    // Actors ----------------------------------------------------------------------------------------------------------

    /// Builder of a new actor located on `host`.
    pub fn actor(&self, name: &str, host: &Host) -> ActorBuilder {
        ActorBuilder::new(self.kernel.clone(), name, host.id())
    }

    /// Creates a new actor located on `host` and starts it at the current time.
    pub fn spawn<F, Fut>(&self, name: &str, host: &Host, f: F) -> Result<ActorHandle, SimError>
    where
        F: FnOnce(ActorContext) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.actor(name, host).spawn(f)
    }

    /// Registers a callback invoked when this actor terminates.
    pub fn on_exit<F: FnOnce(bool) + 'static>(&self, callback: F) {
        self.handle().on_exit(callback)
    }

    pub fn daemonize(&self) {
        self.handle().daemonize()
    }

    pub fn set_kill_time(&self, time: Option<f64>) {
        self.handle().set_kill_time(time)
    }

    /// Moves this actor to another host.
    pub fn set_host(&self, host: &Host) {
        self.handle().set_host(host)
    }

    /// Suspends this actor until another actor resumes it.
    pub async fn suspend(&self) {
        let suspend = {
            let mut kernel = self.kernel.borrow_mut();
            let me = kernel.current_actor();
            kernel.suspend_actor(me);
            let token = kernel.begin_wait(me, WaitTarget::Suspended, None);
            Suspend::new(self.kernel.clone(), me, token)
        };
        suspend.await;
    }

    /// Terminates this actor as if it was killed. Never returns.
    pub async fn exit(&self) {
        self.kernel.borrow_mut().kill_actor(self.id);
        std::future::pending::<()>().await
    }

    /// Random value from the simulation-wide generator.
    pub fn gen_range<T, R>(&self, range: R) -> T
    where
        T: SampleUniform,
        R: SampleRange<T>,
    {
        self.kernel.borrow_mut().rng.gen_range(range)
    }
}
