//! Entry point of the simulation engine.

use std::{any::Any, cell::RefCell, future::Future, rc::Rc};

use rand::distributions::uniform::{SampleRange, SampleUniform};
use rand::Rng;

use dslab_platform::{config::PlatformConfig, platform::Platform};

use crate::{
    actor::{ActorBody, ActorBuilder, ActorFactory, ActorHandle, ActorState},
    config::EngineConfig,
    context::ActorContext,
    deployment::{DeploymentConfig, FunctionRegistry},
    error::SimError,
    executor,
    kernel::{Kernel, KernelRef, Timer},
    log_debug, log_info,
    mailbox::{Mailbox, MessageQueue},
    resource::{Disk, Host, Link},
    run_stats::RunStats,
    sync::{Barrier, ConditionVariable, Mutex, Semaphore},
    trace::{Trace, TraceSink},
};

/// Simulation of actors running on a platform.
pub struct Simulation {
    kernel: KernelRef,
}

impl Simulation {
    /// Builds the platform and schedules the availability and state changes from its profiles.
    pub fn new(platform: &PlatformConfig, config: EngineConfig) -> Result<Self, SimError> {
        let built = Platform::from_config(platform, config.precision, config.maxmin_precision)?;
        let mut kernel = Kernel::new(built, config);
        for host in platform.hosts.iter() {
            let id = kernel.platform.host_by_name(&host.name)?;
            for event in host.speed_profile.iter() {
                kernel.add_timer(
                    event.time,
                    Timer::HostAvailability {
                        host: id,
                        scale: event.value,
                    },
                );
            }
            for event in host.state_profile.iter() {
                kernel.add_timer(event.time, Timer::HostState { host: id, on: event.on });
            }
        }
        for link in platform.links.iter() {
            let id = kernel.platform.link_by_name(&link.name)?;
            for event in link.bandwidth_profile.iter() {
                kernel.add_timer(
                    event.time,
                    Timer::LinkAvailability {
                        link: id,
                        scale: event.value,
                    },
                );
            }
            for event in link.state_profile.iter() {
                kernel.add_timer(event.time, Timer::LinkState { link: id, on: event.on });
            }
        }
        log_debug!(
            kernel,
            "simulation created: {} hosts, {} links",
            kernel.platform.hosts().len(),
            kernel.platform.links().len()
        );
        Ok(Self {
            kernel: Rc::new(RefCell::new(kernel)),
        })
    }

    /// Current simulation time.
    pub fn time(&self) -> f64 {
        self.kernel.borrow().clock
    }

    pub fn host(&self, name: &str) -> Result<Host, SimError> {
        let id = self.kernel.borrow().platform.host_by_name(name)?;
        Ok(Host::new(self.kernel.clone(), id))
    }

    pub fn hosts(&self) -> Vec<Host> {
        let count = self.kernel.borrow().platform.hosts().len();
        (0..count).map(|id| Host::new(self.kernel.clone(), id)).collect()
    }

    pub fn link(&self, name: &str) -> Result<Link, SimError> {
        let id = self.kernel.borrow().platform.link_by_name(name)?;
        Ok(Link::new(self.kernel.clone(), id))
    }

    pub fn disk(&self, host: &str, name: &str) -> Result<Disk, SimError> {
        self.host(host)?.disk(name)
    }

    /// Builder of a new actor located on `host`.
    pub fn actor(&self, name: &str, host: &Host) -> ActorBuilder {
        ActorBuilder::new(self.kernel.clone(), name, host.id())
    }

    /// Creates a new actor located on `host` which starts at the current time.
    pub fn spawn<F, Fut>(&self, name: &str, host: &Host, f: F) -> Result<ActorHandle, SimError>
    where
        F: FnOnce(ActorContext) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.actor(name, host).spawn(f)
    }

    /// Creates the actors of a deployment. Deployed actors can be restarted.
    pub fn deploy(
        &self,
        deployment: &DeploymentConfig,
        registry: &FunctionRegistry,
    ) -> Result<Vec<ActorHandle>, SimError> {
        let mut handles = Vec::with_capacity(deployment.actors.len());
        for actor in deployment.actors.iter() {
            let function = registry.get(&actor.function)?;
            let host = self.host(&actor.host)?;
            let name = actor.name.clone().unwrap_or_else(|| actor.function.clone());
            let mut builder = self
                .actor(&name, &host)
                .daemon(actor.daemon)
                .auto_restart(actor.auto_restart);
            if let Some(time) = actor.start_time {
                builder = builder.start_time(time);
            }
            if let Some(time) = actor.kill_time {
                builder = builder.kill_time(time);
            }
            for (key, value) in actor.properties.iter() {
                builder = builder.property(key, value);
            }
            let args = actor.args.clone();
            let factory: ActorFactory = Rc::new(move |ctx: ActorContext| function(ctx, args.clone()));
            handles.push(builder.spawn_body(ActorBody::Restartable(factory))?);
        }
        log_info!(self, "deployed {} actors", handles.len());
        Ok(handles)
    }

    /// Actors which are not dead.
    pub fn actors(&self) -> Vec<ActorHandle> {
        let ids = self
            .kernel
            .borrow()
            .actors
            .values()
            .filter(|a| a.state != ActorState::Dead)
            .map(|a| a.id)
            .collect::<Vec<_>>();
        ids.into_iter().map(|id| ActorHandle::new(self.kernel.clone(), id)).collect()
    }

    /// Kills all actors.
    pub fn kill_all(&self) {
        let mut kernel = self.kernel.borrow_mut();
        let ids = kernel.actors.keys().copied().collect::<Vec<_>>();
        for id in ids {
            kernel.kill_actor(id);
        }
    }

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

    /// Runs the simulation until all regular actors terminate or no event can happen anymore.
    pub fn run(&self) {
        executor::run(&self.kernel, None);
        log_info!(self, "simulation finished");
    }

    /// Runs the simulation until the given moment of time at most.
    pub fn run_until(&self, time: f64) {
        executor::run(&self.kernel, Some(time));
    }

    /// Runs the simulation for `duration` seconds at most.
    pub fn run_for(&self, duration: f64) {
        let limit = self.time() + duration;
        self.run_until(limit);
    }

    pub fn add_trace_sink(&self, sink: Box<dyn TraceSink>) {
        self.kernel.borrow_mut().sinks.push(sink);
    }

    /// Recorded trace, if enabled in [EngineConfig].
    pub fn trace(&self) -> Option<Trace> {
        self.kernel.borrow().trace.clone()
    }

    pub fn stats(&self) -> RunStats {
        self.kernel.borrow().stats.clone()
    }

    pub fn gen_range<T, R>(&self, range: R) -> T
    where
        T: SampleUniform,
        R: SampleRange<T>,
    {
        self.kernel.borrow_mut().rng.gen_range(range)
    }

    pub(crate) fn name(&self) -> &str {
        "simulation"
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        // actor code holds references to the kernel, so it is dropped outside of it to break the cycles
        let garbage = {
            let mut kernel = self.kernel.borrow_mut();
            let mut garbage: Vec<Box<dyn Any>> = Vec::new();
            for record in kernel.actors.values_mut() {
                if let Some(future) = record.future.take() {
                    garbage.push(Box::new(future));
                }
                if let Some(body) = record.body.take() {
                    garbage.push(Box::new(body));
                }
                if let Some(factory) = record.factory.take() {
                    garbage.push(Box::new(factory));
                }
                garbage.push(Box::new(std::mem::take(&mut record.on_exit)));
            }
            for record in kernel.activities.values_mut() {
                garbage.push(Box::new(std::mem::take(&mut record.callbacks)));
            }
            garbage.push(Box::new(std::mem::take(&mut kernel.deferred)));
            garbage.push(Box::new(std::mem::take(&mut kernel.restarts)));
            garbage.push(Box::new(std::mem::take(&mut kernel.graveyard)));
            garbage
        };
        drop(garbage);
    }
}
