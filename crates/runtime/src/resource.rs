//! Handles of hosts, links and disks, and the reaction of the kernel to their state changes.

use dslab_platform::{
    disk::{DiskId, IoOp},
    host::{HostId, SpeedFactorFn},
    link::LinkId,
    lmm::ThroughputFunction,
};

use crate::{
    activity::{ActivityKind, ActivityState},
    actor::{ActorBody, ActorHandle, ActorOptions, ActorState, RestartInfo},
    error::{Failure, SimError},
    handle::Io,
    kernel::{Kernel, KernelRef},
    log_debug, log_warn,
    trace::TraceEvent,
};

impl Kernel {
    /// Turns a host off or on.
    ///
    /// Turning a host off fails all activities running on it, its disks or its loopback and communications with the
    /// host as an endpoint, then kills the actors located on it. Auto-restart actors are started again when the host
    /// is turned back on.
    pub(crate) fn set_host_state(&mut self, host: HostId, on: bool) {
        if self.platform.host(host).is_on() == on {
            return;
        }
        self.platform.set_host_state(host, on);
        let name = self.platform.host(host).name().to_string();
        log_debug!(self, "host {} is turned {}", name, if on { "on" } else { "off" });
        self.emit(TraceEvent::HostStateChanged {
            time: self.clock,
            host: name.clone(),
            on,
        });

        if on {
            let restarts = self.restarts.remove(&host).unwrap_or_default();
            for info in restarts {
                let options = ActorOptions {
                    name: info.name,
                    host,
                    daemon: info.daemon,
                    auto_restart: true,
                    start_time: None,
                    kill_time: None,
                    properties: info.properties,
                };
                if let Err(e) = self.add_actor(options, ActorBody::Restartable(info.factory)) {
                    log_warn!(self, "can't restart actor on host {}: {}", name, e);
                }
            }
            return;
        }

        let failed = self
            .activities
            .values()
            .filter(|record| !record.state.is_terminal() && record.action.is_some())
            .filter_map(|record| match &record.kind {
                ActivityKind::Exec { host: Some(h) } if *h == host => Some((record.id, Failure::Host(name.clone()))),
                ActivityKind::Io { disk, .. } if self.platform.disk(*disk).host() == host => {
                    Some((record.id, Failure::Host(name.clone())))
                }
                ActivityKind::Comm { src_host, dst_host, .. }
                    if *src_host == Some(host) || *dst_host == Some(host) =>
                {
                    Some((record.id, Failure::Transfer))
                }
                ActivityKind::Parallel { hosts, .. } if hosts.contains(&host) => {
                    Some((record.id, Failure::Host(name.clone())))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        for (id, failure) in failed {
            self.complete_activity(id, ActivityState::Failed, Some(failure));
        }

        let victims = self
            .actors
            .values()
            .filter(|a| a.host == host && a.state != ActorState::Dead)
            .map(|a| a.id)
            .collect::<Vec<_>>();
        for actor in victims {
            let record = &self.actors[&actor];
            if record.auto_restart {
                if let Some(factory) = record.factory.clone() {
                    let info = RestartInfo {
                        name: record.name.clone(),
                        factory,
                        daemon: record.daemon,
                        properties: record.properties.clone(),
                    };
                    self.restarts.entry(host).or_default().push(info);
                }
            }
            self.kill_actor(actor);
        }
    }

    /// Turns a link off or on. Turning a link off fails all communications using it.
    pub(crate) fn set_link_state(&mut self, link: LinkId, on: bool) {
        if self.platform.link(link).is_on() == on {
            return;
        }
        self.platform.set_link_state(link, on);
        self.emit(TraceEvent::LinkStateChanged {
            time: self.clock,
            link: self.platform.link(link).name().to_string(),
            on,
        });
        if on {
            return;
        }
        let failed = self
            .activities
            .values()
            .filter(|record| !record.state.is_terminal() && record.action.is_some())
            .filter(|record| match &record.kind {
                ActivityKind::Comm { links, .. } | ActivityKind::Parallel { links, .. } => links.contains(&link),
                _ => false,
            })
            .map(|record| record.id)
            .collect::<Vec<_>>();
        for id in failed {
            self.complete_activity(id, ActivityState::Failed, Some(Failure::Transfer));
        }
    }

    /// Turns a disk off or on. Turning a disk off fails all I/O operations on it.
    pub(crate) fn set_disk_state(&mut self, disk: DiskId, on: bool) {
        self.platform.set_disk_state(disk, on);
        if on {
            return;
        }
        let host = self.platform.disk(disk).host();
        let name = self.platform.host(host).name().to_string();
        let failed = self
            .activities
            .values()
            .filter(|record| !record.state.is_terminal() && record.action.is_some())
            .filter(|record| matches!(record.kind, ActivityKind::Io { disk: d, .. } if d == disk))
            .map(|record| record.id)
            .collect::<Vec<_>>();
        for id in failed {
            self.complete_activity(id, ActivityState::Failed, Some(Failure::Host(name.clone())));
        }
    }

    pub(crate) fn set_pstate(&mut self, host: HostId, pstate: usize) -> Result<(), SimError> {
        self.platform.set_pstate(host, pstate)?;
        self.emit(TraceEvent::HostPstateChanged {
            time: self.clock,
            host: self.platform.host(host).name().to_string(),
            pstate,
        });
        Ok(())
    }
}

/// Handle of a host.
#[derive(Clone)]
pub struct Host {
    kernel: KernelRef,
    id: HostId,
}

impl Host {
    pub(crate) fn new(kernel: KernelRef, id: HostId) -> Self {
        Self { kernel, id }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn name(&self) -> String {
        self.kernel.borrow().platform.host(self.id).name().to_string()
    }

    /// Current speed of one core in flops per second, the availability included.
    pub fn speed(&self) -> f64 {
        self.kernel.borrow().platform.host(self.id).speed()
    }

    /// Fraction of the peak speed which is currently available.
    pub fn available_speed(&self) -> f64 {
        self.kernel.borrow().platform.host(self.id).available_speed()
    }

    pub fn cores(&self) -> u32 {
        self.kernel.borrow().platform.host(self.id).cores()
    }

    pub fn pstate(&self) -> usize {
        self.kernel.borrow().platform.host(self.id).pstate()
    }

    pub fn pstate_count(&self) -> usize {
        self.kernel.borrow().platform.host(self.id).pstate_count()
    }

    pub fn set_pstate(&self, pstate: usize) -> Result<(), SimError> {
        self.kernel.borrow_mut().set_pstate(self.id, pstate)
    }

    pub fn is_on(&self) -> bool {
        self.kernel.borrow().platform.host(self.id).is_on()
    }

    pub fn turn_on(&self) {
        self.kernel.borrow_mut().set_host_state(self.id, true);
    }

    /// Turns the host off: its activities fail and its actors are killed.
    pub fn turn_off(&self) {
        self.kernel.borrow_mut().set_host_state(self.id, false);
    }

    /// Computation speed currently used on the host, in flops per second.
    pub fn load(&self) -> f64 {
        self.kernel.borrow_mut().platform.host_load(self.id)
    }

    /// Energy consumed so far, in joules.
    pub fn energy(&self) -> f64 {
        self.kernel.borrow().platform.host(self.id).energy()
    }

    /// Current power, in watts.
    pub fn power(&self) -> f64 {
        self.kernel.borrow_mut().platform.host_power(self.id)
    }

    /// Makes the speed of computations started on the host depend on their size.
    pub fn set_speed_factor_fn(&self, factor_fn: Option<SpeedFactorFn>) {
        self.kernel
            .borrow_mut()
            .platform
            .set_speed_factor_fn(self.id, factor_fn);
    }

    /// Scales the CPU capacity by a factor depending on the number of running computations.
    pub fn set_throughput_function(&self, throughput_fn: Option<ThroughputFunction>) {
        self.kernel
            .borrow_mut()
            .platform
            .set_host_throughput_function(self.id, throughput_fn);
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.kernel
            .borrow()
            .platform
            .host(self.id)
            .property(key)
            .map(|value| value.to_string())
    }

    pub fn disks(&self) -> Vec<Disk> {
        let disks = self.kernel.borrow().platform.host(self.id).disks().to_vec();
        disks.into_iter().map(|id| Disk::new(self.kernel.clone(), id)).collect()
    }

    pub fn disk(&self, name: &str) -> Result<Disk, SimError> {
        let id = self.kernel.borrow().platform.disk_by_name(self.id, name)?;
        Ok(Disk::new(self.kernel.clone(), id))
    }

    /// Actors located on the host which are not dead.
    pub fn actors(&self) -> Vec<ActorHandle> {
        let ids = self
            .kernel
            .borrow()
            .actors
            .values()
            .filter(|a| a.host == self.id && a.state != ActorState::Dead)
            .map(|a| a.id)
            .collect::<Vec<_>>();
        ids.into_iter().map(|id| ActorHandle::new(self.kernel.clone(), id)).collect()
    }

    /// Links traversed by communications to `dst` and the total latency of the route.
    pub fn route_to(&self, dst: &Host) -> Result<(Vec<Link>, f64), SimError> {
        let route = self.kernel.borrow_mut().platform.route(self.id, dst.id)?;
        let links = route
            .links
            .into_iter()
            .map(|id| Link::new(self.kernel.clone(), id))
            .collect();
        Ok((links, route.latency))
    }
}

/// Handle of a network link.
#[derive(Clone)]
pub struct Link {
    kernel: KernelRef,
    id: LinkId,
}

impl Link {
    pub(crate) fn new(kernel: KernelRef, id: LinkId) -> Self {
        Self { kernel, id }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> String {
        self.kernel.borrow().platform.link(self.id).name().to_string()
    }

    pub fn bandwidth(&self) -> f64 {
        self.kernel.borrow().platform.link(self.id).bandwidth()
    }

    pub fn set_bandwidth(&self, bandwidth: f64) -> Result<(), SimError> {
        Ok(self.kernel.borrow_mut().platform.set_link_bandwidth(self.id, bandwidth)?)
    }

    pub fn latency(&self) -> f64 {
        self.kernel.borrow().platform.link(self.id).latency()
    }

    /// Bandwidth currently used by communications.
    pub fn load(&self) -> f64 {
        self.kernel.borrow_mut().platform.link_load(self.id)
    }

    /// Total bytes transferred through the link so far.
    pub fn transferred(&self) -> f64 {
        self.kernel.borrow().platform.link(self.id).transferred()
    }

    pub fn is_on(&self) -> bool {
        self.kernel.borrow().platform.link(self.id).is_on()
    }

    pub fn turn_on(&self) {
        self.kernel.borrow_mut().set_link_state(self.id, true);
    }

    /// Turns the link off: communications using it fail.
    pub fn turn_off(&self) {
        self.kernel.borrow_mut().set_link_state(self.id, false);
    }

    pub fn set_throughput_function(&self, throughput_fn: Option<ThroughputFunction>) {
        self.kernel
            .borrow_mut()
            .platform
            .set_link_throughput_function(self.id, throughput_fn);
    }
}

/// Handle of a disk attached to a host.
#[derive(Clone)]
pub struct Disk {
    kernel: KernelRef,
    id: DiskId,
}

impl Disk {
    pub(crate) fn new(kernel: KernelRef, id: DiskId) -> Self {
        Self { kernel, id }
    }

    pub fn id(&self) -> DiskId {
        self.id
    }

    pub fn name(&self) -> String {
        self.kernel.borrow().platform.disk(self.id).name().to_string()
    }

    pub fn host(&self) -> Host {
        let host = self.kernel.borrow().platform.disk(self.id).host();
        Host::new(self.kernel.clone(), host)
    }

    pub fn read_bandwidth(&self) -> f64 {
        self.kernel.borrow().platform.disk(self.id).read_bandwidth()
    }

    pub fn write_bandwidth(&self) -> f64 {
        self.kernel.borrow().platform.disk(self.id).write_bandwidth()
    }

    pub fn bytes_read(&self) -> f64 {
        self.kernel.borrow().platform.disk(self.id).bytes_read()
    }

    pub fn bytes_written(&self) -> f64 {
        self.kernel.borrow().platform.disk(self.id).bytes_written()
    }

    pub fn is_on(&self) -> bool {
        self.kernel.borrow().platform.disk(self.id).is_on()
    }

    pub fn turn_on(&self) {
        self.kernel.borrow_mut().set_disk_state(self.id, true);
    }

    pub fn turn_off(&self) {
        self.kernel.borrow_mut().set_disk_state(self.id, false);
    }

    /// Creates an I/O operation of `size` bytes owned by the calling actor, without starting it.
    pub fn io_init(&self, size: f64, op: IoOp) -> Io {
        let mut kernel = self.kernel.borrow_mut();
        let owner = kernel.current;
        let id = kernel.create_activity(None, ActivityKind::Io { disk: self.id, op }, size, owner);
        Io::new(self.kernel.clone(), id)
    }

    pub fn read_async(&self, size: f64) -> Io {
        self.start_io(size, IoOp::Read)
    }

    pub fn write_async(&self, size: f64) -> Io {
        self.start_io(size, IoOp::Write)
    }

    pub async fn read(&self, size: f64) -> Result<(), SimError> {
        self.read_async(size).wait().await
    }

    pub async fn write(&self, size: f64) -> Result<(), SimError> {
        self.write_async(size).wait().await
    }

    fn start_io(&self, size: f64, op: IoOp) -> Io {
        let io = self.io_init(size, op);
        io.start().expect("new I/O operation can be started");
        io
    }
}
