//! Sealed simulated platform: hosts, links, disks, routing and the resource model shared by all of them.

use std::collections::BTreeMap;

use crate::{
    config::PlatformConfig,
    disk::{Disk, DiskId, IoOp},
    energy::EnergyModel,
    error::PlatformError,
    host::{Host, HostId, SpeedFactorFn},
    link::{Link, LinkId},
    lmm::{SharingPolicy, ThroughputFunction},
    model::{ActionId, ResourceModel},
    routing::Routing,
};

/// Links between two hosts together with the total latency.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub links: Vec<LinkId>,
    pub latency: f64,
}

enum ActionTarget {
    Exec {
        host: HostId,
        user_bound: Option<f64>,
        factor: f64,
    },
    Comm {
        links: Vec<LinkId>,
    },
    Io {
        disk: DiskId,
        op: IoOp,
    },
    Parallel {
        hosts: Vec<HostId>,
        flops: Vec<f64>,
        /// Bytes sent through each link over the whole task.
        links: Vec<(LinkId, f64)>,
        user_bound: Option<f64>,
    },
}

/// Simulated platform.
///
/// The topology is fixed once the platform is built, only resource states (on/off, pstate, availability)
/// may change afterwards.
pub struct Platform {
    hosts: Vec<Host>,
    links: Vec<Link>,
    disks: Vec<Disk>,
    host_by_name: BTreeMap<String, HostId>,
    link_by_name: BTreeMap<String, LinkId>,
    routing: Routing,
    model: ResourceModel,
    actions: BTreeMap<ActionId, ActionTarget>,
}

fn check_positive(what: &str, value: f64) -> Result<(), PlatformError> {
    if value > 0. && value.is_finite() {
        Ok(())
    } else {
        Err(PlatformError::InvalidValue {
            what: what.to_string(),
            value,
        })
    }
}

impl Platform {
    /// Builds the platform from its description.
    pub fn from_config(config: &PlatformConfig, precision: f64, maxmin_precision: f64) -> Result<Self, PlatformError> {
        let mut platform = Platform {
            hosts: Vec::new(),
            links: Vec::new(),
            disks: Vec::new(),
            host_by_name: BTreeMap::new(),
            link_by_name: BTreeMap::new(),
            routing: Routing::new(),
            model: ResourceModel::new(precision, maxmin_precision),
            actions: BTreeMap::new(),
        };

        check_positive("loopback bandwidth", config.loopback.bandwidth)?;
        for host_config in config.hosts.iter() {
            if platform.host_by_name.contains_key(&host_config.name) {
                return Err(PlatformError::DuplicateName(host_config.name.clone()));
            }
            if host_config.pstate >= host_config.speeds.len() {
                return Err(PlatformError::InvalidPstate {
                    host: host_config.name.clone(),
                    pstate: host_config.pstate,
                    count: host_config.speeds.len(),
                });
            }
            for &speed in host_config.speeds.iter() {
                check_positive(&format!("speed of host {}", host_config.name), speed)?;
            }
            if host_config.cores == 0 {
                return Err(PlatformError::InvalidValue {
                    what: format!("core count of host {}", host_config.name),
                    value: 0.,
                });
            }

            let id = platform.hosts.len();
            let loopback = platform.add_link(
                &format!("{}_loopback", host_config.name),
                config.loopback.bandwidth,
                config.loopback.latency,
                SharingPolicy::FatPipe,
            )?;
            let cpu = platform.model.system_mut().add_constraint(0., SharingPolicy::Shared);
            let mut host = Host {
                id,
                name: host_config.name.clone(),
                speeds: host_config.speeds.clone(),
                pstate: host_config.pstate,
                cores: host_config.cores,
                is_on: true,
                scale: 1.,
                cpu,
                loopback,
                disks: Vec::new(),
                energy: host_config.energy.as_ref().map(EnergyModel::new),
                factor_fn: None,
                properties: host_config.properties.clone(),
            };
            platform.model.system_mut().set_constraint_bound(cpu, host.capacity());

            for disk_config in host_config.disks.iter() {
                if host_config.disks.iter().filter(|d| d.name == disk_config.name).count() > 1 {
                    return Err(PlatformError::DuplicateName(disk_config.name.clone()));
                }
                check_positive(&format!("read bandwidth of disk {}", disk_config.name), disk_config.read_bandwidth)?;
                check_positive(
                    &format!("write bandwidth of disk {}", disk_config.name),
                    disk_config.write_bandwidth,
                )?;
                let disk_id = platform.disks.len();
                let system = platform.model.system_mut();
                platform.disks.push(Disk {
                    id: disk_id,
                    name: disk_config.name.clone(),
                    host: id,
                    read_bandwidth: disk_config.read_bandwidth,
                    write_bandwidth: disk_config.write_bandwidth,
                    read_constraint: system.add_constraint(disk_config.read_bandwidth, SharingPolicy::Shared),
                    write_constraint: system.add_constraint(disk_config.write_bandwidth, SharingPolicy::Shared),
                    is_on: true,
                    bytes_read: 0.,
                    bytes_written: 0.,
                });
                host.disks.push(disk_id);
            }

            platform.routing.add_host_node(id, &host_config.name)?;
            platform.host_by_name.insert(host_config.name.clone(), id);
            platform.hosts.push(host);
        }

        for link_config in config.links.iter() {
            if !(link_config.latency >= 0.) {
                return Err(PlatformError::InvalidValue {
                    what: format!("latency of link {}", link_config.name),
                    value: link_config.latency,
                });
            }
            platform.add_link(
                &link_config.name,
                link_config.bandwidth,
                link_config.latency,
                link_config.sharing,
            )?;
        }

        for router in config.routers.iter() {
            platform.routing.add_node(router)?;
        }

        for edge in config.edges.iter() {
            let from = platform.routing.node(&edge.from)?;
            let to = platform.routing.node(&edge.to)?;
            let link = platform.link_by_name(&edge.link)?;
            platform.routing.add_edge(from, to, link);
        }

        for route in config.routes.iter() {
            let src = platform.host_by_name(&route.src)?;
            let dst = platform.host_by_name(&route.dst)?;
            let links = route
                .links
                .iter()
                .map(|name| platform.link_by_name(name))
                .collect::<Result<Vec<_>, _>>()?;
            platform.routing.add_route(src, dst, links, route.symmetric);
        }

        log::debug!(
            "platform built: {} hosts, {} links, {} disks",
            platform.hosts.len(),
            platform.links.len(),
            platform.disks.len()
        );
        Ok(platform)
    }

    fn add_link(
        &mut self,
        name: &str,
        bandwidth: f64,
        latency: f64,
        sharing: SharingPolicy,
    ) -> Result<LinkId, PlatformError> {
        if self.link_by_name.contains_key(name) {
            return Err(PlatformError::DuplicateName(name.to_string()));
        }
        check_positive(&format!("bandwidth of link {}", name), bandwidth)?;
        let id = self.links.len();
        let constraint = self.model.system_mut().add_constraint(bandwidth, sharing);
        self.links.push(Link {
            id,
            name: name.to_string(),
            bandwidth,
            latency,
            sharing,
            scale: 1.,
            is_on: true,
            constraint,
            transferred: 0.,
        });
        self.link_by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn host(&self, id: HostId) -> &Host {
        &self.hosts[id]
    }

    pub fn host_by_name(&self, name: &str) -> Result<HostId, PlatformError> {
        self.host_by_name
            .get(name)
            .copied()
            .ok_or_else(|| PlatformError::UnknownHost(name.to_string()))
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id]
    }

    pub fn link_by_name(&self, name: &str) -> Result<LinkId, PlatformError> {
        self.link_by_name
            .get(name)
            .copied()
            .ok_or_else(|| PlatformError::UnknownLink(name.to_string()))
    }

    pub fn disks(&self) -> &[Disk] {
        &self.disks
    }

    pub fn disk(&self, id: DiskId) -> &Disk {
        &self.disks[id]
    }

    /// Finds disk by name among the disks of a host.
    pub fn disk_by_name(&self, host: HostId, name: &str) -> Result<DiskId, PlatformError> {
        self.hosts[host]
            .disks
            .iter()
            .copied()
            .find(|&disk| self.disks[disk].name == name)
            .ok_or_else(|| PlatformError::UnknownDisk(format!("{}:{}", self.hosts[host].name, name)))
    }

    /// Returns route between two hosts. Communications within one host use its loopback link.
    pub fn route(&mut self, src: HostId, dst: HostId) -> Result<Route, PlatformError> {
        let links = if src == dst {
            vec![self.hosts[src].loopback]
        } else {
            self.routing.route(src, dst).ok_or_else(|| PlatformError::NoRoute {
                src: self.hosts[src].name.clone(),
                dst: self.hosts[dst].name.clone(),
            })?
        };
        let latency = links.iter().map(|&link| self.links[link].latency).sum();
        Ok(Route { links, latency })
    }

    pub fn model(&self) -> &ResourceModel {
        &self.model
    }

    fn exec_bound(&self, host: HostId, user_bound: Option<f64>, factor: f64) -> Option<f64> {
        let core_speed = self.hosts[host].speed() * factor;
        Some(user_bound.map_or(core_speed, |bound| bound.min(core_speed)))
    }

    /// Starts computation of `flops` on a host. A single computation never uses more than one core.
    pub fn start_exec(&mut self, host: HostId, flops: f64, priority: f64, bound: Option<f64>) -> ActionId {
        let factor = self.hosts[host].speed_factor(flops);
        let cpu = self.hosts[host].cpu;
        let exec_bound = self.exec_bound(host, bound, factor);
        let id = self.model.start_action(flops, 0., priority, exec_bound, &[(cpu, 1. / factor)]);
        self.actions.insert(
            id,
            ActionTarget::Exec {
                host,
                user_bound: bound,
                factor,
            },
        );
        id
    }

    /// Each part of a parallel task runs on a single core of its host.
    fn parallel_bound(&self, hosts: &[HostId], flops: &[f64], user_bound: Option<f64>) -> Option<f64> {
        hosts
            .iter()
            .zip(flops.iter())
            .filter(|(_, &amount)| amount > 0.)
            .map(|(&host, &amount)| self.hosts[host].speed() / amount)
            .chain(user_bound)
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Starts a parallel task spanning several hosts.
    ///
    /// Host `i` computes `flops[i]` while `bytes[i * n + j]` bytes are sent from host `i` to host `j`,
    /// `bytes` may be empty if the task does not communicate. All parts progress at a single rate,
    /// so the amount of the action is the fraction of the task left to do. Latency of the task is
    /// the largest latency among the used routes.
    pub fn start_parallel_exec(
        &mut self,
        hosts: &[HostId],
        flops: &[f64],
        bytes: &[f64],
        priority: f64,
        bound: Option<f64>,
    ) -> Result<ActionId, PlatformError> {
        let n = hosts.len();
        if flops.len() != n {
            return Err(PlatformError::InvalidValue {
                what: "number of flops amounts of parallel task".to_string(),
                value: flops.len() as f64,
            });
        }
        if !bytes.is_empty() && bytes.len() != n * n {
            return Err(PlatformError::InvalidValue {
                what: "size of bytes matrix of parallel task".to_string(),
                value: bytes.len() as f64,
            });
        }
        if let Some(&value) = flops.iter().chain(bytes.iter()).find(|v| !(v.is_finite() && **v >= 0.)) {
            return Err(PlatformError::InvalidValue {
                what: "amount of parallel task".to_string(),
                value,
            });
        }

        let mut cpu_demand: BTreeMap<HostId, f64> = BTreeMap::new();
        for (&host, &amount) in hosts.iter().zip(flops.iter()) {
            if amount > 0. {
                *cpu_demand.entry(host).or_default() += amount;
            }
        }
        let mut link_demand: BTreeMap<LinkId, f64> = BTreeMap::new();
        let mut latency: f64 = 0.;
        for (index, &amount) in bytes.iter().enumerate() {
            if amount <= 0. {
                continue;
            }
            let route = self.route(hosts[index / n], hosts[index % n])?;
            latency = latency.max(route.latency);
            for link in route.links {
                *link_demand.entry(link).or_default() += amount;
            }
        }

        let mut demands = cpu_demand
            .iter()
            .map(|(&host, &amount)| (self.hosts[host].cpu, amount))
            .collect::<Vec<_>>();
        demands.extend(
            link_demand
                .iter()
                .map(|(&link, &amount)| (self.links[link].constraint, amount)),
        );
        // a task with nothing to do completes right after its latency
        let amount = if demands.is_empty() { 0. } else { 1. };
        let action_bound = self.parallel_bound(hosts, flops, bound);
        let id = self.model.start_action(amount, latency, priority, action_bound, &demands);
        self.actions.insert(
            id,
            ActionTarget::Parallel {
                hosts: hosts.to_vec(),
                flops: flops.to_vec(),
                links: link_demand.into_iter().collect(),
                user_bound: bound,
            },
        );
        Ok(id)
    }

    /// Starts transfer of `size` bytes along a route.
    pub fn start_comm(&mut self, route: &Route, size: f64, priority: f64, rate: Option<f64>) -> ActionId {
        let demands = route
            .links
            .iter()
            .map(|&link| (self.links[link].constraint, 1.))
            .collect::<Vec<_>>();
        let id = self.model.start_action(size, route.latency, priority, rate, &demands);
        self.actions.insert(
            id,
            ActionTarget::Comm {
                links: route.links.clone(),
            },
        );
        id
    }

    /// Starts I/O operation of `size` bytes on a disk.
    pub fn start_io(&mut self, disk: DiskId, op: IoOp, size: f64, priority: f64) -> ActionId {
        let constraint = self.disks[disk].constraint(op);
        let id = self.model.start_action(size, 0., priority, None, &[(constraint, 1.)]);
        self.actions.insert(id, ActionTarget::Io { disk, op });
        id
    }

    pub fn suspend_action(&mut self, id: ActionId) {
        self.model.suspend(id);
    }

    pub fn resume_action(&mut self, id: ActionId) {
        self.model.resume(id);
    }

    pub fn set_action_priority(&mut self, id: ActionId, priority: f64) {
        self.model.set_priority(id, priority);
    }

    /// Caps the rate of an action. Computations stay capped by the speed of one core.
    pub fn set_action_bound(&mut self, id: ActionId, bound: Option<f64>) {
        let bound = match self.actions.get_mut(&id) {
            Some(ActionTarget::Exec {
                host,
                user_bound,
                factor,
            }) => {
                *user_bound = bound;
                let (host, factor) = (*host, *factor);
                self.exec_bound(host, bound, factor)
            }
            Some(ActionTarget::Parallel {
                hosts,
                flops,
                user_bound,
                ..
            }) => {
                *user_bound = bound;
                let (hosts, flops) = (hosts.clone(), flops.clone());
                self.parallel_bound(&hosts, &flops, bound)
            }
            _ => bound,
        };
        self.model.set_bound(id, bound);
    }

    /// Removes an action from the model and returns its remaining amount.
    pub fn remove_action(&mut self, id: ActionId) -> Option<f64> {
        self.actions.remove(&id);
        self.model.remove(id)
    }

    pub fn action_remaining(&self, id: ActionId) -> Option<f64> {
        self.model.remaining(id)
    }

    pub fn action_rate(&mut self, id: ActionId) -> f64 {
        self.model.rate(id)
    }

    /// Delay until the next action completes its latency or its work.
    pub fn next_event_delay(&mut self) -> Option<f64> {
        self.model.next_event_delay()
    }

    /// Advances all actions by `delta` seconds, accounts energy and traffic and returns completed actions.
    pub fn advance(&mut self, delta: f64) -> Vec<ActionId> {
        self.model.system_mut().solve();
        for host in self.hosts.iter_mut() {
            let load = if host.is_on {
                let capacity = host.speed() * host.cores as f64;
                if capacity > 0. {
                    self.model.system().constraint_usage(host.cpu) / capacity
                } else {
                    0.
                }
            } else {
                0.
            };
            let (pstate, is_on) = (host.pstate, host.is_on);
            if let Some(energy) = host.energy.as_mut() {
                let power = energy.power(pstate, load, is_on);
                energy.accumulate(power, delta);
            }
        }

        let before = self
            .actions
            .keys()
            .filter_map(|&id| self.model.remaining(id).map(|remaining| (id, remaining)))
            .collect::<Vec<_>>();
        let finished = self.model.advance(delta);
        for (id, remaining_before) in before {
            let progress = remaining_before - self.model.remaining(id).unwrap_or(0.);
            if progress <= 0. {
                continue;
            }
            match &self.actions[&id] {
                ActionTarget::Comm { links } => {
                    for &link in links.iter() {
                        self.links[link].transferred += progress;
                    }
                }
                ActionTarget::Io { disk, op } => match op {
                    IoOp::Read => self.disks[*disk].bytes_read += progress,
                    IoOp::Write => self.disks[*disk].bytes_written += progress,
                },
                ActionTarget::Parallel { links, .. } => {
                    for &(link, amount) in links.iter() {
                        self.links[link].transferred += progress * amount;
                    }
                }
                ActionTarget::Exec { .. } => {}
            }
        }
        for id in finished.iter() {
            self.actions.remove(id);
        }
        finished
    }

    fn refresh_host(&mut self, host: HostId) {
        let capacity = self.hosts[host].capacity();
        self.model.system_mut().set_constraint_bound(self.hosts[host].cpu, capacity);
        let execs = self
            .actions
            .iter()
            .filter_map(|(&id, target)| match target {
                ActionTarget::Exec {
                    host: exec_host,
                    user_bound,
                    factor,
                } if *exec_host == host => Some((id, *user_bound, *factor)),
                _ => None,
            })
            .collect::<Vec<_>>();
        for (id, user_bound, factor) in execs {
            let bound = self.exec_bound(host, user_bound, factor);
            self.model.set_bound(id, bound);
        }
        let tasks = self
            .actions
            .iter()
            .filter_map(|(&id, target)| match target {
                ActionTarget::Parallel {
                    hosts,
                    flops,
                    user_bound,
                    ..
                } if hosts.contains(&host) => Some((id, hosts.clone(), flops.clone(), *user_bound)),
                _ => None,
            })
            .collect::<Vec<_>>();
        for (id, hosts, flops, user_bound) in tasks {
            let bound = self.parallel_bound(&hosts, &flops, user_bound);
            self.model.set_bound(id, bound);
        }
    }

    /// Turns host on or off. Turning a host off does not remove its actions, they just stop progressing.
    pub fn set_host_state(&mut self, host: HostId, on: bool) {
        self.hosts[host].is_on = on;
        let loopback = self.hosts[host].loopback;
        for &disk in self.hosts[host].disks.clone().iter() {
            self.set_disk_state(disk, on);
        }
        self.set_link_state(loopback, on);
        self.refresh_host(host);
        log::debug!("host {} turned {}", self.hosts[host].name, if on { "on" } else { "off" });
    }

    /// Sets the pstate of a host.
    pub fn set_pstate(&mut self, host: HostId, pstate: usize) -> Result<(), PlatformError> {
        let count = self.hosts[host].speeds.len();
        if pstate >= count {
            return Err(PlatformError::InvalidPstate {
                host: self.hosts[host].name.clone(),
                pstate,
                count,
            });
        }
        self.hosts[host].pstate = pstate;
        self.refresh_host(host);
        Ok(())
    }

    /// Sets the fraction of the peak speed available on the host.
    pub fn set_host_availability(&mut self, host: HostId, scale: f64) {
        self.hosts[host].scale = scale.max(0.);
        self.refresh_host(host);
    }

    /// Sets callback computing speed factor of computations started on the host from now on.
    pub fn set_speed_factor_fn(&mut self, host: HostId, factor_fn: Option<SpeedFactorFn>) {
        self.hosts[host].factor_fn = factor_fn;
    }

    /// Makes the CPU capacity of a host depend on the number of concurrent computations.
    pub fn set_host_throughput_function(&mut self, host: HostId, throughput_fn: Option<ThroughputFunction>) {
        let cpu = self.hosts[host].cpu;
        self.model.system_mut().set_throughput_function(cpu, throughput_fn);
    }

    /// Makes the bandwidth of a link depend on the number of concurrent transfers.
    pub fn set_link_throughput_function(&mut self, link: LinkId, throughput_fn: Option<ThroughputFunction>) {
        let constraint = self.links[link].constraint;
        self.model.system_mut().set_throughput_function(constraint, throughput_fn);
    }

    pub fn set_link_state(&mut self, link: LinkId, on: bool) {
        self.links[link].is_on = on;
        let capacity = self.links[link].capacity();
        self.model
            .system_mut()
            .set_constraint_bound(self.links[link].constraint, capacity);
    }

    pub fn set_link_bandwidth(&mut self, link: LinkId, bandwidth: f64) -> Result<(), PlatformError> {
        check_positive(&format!("bandwidth of link {}", self.links[link].name), bandwidth)?;
        self.links[link].bandwidth = bandwidth;
        let capacity = self.links[link].capacity();
        self.model
            .system_mut()
            .set_constraint_bound(self.links[link].constraint, capacity);
        Ok(())
    }

    /// Sets the fraction of the nominal bandwidth available on the link.
    pub fn set_link_availability(&mut self, link: LinkId, scale: f64) {
        self.links[link].scale = scale.max(0.);
        let capacity = self.links[link].capacity();
        self.model
            .system_mut()
            .set_constraint_bound(self.links[link].constraint, capacity);
    }

    pub fn set_disk_state(&mut self, disk: DiskId, on: bool) {
        self.disks[disk].is_on = on;
        let system = self.model.system_mut();
        for op in [IoOp::Read, IoOp::Write] {
            system.set_constraint_bound(self.disks[disk].constraint(op), self.disks[disk].capacity(op));
        }
    }

    /// Computation speed currently used on a host, in flops per second.
    pub fn host_load(&mut self, host: HostId) -> f64 {
        self.model.system_mut().solve();
        self.model.system().constraint_usage(self.hosts[host].cpu)
    }

    /// Bandwidth currently used on a link, in bytes per second.
    pub fn link_load(&mut self, link: LinkId) -> f64 {
        self.model.system_mut().solve();
        self.model.system().constraint_usage(self.links[link].constraint)
    }

    /// Current power of a host in watts, zero if the host has no energy model.
    pub fn host_power(&mut self, host: HostId) -> f64 {
        let load = self.host_load(host);
        let host = &self.hosts[host];
        let capacity = host.speed() * host.cores as f64;
        let ratio = if capacity > 0. { load / capacity } else { 0. };
        host.energy
            .as_ref()
            .map(|energy| energy.power(host.pstate, ratio, host.is_on))
            .unwrap_or(0.)
    }
}
