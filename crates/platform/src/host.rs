//! Model of a host.

use std::collections::BTreeMap;

use crate::{disk::DiskId, energy::EnergyModel, link::LinkId, lmm::ConstraintId};

pub type HostId = usize;

/// Callback returning the speed factor of an execution given its size in flops.
pub type SpeedFactorFn = Box<dyn Fn(f64) -> f64>;

/// Computing host.
pub struct Host {
    pub(crate) id: HostId,
    pub(crate) name: String,
    pub(crate) speeds: Vec<f64>,
    pub(crate) pstate: usize,
    pub(crate) cores: u32,
    pub(crate) is_on: bool,
    pub(crate) scale: f64,
    pub(crate) cpu: ConstraintId,
    pub(crate) loopback: LinkId,
    pub(crate) disks: Vec<DiskId>,
    pub(crate) energy: Option<EnergyModel>,
    pub(crate) factor_fn: Option<SpeedFactorFn>,
    pub(crate) properties: BTreeMap<String, String>,
}

impl Host {
    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current speed of one core, taking the pstate and the availability into account.
    pub fn speed(&self) -> f64 {
        self.speeds[self.pstate] * self.scale
    }

    /// Peak speed of one core at the current pstate.
    pub fn peak_speed(&self) -> f64 {
        self.speeds[self.pstate]
    }

    /// Fraction of the peak speed which is currently available.
    pub fn available_speed(&self) -> f64 {
        self.scale
    }

    pub fn pstate(&self) -> usize {
        self.pstate
    }

    pub fn pstate_count(&self) -> usize {
        self.speeds.len()
    }

    pub fn pstate_speed(&self, pstate: usize) -> Option<f64> {
        self.speeds.get(pstate).copied()
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn disks(&self) -> &[DiskId] {
        &self.disks
    }

    pub fn loopback(&self) -> LinkId {
        self.loopback
    }

    /// Total energy consumed by the host, zero if the host has no energy model.
    pub fn energy(&self) -> f64 {
        self.energy.as_ref().map(|e| e.consumed()).unwrap_or(0.)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }

    pub(crate) fn capacity(&self) -> f64 {
        if self.is_on {
            self.speed() * self.cores as f64
        } else {
            0.
        }
    }

    pub(crate) fn speed_factor(&self, flops: f64) -> f64 {
        self.factor_fn.as_ref().map(|f| f(flops)).unwrap_or(1.)
    }
}
