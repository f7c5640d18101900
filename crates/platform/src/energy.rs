//! Energy consumption of hosts.

use crate::config::EnergyConfig;

/// Linear power model: an idle host consumes `idle` watts, a fully loaded one consumes `busy` watts,
/// power grows linearly with the CPU load in between.
#[derive(Clone, Debug)]
pub struct EnergyModel {
    idle_watts: Vec<f64>,
    busy_watts: Vec<f64>,
    off_watts: f64,
    consumed: f64,
}

impl EnergyModel {
    pub fn new(config: &EnergyConfig) -> Self {
        Self {
            idle_watts: config.idle_watts.clone(),
            busy_watts: config.busy_watts.clone(),
            off_watts: config.off_watts,
            consumed: 0.,
        }
    }

    /// Current power in watts for a given pstate and load ratio in `[0, 1]`.
    pub fn power(&self, pstate: usize, load: f64, is_on: bool) -> f64 {
        if !is_on {
            return self.off_watts;
        }
        let idle = self.idle_watts.get(pstate).or(self.idle_watts.last()).copied().unwrap_or(0.);
        let busy = self.busy_watts.get(pstate).or(self.busy_watts.last()).copied().unwrap_or(idle);
        idle + (busy - idle) * load.clamp(0., 1.)
    }

    /// Total energy consumed so far, in joules.
    pub fn consumed(&self) -> f64 {
        self.consumed
    }

    pub(crate) fn accumulate(&mut self, power: f64, delta: f64) {
        self.consumed += power * delta;
    }
}
