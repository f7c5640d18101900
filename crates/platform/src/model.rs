//! Resource model which tracks progress of resource actions.
//!
//! Each action corresponds to one running activity: it has some amount of work (flops or bytes), an optional
//! latency which must elapse before the work starts, and a variable in the [max-min system](MaxMinSystem)
//! which gives its current rate.

use std::collections::BTreeMap;

use crate::lmm::{ConstraintId, MaxMinSystem, VariableId};

pub type ActionId = u64;

struct Action {
    variable: VariableId,
    remaining: f64,
    latency: f64,
    priority: f64,
    suspended: bool,
}

impl Action {
    fn sharing_weight(&self) -> f64 {
        if self.suspended || self.latency > 0. {
            0.
        } else {
            1. / self.priority
        }
    }
}

/// Tracks remaining work of all running actions and computes when the next one completes.
pub struct ResourceModel {
    system: MaxMinSystem,
    actions: BTreeMap<ActionId, Action>,
    next_action_id: ActionId,
    precision: f64,
}

impl ResourceModel {
    /// Creates a new model.
    /// * `precision` --- time tolerance (in seconds) used to decide that an action is complete.
    /// * `maxmin_precision` --- relative tolerance of the max-min solver.
    pub fn new(precision: f64, maxmin_precision: f64) -> Self {
        Self {
            system: MaxMinSystem::new(maxmin_precision),
            actions: BTreeMap::new(),
            next_action_id: 0,
            precision,
        }
    }

    /// Underlying max-min system.
    pub fn system(&self) -> &MaxMinSystem {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut MaxMinSystem {
        &mut self.system
    }

    /// Starts a new action.
    ///
    /// `demands` lists the constraints consumed by the action together with consumption weights.
    /// Priority must be positive, actions with larger priority get a proportionally larger share.
    pub fn start_action(
        &mut self,
        amount: f64,
        latency: f64,
        priority: f64,
        bound: Option<f64>,
        demands: &[(ConstraintId, f64)],
    ) -> ActionId {
        assert!(priority > 0., "action priority must be positive, got {}", priority);
        assert!(amount >= 0., "action amount must be non-negative, got {}", amount);
        let id = self.next_action_id;
        self.next_action_id += 1;
        let mut action = Action {
            variable: 0,
            remaining: amount,
            latency: latency.max(0.),
            priority,
            suspended: false,
        };
        action.variable = self.system.add_variable(action.sharing_weight(), bound);
        for &(cnst, consumption) in demands {
            self.system.expand(cnst, action.variable, consumption);
        }
        self.actions.insert(id, action);
        id
    }

    /// Whether the action is tracked by the model.
    pub fn contains(&self, id: ActionId) -> bool {
        self.actions.contains_key(&id)
    }

    /// Freezes the action progress.
    pub fn suspend(&mut self, id: ActionId) {
        if let Some(action) = self.actions.get_mut(&id) {
            action.suspended = true;
            self.system.set_weight(action.variable, action.sharing_weight());
        }
    }

    /// Resumes a suspended action.
    pub fn resume(&mut self, id: ActionId) {
        if let Some(action) = self.actions.get_mut(&id) {
            action.suspended = false;
            self.system.set_weight(action.variable, action.sharing_weight());
        }
    }

    /// Removes the action and returns its remaining amount.
    pub fn remove(&mut self, id: ActionId) -> Option<f64> {
        let action = self.actions.remove(&id)?;
        self.system.remove_variable(action.variable);
        Some(action.remaining)
    }

    /// Changes priority of the action.
    pub fn set_priority(&mut self, id: ActionId, priority: f64) {
        assert!(priority > 0., "action priority must be positive, got {}", priority);
        if let Some(action) = self.actions.get_mut(&id) {
            action.priority = priority;
            self.system.set_weight(action.variable, action.sharing_weight());
        }
    }

    /// Changes rate bound of the action.
    pub fn set_bound(&mut self, id: ActionId, bound: Option<f64>) {
        if let Some(action) = self.actions.get(&id) {
            self.system.set_bound(action.variable, bound);
        }
    }

    /// Remaining amount of work of the action.
    pub fn remaining(&self, id: ActionId) -> Option<f64> {
        self.actions.get(&id).map(|a| a.remaining)
    }

    /// Current rate of the action. Solves the system if needed.
    pub fn rate(&mut self, id: ActionId) -> f64 {
        self.system.solve();
        self.actions
            .get(&id)
            .map(|a| self.system.value(a.variable))
            .unwrap_or(0.)
    }

    /// Number of tracked actions.
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    fn delay(&self, action: &Action) -> Option<f64> {
        if action.suspended {
            return None;
        }
        if action.latency > 0. {
            return Some(action.latency);
        }
        if action.remaining <= 0. {
            return Some(0.);
        }
        let rate = self.system.value(action.variable);
        if rate <= 0. {
            None
        } else if rate.is_infinite() {
            Some(0.)
        } else {
            Some(action.remaining / rate)
        }
    }

    /// Returns the minimum time until some action finishes its latency phase or its work.
    pub fn next_event_delay(&mut self) -> Option<f64> {
        self.system.solve();
        self.actions
            .values()
            .filter_map(|action| self.delay(action))
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Advances all actions by `delta` seconds and returns actions which completed, in creation order.
    ///
    /// `delta` must not exceed [next_event_delay](Self::next_event_delay).
    pub fn advance(&mut self, delta: f64) -> Vec<ActionId> {
        assert!(delta >= 0., "time can't go backwards (delta = {})", delta);
        self.system.solve();
        let mut finished = Vec::new();
        let mut reweighted = Vec::new();
        for (&id, action) in self.actions.iter_mut() {
            if action.suspended {
                continue;
            }
            if action.latency > 0. {
                if action.latency <= delta + self.precision {
                    action.latency = 0.;
                    reweighted.push(id);
                    if action.remaining <= 0. {
                        finished.push(id);
                    }
                } else {
                    action.latency -= delta;
                }
                continue;
            }
            let rate = self.system.value(action.variable);
            if rate <= 0. && action.remaining > 0. {
                continue;
            }
            let eta = if rate.is_infinite() { 0. } else { action.remaining / rate };
            if eta <= delta + self.precision {
                action.remaining = 0.;
                finished.push(id);
            } else {
                action.remaining -= rate * delta;
                assert!(
                    action.remaining > 0.,
                    "action {} has negative remaining amount {}",
                    id,
                    action.remaining
                );
            }
        }
        for id in reweighted {
            let action = &self.actions[&id];
            self.system.set_weight(action.variable, action.sharing_weight());
        }
        for &id in finished.iter() {
            self.remove(id);
        }
        finished
    }
}
