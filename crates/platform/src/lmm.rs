//! Linear max-min fairness solver.
//!
//! The system consists of *constraints* (resources with a finite capacity) and *variables* (demands whose rates are
//! computed). Each variable consumes some of its constraints with a consumption weight and has a sharing weight:
//! two variables with the same consumption on a saturated constraint get rates inversely proportional to their
//! sharing weights. A variable may also be bounded from above.
//!
//! [MaxMinSystem::solve] computes the weighted max-min fair allocation using progressive filling: at each round the
//! most constrained resource is saturated and the variables crossing it are fixed, unless some of these variables
//! reach their bound first, in which case only those are fixed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub type ConstraintId = usize;
pub type VariableId = u64;

/// Function describing the fraction of the nominal capacity of a resource which is available
/// when the resource is shared by the given number of concurrent demands.
pub type ThroughputFunction = Box<dyn Fn(usize) -> f64>;

/// How the capacity of a constraint is shared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingPolicy {
    /// Sum of all consumptions must not exceed the capacity.
    #[default]
    Shared,
    /// Each consumption alone must not exceed the capacity.
    FatPipe,
}

struct Constraint {
    bound: f64,
    policy: SharingPolicy,
    throughput_fn: Option<ThroughputFunction>,
    elements: BTreeMap<VariableId, f64>,
    effective_bound: f64,
    usage: f64,
}

struct Variable {
    weight: f64,
    bound: Option<f64>,
    elements: Vec<(ConstraintId, f64)>,
    value: f64,
}

/// Max-min fairness system.
pub struct MaxMinSystem {
    constraints: Vec<Constraint>,
    variables: BTreeMap<VariableId, Variable>,
    next_variable_id: VariableId,
    precision: f64,
    modified: bool,
}

impl MaxMinSystem {
    /// Creates an empty system. `precision` is the relative tolerance used to detect saturated constraints.
    pub fn new(precision: f64) -> Self {
        Self {
            constraints: Vec::new(),
            variables: BTreeMap::new(),
            next_variable_id: 0,
            precision,
            modified: false,
        }
    }

    /// Adds a new constraint with a given capacity.
    pub fn add_constraint(&mut self, bound: f64, policy: SharingPolicy) -> ConstraintId {
        self.constraints.push(Constraint {
            bound,
            policy,
            throughput_fn: None,
            elements: BTreeMap::new(),
            effective_bound: bound,
            usage: 0.,
        });
        self.modified = true;
        self.constraints.len() - 1
    }

    /// Nominal capacity of a constraint.
    pub fn constraint_bound(&self, cnst: ConstraintId) -> f64 {
        self.constraints[cnst].bound
    }

    /// Changes the capacity of a constraint.
    pub fn set_constraint_bound(&mut self, cnst: ConstraintId, bound: f64) {
        self.constraints[cnst].bound = bound;
        self.modified = true;
    }

    /// Sets function which scales the capacity of a constraint depending on the number of concurrent demands.
    pub fn set_throughput_function(&mut self, cnst: ConstraintId, throughput_fn: Option<ThroughputFunction>) {
        self.constraints[cnst].throughput_fn = throughput_fn;
        self.modified = true;
    }

    /// Capacity currently consumed by all variables of a constraint, as of the last [solve](Self::solve).
    pub fn constraint_usage(&self, cnst: ConstraintId) -> f64 {
        self.constraints[cnst].usage
    }

    /// Number of enabled variables which consume a constraint.
    pub fn constraint_concurrency(&self, cnst: ConstraintId) -> usize {
        Self::concurrency(&self.constraints[cnst], &self.variables)
    }

    fn concurrency(cnst: &Constraint, variables: &BTreeMap<VariableId, Variable>) -> usize {
        cnst.elements
            .iter()
            .filter(|(id, consumption)| **consumption > 0. && variables[*id].weight > 0.)
            .count()
    }

    /// Adds a new variable. Variables with zero `weight` are disabled and get no share.
    pub fn add_variable(&mut self, weight: f64, bound: Option<f64>) -> VariableId {
        let id = self.next_variable_id;
        self.next_variable_id += 1;
        self.variables.insert(
            id,
            Variable {
                weight,
                bound,
                elements: Vec::new(),
                value: 0.,
            },
        );
        self.modified = true;
        id
    }

    /// Makes a variable consume a constraint with the given consumption weight.
    ///
    /// Expanding a variable twice on the same constraint adds consumptions up on shared constraints
    /// and keeps the maximum on fat-pipe ones.
    pub fn expand(&mut self, cnst: ConstraintId, var: VariableId, consumption: f64) {
        let constraint = &mut self.constraints[cnst];
        let entry = constraint.elements.entry(var).or_insert(0.);
        *entry = match constraint.policy {
            SharingPolicy::Shared => *entry + consumption,
            SharingPolicy::FatPipe => entry.max(consumption),
        };
        let value = *entry;
        let variable = self.variables.get_mut(&var).expect("expanding unknown variable");
        match variable.elements.iter_mut().find(|(id, _)| *id == cnst) {
            Some(element) => element.1 = value,
            None => variable.elements.push((cnst, value)),
        }
        self.modified = true;
    }

    /// Removes a variable from the system.
    pub fn remove_variable(&mut self, var: VariableId) {
        if let Some(variable) = self.variables.remove(&var) {
            for (cnst, _) in variable.elements {
                self.constraints[cnst].elements.remove(&var);
            }
            self.modified = true;
        }
    }

    /// Sharing weight of a variable.
    pub fn weight(&self, var: VariableId) -> f64 {
        self.variables[&var].weight
    }

    /// Changes sharing weight of a variable. Zero weight disables the variable.
    pub fn set_weight(&mut self, var: VariableId, weight: f64) {
        if let Some(variable) = self.variables.get_mut(&var) {
            if variable.weight != weight {
                variable.weight = weight;
                self.modified = true;
            }
        }
    }

    /// Upper bound of a variable.
    pub fn bound(&self, var: VariableId) -> Option<f64> {
        self.variables[&var].bound
    }

    /// Changes upper bound of a variable.
    pub fn set_bound(&mut self, var: VariableId, bound: Option<f64>) {
        if let Some(variable) = self.variables.get_mut(&var) {
            variable.bound = bound;
            self.modified = true;
        }
    }

    /// Rate of a variable as of the last [solve](Self::solve).
    pub fn value(&self, var: VariableId) -> f64 {
        self.variables.get(&var).map(|v| v.value).unwrap_or(0.)
    }

    /// Whether the system was modified since the last solve.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Number of variables in the system.
    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    fn saturates(&self, ratio: f64, min_ratio: f64) -> bool {
        ratio - min_ratio <= self.precision * min_ratio.abs().max(1e-12)
    }

    /// Computes the max-min fair allocation. Does nothing if the system was not modified.
    pub fn solve(&mut self) {
        if !self.modified {
            return;
        }
        self.modified = false;

        let variables = &self.variables;
        for cnst in self.constraints.iter_mut() {
            let concurrency = Self::concurrency(cnst, variables);
            cnst.effective_bound = match &cnst.throughput_fn {
                Some(throughput_fn) => cnst.bound * throughput_fn(concurrency),
                None => cnst.bound,
            };
            cnst.usage = 0.;
        }

        let mut pending = BTreeSet::new();
        for (&id, var) in self.variables.iter_mut() {
            var.value = 0.;
            if var.weight <= 0. {
                continue;
            }
            let consumed = var.elements.iter().filter(|(_, consumption)| *consumption > 0.);
            let mut has_constraints = false;
            let mut blocked = false;
            for &(cnst, _) in consumed {
                has_constraints = true;
                if self.constraints[cnst].effective_bound <= 0. {
                    blocked = true;
                }
            }
            if blocked {
                continue;
            }
            if !has_constraints {
                var.value = var.bound.unwrap_or(f64::INFINITY);
                continue;
            }
            pending.insert(id);
        }

        let mut remaining = self.constraints.iter().map(|c| c.effective_bound).collect::<Vec<_>>();
        let mut usage = vec![0.; self.constraints.len()];

        while !pending.is_empty() {
            usage.iter_mut().for_each(|u| *u = 0.);
            for id in pending.iter() {
                let var = &self.variables[id];
                for &(cnst, consumption) in var.elements.iter() {
                    if consumption <= 0. {
                        continue;
                    }
                    let demand = consumption / var.weight;
                    match self.constraints[cnst].policy {
                        SharingPolicy::Shared => usage[cnst] += demand,
                        SharingPolicy::FatPipe => usage[cnst] = f64::max(usage[cnst], demand),
                    }
                }
            }

            let mut min_ratio = f64::INFINITY;
            for (cnst, &cnst_usage) in usage.iter().enumerate() {
                if cnst_usage > 0. {
                    min_ratio = min_ratio.min(remaining[cnst].max(0.) / cnst_usage);
                }
            }
            if !min_ratio.is_finite() {
                break;
            }

            let saturated = usage
                .iter()
                .enumerate()
                .filter(|(cnst, u)| **u > 0. && self.saturates(remaining[*cnst].max(0.) / **u, min_ratio))
                .map(|(cnst, _)| cnst)
                .collect::<BTreeSet<_>>();

            let saturated_vars = pending
                .iter()
                .copied()
                .filter(|id| {
                    self.variables[id]
                        .elements
                        .iter()
                        .any(|(cnst, consumption)| *consumption > 0. && saturated.contains(cnst))
                })
                .collect::<Vec<_>>();

            let min_bound = saturated_vars
                .iter()
                .filter_map(|id| {
                    let var = &self.variables[id];
                    var.bound.map(|bound| bound * var.weight)
                })
                .filter(|&bound| bound < min_ratio)
                .fold(f64::INFINITY, f64::min);

            let fixed = if min_bound.is_finite() {
                saturated_vars
                    .iter()
                    .filter_map(|id| {
                        let var = &self.variables[id];
                        let bound = var.bound?;
                        self.saturates(bound * var.weight, min_bound).then_some((*id, bound))
                    })
                    .collect::<Vec<_>>()
            } else {
                saturated_vars
                    .iter()
                    .map(|id| (*id, min_ratio / self.variables[id].weight))
                    .collect::<Vec<_>>()
            };

            for (id, value) in fixed {
                pending.remove(&id);
                let var = self.variables.get_mut(&id).expect("fixed variable exists");
                var.value = value;
                for &(cnst, consumption) in var.elements.iter() {
                    if self.constraints[cnst].policy == SharingPolicy::Shared {
                        remaining[cnst] -= consumption * value;
                    }
                }
            }
        }

        for var in self.variables.values() {
            if !var.value.is_finite() {
                continue;
            }
            for &(cnst, consumption) in var.elements.iter() {
                let constraint = &mut self.constraints[cnst];
                match constraint.policy {
                    SharingPolicy::Shared => constraint.usage += consumption * var.value,
                    SharingPolicy::FatPipe => constraint.usage = constraint.usage.max(consumption * var.value),
                }
            }
        }

        log::trace!(
            "max-min solved: {} variables, {} constraints",
            self.variables.len(),
            self.constraints.len()
        );
    }
}
