//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{read_file, SimError};

/// Parameters of the simulation engine which do not depend on the platform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seed of the random generator available to actors.
    pub seed: u64,
    /// Time tolerance in seconds used to decide that an activity is complete.
    pub precision: f64,
    /// Relative tolerance of the max-min solver.
    pub maxmin_precision: f64,
    /// Whether to record the in-memory [Trace](crate::trace::Trace).
    pub record_trace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 123,
            precision: 1e-9,
            maxmin_precision: 1e-9,
            record_trace: false,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml<P: AsRef<Path>>(file: P) -> Result<Self, SimError> {
        Self::from_yaml_str(&read_file(file.as_ref())?)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, SimError> {
        Ok(serde_yaml::from_str(content)?)
    }
}
