//! Platform description.

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{error::PlatformError, lmm::SharingPolicy};

fn default_cores() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_loopback_bandwidth() -> f64 {
    10e9
}

/// Linear power model of a host, one value per pstate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnergyConfig {
    /// Power consumed by an idle host, in watts.
    pub idle_watts: Vec<f64>,
    /// Power consumed by a fully loaded host, in watts.
    pub busy_watts: Vec<f64>,
    /// Power consumed by a host which is turned off.
    #[serde(default)]
    pub off_watts: f64,
}

/// Change of a resource availability at some moment of time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileEvent {
    pub time: f64,
    /// Fraction of the nominal capacity which is available starting from `time`.
    pub value: f64,
}

/// Resource turns on or off at some moment of time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub time: f64,
    pub on: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub name: String,
    /// Read bandwidth in bytes per second.
    pub read_bandwidth: f64,
    /// Write bandwidth in bytes per second.
    pub write_bandwidth: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    /// Peak speed in flops per second for each pstate.
    pub speeds: Vec<f64>,
    /// Number of cores, each core runs at the full host speed.
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Initial pstate.
    #[serde(default)]
    pub pstate: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<EnergyConfig>,
    /// Availability changes of the host speed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub speed_profile: Vec<ProfileEvent>,
    /// Moments when the host is turned on or off.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_profile: Vec<StateEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl HostConfig {
    /// Host with a single pstate and a single core.
    pub fn new(name: &str, speed: f64) -> Self {
        Self {
            name: name.to_string(),
            speeds: vec![speed],
            cores: 1,
            pstate: 0,
            energy: None,
            speed_profile: Vec::new(),
            state_profile: Vec::new(),
            disks: Vec::new(),
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    /// Bandwidth in bytes per second.
    pub bandwidth: f64,
    /// Latency in seconds.
    #[serde(default)]
    pub latency: f64,
    #[serde(default)]
    pub sharing: SharingPolicy,
    /// Availability changes of the link bandwidth.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bandwidth_profile: Vec<ProfileEvent>,
    /// Moments when the link is turned on or off.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state_profile: Vec<StateEvent>,
}

impl LinkConfig {
    pub fn new(name: &str, bandwidth: f64, latency: f64) -> Self {
        Self {
            name: name.to_string(),
            bandwidth,
            latency,
            sharing: SharingPolicy::Shared,
            bandwidth_profile: Vec::new(),
            state_profile: Vec::new(),
        }
    }
}

/// Link connecting two nodes (hosts or routers) of the topology graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub from: String,
    pub to: String,
    pub link: String,
}

/// Explicit route between two hosts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub src: String,
    pub dst: String,
    pub links: Vec<String>,
    /// Whether the same route (reversed) is used from `dst` to `src`.
    #[serde(default = "default_true")]
    pub symmetric: bool,
}

/// Link used by communications between actors located on the same host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    #[serde(default = "default_loopback_bandwidth")]
    pub bandwidth: f64,
    #[serde(default)]
    pub latency: f64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            bandwidth: default_loopback_bandwidth(),
            latency: 0.,
        }
    }
}

/// Description of the simulated platform.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub hosts: Vec<HostConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkConfig>,
    /// Intermediate nodes of the topology graph.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<EdgeConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub loopback: LoopbackConfig,
}

impl PlatformConfig {
    /// Reads platform description from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(file: P) -> Result<Self, PlatformError> {
        let content = std::fs::read_to_string(&file).map_err(|source| PlatformError::Io {
            path: file.as_ref().display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parses platform description from a YAML string.
    pub fn from_yaml_str(content: &str) -> Result<Self, PlatformError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Serializes platform description to YAML.
    pub fn to_yaml(&self) -> Result<String, PlatformError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self, PlatformError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn to_json(&self) -> Result<String, PlatformError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
