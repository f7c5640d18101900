//! Simulated platform: hosts, network links, disks and the max-min fair sharing model of their capacity.

pub mod config;
pub mod disk;
pub mod energy;
pub mod error;
pub mod host;
pub mod link;
pub mod lmm;
pub mod model;
pub mod platform;
pub mod routing;
pub mod topology;
