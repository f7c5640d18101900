//! Model of a disk attached to a host.

use serde::{Deserialize, Serialize};

use crate::{host::HostId, lmm::ConstraintId};

pub type DiskId = usize;

/// Direction of an I/O operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoOp {
    Read,
    Write,
}

/// Disk with independent read and write bandwidths.
pub struct Disk {
    pub(crate) id: DiskId,
    pub(crate) name: String,
    pub(crate) host: HostId,
    pub(crate) read_bandwidth: f64,
    pub(crate) write_bandwidth: f64,
    pub(crate) read_constraint: ConstraintId,
    pub(crate) write_constraint: ConstraintId,
    pub(crate) is_on: bool,
    pub(crate) bytes_read: f64,
    pub(crate) bytes_written: f64,
}

impl Disk {
    pub fn id(&self) -> DiskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host the disk is attached to.
    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn read_bandwidth(&self) -> f64 {
        self.read_bandwidth
    }

    pub fn write_bandwidth(&self) -> f64 {
        self.write_bandwidth
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn bytes_read(&self) -> f64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> f64 {
        self.bytes_written
    }

    pub(crate) fn constraint(&self, op: IoOp) -> ConstraintId {
        match op {
            IoOp::Read => self.read_constraint,
            IoOp::Write => self.write_constraint,
        }
    }

    pub(crate) fn capacity(&self, op: IoOp) -> f64 {
        if !self.is_on {
            return 0.;
        }
        match op {
            IoOp::Read => self.read_bandwidth,
            IoOp::Write => self.write_bandwidth,
        }
    }
}
