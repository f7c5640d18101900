//! Model of a network link.

use crate::lmm::{ConstraintId, SharingPolicy};

pub type LinkId = usize;

/// Network link.
pub struct Link {
    pub(crate) id: LinkId,
    pub(crate) name: String,
    pub(crate) bandwidth: f64,
    pub(crate) latency: f64,
    pub(crate) sharing: SharingPolicy,
    pub(crate) scale: f64,
    pub(crate) is_on: bool,
    pub(crate) constraint: ConstraintId,
    pub(crate) transferred: f64,
}

impl Link {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current bandwidth, taking the availability into account.
    pub fn bandwidth(&self) -> f64 {
        self.bandwidth * self.scale
    }

    pub fn latency(&self) -> f64 {
        self.latency
    }

    pub fn sharing(&self) -> SharingPolicy {
        self.sharing
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    /// Total amount of bytes which went through the link.
    pub fn transferred(&self) -> f64 {
        self.transferred
    }

    pub(crate) fn capacity(&self) -> f64 {
        if self.is_on {
            self.bandwidth()
        } else {
            0.
        }
    }
}
