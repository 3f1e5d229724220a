#![warn(missing_docs)]
//! Core primitives shared across the workspace.

pub mod dimension;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use dimension::DimensionId;
pub use registry::{RegistryKey, RegistryKeyError, DEFAULT_NAMESPACE};

/// Discrete simulation step number (20 TPS => 50 ms per tick by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick in any timeline.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks, saturating at `u64::MAX`.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0.saturating_add(delta))
    }

    /// The tick immediately after this one.
    pub fn next(self) -> Self {
        self.advance(1)
    }
}

impl fmt::Display for SimTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_saturates() {
        assert_eq!(SimTick(5).advance(3), SimTick(8));
        assert_eq!(SimTick(u64::MAX).next(), SimTick(u64::MAX));
    }

    #[test]
    fn ticks_order_numerically() {
        assert!(SimTick::ZERO < SimTick(1));
        assert_eq!(SimTick(42).to_string(), "#42");
    }
}
