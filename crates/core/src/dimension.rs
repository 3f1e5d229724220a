//! Dimension identifiers.
//!
//! Block state lives per dimension, and clients name dimensions by their
//! registry key, so every dimension has a fixed key in the default namespace.

use crate::registry::{RegistryKey, DEFAULT_NAMESPACE};
use serde::{Deserialize, Serialize};

/// A world dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DimensionId {
    /// Surface dimension.
    Overworld = 0,
    /// Underworld.
    Nether = 1,
    /// End dimension.
    End = 2,
}

impl DimensionId {
    /// Default (Overworld) dimension.
    pub const DEFAULT: Self = Self::Overworld;

    /// Every dimension, in id order.
    pub const ALL: [Self; 3] = [Self::Overworld, Self::Nether, Self::End];

    /// Numeric id, also the dimension's position in the mirrored table.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`DimensionId::as_u8`].
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Overworld),
            1 => Some(Self::Nether),
            2 => Some(Self::End),
            _ => None,
        }
    }

    /// Path part of the dimension's key.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Overworld => "overworld",
            Self::Nether => "nether",
            Self::End => "end",
        }
    }

    /// Registry key, e.g. `tickwire:overworld`.
    pub fn key(self) -> RegistryKey {
        RegistryKey {
            namespace: DEFAULT_NAMESPACE.to_string(),
            path: self.as_str().to_string(),
        }
    }

    /// Dimension named by `key`.
    pub fn from_key(key: &RegistryKey) -> Option<Self> {
        if key.namespace() != DEFAULT_NAMESPACE {
            return None;
        }
        Self::ALL.into_iter().find(|dim| dim.as_str() == key.path())
    }
}

impl Default for DimensionId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_id_is_stable() {
        for (index, dim) in DimensionId::ALL.into_iter().enumerate() {
            assert_eq!(usize::from(dim.as_u8()), index);
            assert_eq!(DimensionId::from_u8(dim.as_u8()), Some(dim));
        }
        assert_eq!(DimensionId::from_u8(3), None);
    }

    #[test]
    fn keys_resolve_back_to_dimensions() {
        let nether = RegistryKey::parse("nether").unwrap();
        assert_eq!(DimensionId::from_key(&nether), Some(DimensionId::Nether));
        assert_eq!(DimensionId::End.key().to_string(), "tickwire:end");

        let foreign = RegistryKey::parse("other:nether").unwrap();
        assert_eq!(DimensionId::from_key(&foreign), None);
    }
}
