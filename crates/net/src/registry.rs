//! Finalize-once mapping between names and dense wire ids.

use crate::error::EncodeError;
use crate::snapshot::MirroredRegistry;
use std::collections::HashMap;
use thiserror::Error;
use tickwire_core::{RegistryKey, RegistryKeyError};

/// Anything that can live in a [`ClassRegistry`].
pub trait RegistryEntry {
    /// Unique name of the entry.
    fn name(&self) -> &RegistryKey;
}

/// Registration failures. These are programming or configuration errors
/// detected at startup, before any connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// `register` was called after `finalize`.
    #[error("registry {registry} is finalized; cannot register {name}")]
    AlreadyFinalized {
        /// Registry label.
        registry: RegistryKey,
        /// Rejected entry.
        name: RegistryKey,
    },
    /// Name already taken.
    #[error("registry {registry} already contains {name}")]
    Duplicate {
        /// Registry label.
        registry: RegistryKey,
        /// Colliding name.
        name: RegistryKey,
    },
    /// A declared name did not parse.
    #[error("invalid registry name {name:?}: {source}")]
    InvalidName {
        /// Text as declared.
        name: String,
        /// Parse failure.
        #[source]
        source: RegistryKeyError,
    },
    /// More entries than fit in a 32-bit wire id.
    #[error("registry {0} is full")]
    Full(RegistryKey),
    /// The finalized tables could not be encoded into a snapshot.
    #[error("registry snapshot cannot be encoded: {0}")]
    Snapshot(#[from] EncodeError),
}

/// Append-only, finalize-once registry.
///
/// Wire ids are assigned densely from 0 in registration order when
/// [`ClassRegistry::finalize`] runs. Lookups return `None` until then.
#[derive(Debug)]
pub struct ClassRegistry<E> {
    label: RegistryKey,
    entries: Vec<E>,
    by_name: HashMap<RegistryKey, u32>,
    finalized: bool,
}

impl<E: RegistryEntry> ClassRegistry<E> {
    /// Empty registry identified by `label` in snapshots and errors.
    pub fn new(label: RegistryKey) -> Self {
        Self {
            label,
            entries: Vec::new(),
            by_name: HashMap::new(),
            finalized: false,
        }
    }

    /// Registry label.
    pub fn label(&self) -> &RegistryKey {
        &self.label
    }

    /// Add an entry. Fails after finalize or on a duplicate name.
    pub fn register(&mut self, entry: E) -> Result<(), RegistryError> {
        let name = entry.name().clone();
        if self.finalized {
            return Err(RegistryError::AlreadyFinalized {
                registry: self.label.clone(),
                name,
            });
        }
        if self.by_name.contains_key(&name) {
            return Err(RegistryError::Duplicate {
                registry: self.label.clone(),
                name,
            });
        }
        let id = u32::try_from(self.entries.len())
            .map_err(|_| RegistryError::Full(self.label.clone()))?;
        self.by_name.insert(name, id);
        self.entries.push(entry);
        Ok(())
    }

    /// Freeze the registry. Calling it again has no effect.
    pub fn finalize(&mut self) {
        if !self.finalized {
            self.entries.shrink_to_fit();
            self.finalized = true;
        }
    }

    /// Whether [`ClassRegistry::finalize`] has run.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Entry with the given wire id.
    pub fn get_by_id(&self, id: u32) -> Option<&E> {
        if !self.finalized {
            return None;
        }
        self.entries.get(id as usize)
    }

    /// Wire id and entry for `name`.
    pub fn get_by_name(&self, name: &RegistryKey) -> Option<(u32, &E)> {
        if !self.finalized {
            return None;
        }
        let id = *self.by_name.get(name)?;
        Some((id, &self.entries[id as usize]))
    }

    /// Entries with their wire ids, in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &E)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (index as u32, entry))
    }

    /// Name/id table as it appears in the registry snapshot.
    pub fn mirror(&self) -> MirroredRegistry {
        MirroredRegistry {
            name: self.label.clone(),
            entries: self
                .iter()
                .map(|(id, entry)| (id, entry.name().clone()))
                .collect(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a declared type name, keeping the offending text on failure.
pub fn parse_name(name: &str) -> Result<RegistryKey, RegistryError> {
    RegistryKey::parse(name).map_err(|source| RegistryError::InvalidName {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Named(RegistryKey);

    impl RegistryEntry for Named {
        fn name(&self) -> &RegistryKey {
            &self.0
        }
    }

    fn named(name: &str) -> Named {
        Named(RegistryKey::parse(name).unwrap())
    }

    fn registry() -> ClassRegistry<Named> {
        ClassRegistry::new(RegistryKey::parse("test:things").unwrap())
    }

    #[test]
    fn ids_follow_registration_order() {
        let mut reg = registry();
        for name in ["c", "a", "b"] {
            reg.register(named(name)).unwrap();
        }
        reg.finalize();

        assert_eq!(reg.get_by_id(0), Some(&named("c")));
        assert_eq!(reg.get_by_id(1), Some(&named("a")));
        assert_eq!(reg.get_by_id(2), Some(&named("b")));
        assert_eq!(reg.get_by_id(3), None);
        assert_eq!(reg.get_by_name(&named("b").0).map(|(id, _)| id), Some(2));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut reg = registry();
        reg.register(named("a")).unwrap();
        assert!(matches!(
            reg.register(named("a")),
            Err(RegistryError::Duplicate { .. })
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn register_after_finalize_fails() {
        let mut reg = registry();
        reg.register(named("a")).unwrap();
        reg.finalize();
        reg.finalize();
        assert!(matches!(
            reg.register(named("b")),
            Err(RegistryError::AlreadyFinalized { .. })
        ));
        assert_eq!(reg.get_by_id(0), Some(&named("a")));
    }

    #[test]
    fn lookups_wait_for_finalize() {
        let mut reg = registry();
        reg.register(named("a")).unwrap();
        assert!(!reg.is_finalized());
        assert_eq!(reg.get_by_id(0), None);
        assert_eq!(reg.get_by_name(&named("a").0), None);
    }

    #[test]
    fn invalid_declared_names_are_reported() {
        assert!(matches!(
            parse_name("Bad Name"),
            Err(RegistryError::InvalidName { .. })
        ));
        assert_eq!(parse_name("x").unwrap().to_string(), "tickwire:x");
    }
}
