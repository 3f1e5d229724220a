//! Namespaced names.
//!
//! Every registered command, message and host object kind is identified by a
//! `namespace:path` key (e.g. `tickwire:set_block`). Keys are validated ascii,
//! so their byte length always equals their character length.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Namespace used when a key omits an explicit namespace.
pub const DEFAULT_NAMESPACE: &str = "tickwire";

const MAX_NAMESPACE_LEN: usize = 64;
const MAX_PATH_LEN: usize = 128;

/// Error returned when parsing an invalid [`RegistryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryKeyError {
    /// Input was empty or whitespace.
    #[error("registry key cannot be empty")]
    Empty,
    /// Namespace part was empty.
    #[error("registry key namespace cannot be empty")]
    EmptyNamespace,
    /// Path part was empty.
    #[error("registry key path cannot be empty")]
    EmptyPath,
    /// A part exceeded its length limit.
    #[error("registry key {part} too long ({len} > {max})")]
    TooLong {
        /// Which part (`namespace` or `path`).
        part: &'static str,
        /// Observed length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },
    /// A part contained a character outside its allowed set.
    #[error("registry key {part} has invalid character {found:?}")]
    InvalidChar {
        /// Which part (`namespace` or `path`).
        part: &'static str,
        /// First offending character.
        found: char,
    },
}

/// A namespaced key of the form `namespace:path`.
///
/// Ordering is lexical by `(namespace, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegistryKey {
    pub(crate) namespace: String,
    pub(crate) path: String,
}

impl RegistryKey {
    /// Build a key from already separated parts.
    pub fn new(namespace: &str, path: &str) -> Result<Self, RegistryKeyError> {
        validate_namespace(namespace)?;
        validate_path(path)?;
        Ok(Self {
            namespace: namespace.to_string(),
            path: path.to_string(),
        })
    }

    /// Parse `namespace:path`, or a bare `path` in [`DEFAULT_NAMESPACE`].
    pub fn parse(input: &str) -> Result<Self, RegistryKeyError> {
        Self::parse_with_default_namespace(input, DEFAULT_NAMESPACE)
    }

    /// Parse a key using a caller-provided default namespace.
    pub fn parse_with_default_namespace(
        input: &str,
        default_namespace: &str,
    ) -> Result<Self, RegistryKeyError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RegistryKeyError::Empty);
        }
        match input.split_once(':') {
            Some((ns, path)) => Self::new(ns, path),
            None => Self::new(default_namespace, input),
        }
    }

    /// Key namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.path)
    }
}

impl FromStr for RegistryKey {
    type Err = RegistryKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RegistryKey {
    type Error = RegistryKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RegistryKey> for String {
    fn from(key: RegistryKey) -> Self {
        key.to_string()
    }
}

fn validate_namespace(ns: &str) -> Result<(), RegistryKeyError> {
    if ns.is_empty() {
        return Err(RegistryKeyError::EmptyNamespace);
    }
    check_part("namespace", ns, MAX_NAMESPACE_LEN, |c| {
        matches!(c, 'a'..='z' | '0'..='9' | '_' | '-' | '.')
    })
}

fn validate_path(path: &str) -> Result<(), RegistryKeyError> {
    if path.is_empty() {
        return Err(RegistryKeyError::EmptyPath);
    }
    check_part("path", path, MAX_PATH_LEN, |c| {
        matches!(c, 'a'..='z' | '0'..='9' | '_' | '-' | '.' | '/')
    })
}

fn check_part(
    part: &'static str,
    value: &str,
    max: usize,
    allowed: impl Fn(char) -> bool,
) -> Result<(), RegistryKeyError> {
    if value.len() > max {
        return Err(RegistryKeyError::TooLong {
            part,
            len: value.len(),
            max,
        });
    }
    match value.chars().find(|c| !allowed(*c)) {
        Some(found) => Err(RegistryKeyError::InvalidChar { part, found }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_key() {
        let key = RegistryKey::parse("tickwire:set_block").unwrap();
        assert_eq!(key.namespace(), "tickwire");
        assert_eq!(key.path(), "set_block");
        assert_eq!(key.to_string(), "tickwire:set_block");
    }

    #[test]
    fn bare_path_uses_default_namespace() {
        let key: RegistryKey = "stone".parse().unwrap();
        assert_eq!(key.to_string(), "tickwire:stone");

        let key = RegistryKey::parse_with_default_namespace("stone", "world").unwrap();
        assert_eq!(key.to_string(), "world:stone");
    }

    #[test]
    fn rejects_malformed_keys() {
        assert_eq!(RegistryKey::parse("   "), Err(RegistryKeyError::Empty));
        assert_eq!(RegistryKey::parse(":x"), Err(RegistryKeyError::EmptyNamespace));
        assert_eq!(RegistryKey::parse("x:"), Err(RegistryKeyError::EmptyPath));
        assert!(matches!(
            RegistryKey::parse("tickwire:Stone"),
            Err(RegistryKeyError::InvalidChar { part: "path", found: 'S' })
        ));
        assert!(matches!(
            RegistryKey::parse("tick wire:stone"),
            Err(RegistryKeyError::InvalidChar { part: "namespace", .. })
        ));
        let long = "a".repeat(MAX_PATH_LEN + 1);
        assert!(matches!(
            RegistryKey::new("tickwire", &long),
            Err(RegistryKeyError::TooLong { part: "path", .. })
        ));
    }

    #[test]
    fn keys_are_ascii() {
        let key = RegistryKey::parse("a.b-c:d/e_f").unwrap();
        let text = key.to_string();
        assert!(text.is_ascii());
        assert_eq!(text.len(), text.chars().count());
    }

    #[test]
    fn serde_uses_string_form() {
        #[derive(Deserialize, Serialize)]
        struct Holder {
            key: RegistryKey,
        }
        let holder: Holder = toml::from_str("key = \"demo:thing\"").unwrap();
        assert_eq!(holder.key.to_string(), "demo:thing");
        let out = toml::to_string(&holder).unwrap();
        assert!(out.contains("\"demo:thing\""));
        assert!(toml::from_str::<Holder>("key = \"Bad Key\"").is_err());
    }
}
