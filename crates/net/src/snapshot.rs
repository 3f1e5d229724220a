//! Registry snapshot packet.
//!
//! For each mirrored registry, in order: its name, a varuint entry count, then
//! `count` pairs of (varuint wire id, name). Clients cache the packet keyed by
//! its CRC-32C checksum.

use crate::buf::WireBuf;
use crate::error::{DecodeError, EncodeError};
use tickwire_core::RegistryKey;

/// One id table as it appears in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredRegistry {
    /// Registry name.
    pub name: RegistryKey,
    /// `(wire id, name)` pairs in id order.
    pub entries: Vec<(u32, RegistryKey)>,
}

impl MirroredRegistry {
    /// Table whose ids are the positions of `names`.
    pub fn dense(name: RegistryKey, names: impl IntoIterator<Item = RegistryKey>) -> Self {
        Self {
            name,
            entries: (0u32..).zip(names).collect(),
        }
    }

    /// Name of the entry with wire id `id`.
    pub fn name_of(&self, id: u32) -> Option<&RegistryKey> {
        self.entries
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, name)| name)
    }

    /// Wire id of `name`.
    pub fn id_of(&self, name: &RegistryKey) -> Option<u32> {
        self.entries
            .iter()
            .find(|(_, entry)| entry == name)
            .map(|(id, _)| *id)
    }
}

/// Encoded snapshot and its checksum, computed once per registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    bytes: Vec<u8>,
    checksum: u64,
}

impl RegistrySnapshot {
    /// Encode the given tables in order.
    pub fn encode(registries: &[MirroredRegistry]) -> Result<Self, EncodeError> {
        let mut buf = WireBuf::new();
        for registry in registries {
            buf.write_key(&registry.name)?;
            buf.write_len(registry.entries.len())?;
            for (id, name) in &registry.entries {
                buf.write_var_u32(*id);
                buf.write_key(name)?;
            }
        }
        let checksum = buf.checksum();
        Ok(Self {
            bytes: buf.into_vec(),
            checksum,
        })
    }

    /// Decode a snapshot packet back into tables.
    pub fn decode(bytes: &[u8]) -> Result<Vec<MirroredRegistry>, DecodeError> {
        let mut buf = WireBuf::from(bytes);
        let mut registries = Vec::new();
        while buf.has_remaining() {
            let name = buf.read_key()?;
            // Each entry is at least a one-byte id and a one-byte name length.
            let entries = buf.read_array(2, |buf| {
                let id = buf.read_var_u32()?;
                Ok((id, buf.read_key()?))
            })?;
            registries.push(MirroredRegistry { name, entries });
        }
        Ok(registries)
    }

    /// Packet bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// CRC-32C of the packet, widened to 64 bits.
    pub fn checksum(&self) -> u64 {
        self.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> RegistryKey {
        RegistryKey::parse(s).unwrap()
    }

    fn tables() -> Vec<MirroredRegistry> {
        vec![
            MirroredRegistry::dense(key("tickwire:commands"), [key("ping"), key("set_block")]),
            MirroredRegistry::dense(key("world:blocks"), [key("world:air"), key("world:stone")]),
            MirroredRegistry::dense(key("world:dimensions"), Vec::new()),
        ]
    }

    #[test]
    fn identical_configuration_gives_identical_checksum() {
        let a = RegistrySnapshot::encode(&tables()).unwrap();
        let b = RegistrySnapshot::encode(&tables()).unwrap();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.bytes(), b.bytes());
    }

    #[test]
    fn order_changes_the_checksum() {
        let mut reordered = tables();
        reordered.swap(0, 1);
        assert_ne!(
            RegistrySnapshot::encode(&tables()).unwrap().checksum(),
            RegistrySnapshot::encode(&reordered).unwrap().checksum()
        );
    }

    #[test]
    fn decodes_back_to_tables() {
        let snapshot = RegistrySnapshot::encode(&tables()).unwrap();
        let decoded = RegistrySnapshot::decode(snapshot.bytes()).unwrap();
        assert_eq!(decoded, tables());
        assert_eq!(decoded[1].id_of(&key("world:stone")), Some(1));
        assert_eq!(decoded[0].name_of(1), Some(&key("set_block")));
    }

    #[test]
    fn truncated_snapshot_is_a_decode_fault() {
        let snapshot = RegistrySnapshot::encode(&tables()).unwrap();
        let cut = &snapshot.bytes()[..snapshot.bytes().len() - 3];
        assert!(RegistrySnapshot::decode(cut).is_err());
    }
}
