//! Fuzz-style property tests for the wire decoders.
//!
//! Decoders face untrusted peer bytes: they must return errors, never panic,
//! and never allocate more than the input could describe.

use proptest::prelude::*;
use tickwire_core::RegistryKey;
use tickwire_net::{
    DecodeError, EntityState, MirroredRegistry, RegistrySnapshot, Value, WireBuf,
};

fn key_strategy() -> impl Strategy<Value = RegistryKey> {
    ("[a-z][a-z0-9_]{0,8}", "[a-z][a-z0-9_/.]{0,16}")
        .prop_map(|(ns, path)| RegistryKey::new(&ns, &path).unwrap())
}

proptest! {
    /// Property: arbitrary bytes never panic the tagged value decoder
    #[test]
    fn arbitrary_bytes_dont_crash_tagged_values(
        bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut buf = WireBuf::from(bytes);
        while buf.has_remaining() {
            if Value::read_tagged(&mut buf).is_err() {
                break;
            }
        }
    }

    /// Property: arbitrary bytes never panic the snapshot decoder
    #[test]
    fn arbitrary_bytes_dont_crash_snapshot(
        bytes in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let _ = RegistrySnapshot::decode(&bytes);
    }

    /// Property: a length prefix can never claim more than the buffer holds
    #[test]
    fn oversized_lengths_are_rejected(len in 65u32..u32::MAX >> 1, tail in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut buf = WireBuf::new();
        buf.write_var_u32(len);
        buf.write_raw(&tail);
        let mut read = WireBuf::from(buf.into_vec());
        prop_assert!(read.read_blob().is_err());
    }

    /// Property: var ints survive the wire, and each uses at most five bytes
    #[test]
    fn var_ints_roundtrip(a in any::<u32>(), b in any::<i32>(), c in any::<u64>(), d in any::<i64>()) {
        let mut buf = WireBuf::new();
        buf.write_var_u32(a);
        prop_assert!(buf.len() <= 5);
        buf.write_var_i32(b);
        buf.write_var_u64(c);
        buf.write_var_i64(d);

        let mut read = WireBuf::from(buf.into_vec());
        prop_assert_eq!(read.read_var_u32().unwrap(), a);
        prop_assert_eq!(read.read_var_i32().unwrap(), b);
        prop_assert_eq!(read.read_var_u64().unwrap(), c);
        prop_assert_eq!(read.read_var_i64().unwrap(), d);
        prop_assert!(!read.has_remaining());
    }

    /// Property: strings and names survive the wire
    #[test]
    fn strings_and_names_roundtrip(text in ".{0,64}", key in key_strategy()) {
        let mut buf = WireBuf::new();
        buf.write_str(&text).unwrap();
        buf.write_key(&key).unwrap();

        let mut read = WireBuf::from(buf.into_vec());
        prop_assert_eq!(read.read_str().unwrap(), text);
        prop_assert_eq!(read.read_key().unwrap(), key);
    }

    /// Property: entity states keep their kind and property order
    #[test]
    fn entity_states_roundtrip(
        kind in any::<u32>(),
        properties in prop::collection::vec(("[a-z]{1,8}", "[a-z0-9]{0,8}"), 0..8),
    ) {
        let state = EntityState { kind, properties };
        let mut buf = WireBuf::new();
        buf.write_entity_state(&state).unwrap();
        let mut read = WireBuf::from(buf.into_vec());
        prop_assert_eq!(read.read_entity_state().unwrap(), state);
    }

    /// Property: snapshots decode to the tables they were built from, and the
    /// checksum depends only on the content
    #[test]
    fn snapshots_roundtrip(
        tables in prop::collection::vec(
            (key_strategy(), prop::collection::btree_set(key_strategy(), 0..8)),
            0..4,
        ),
    ) {
        let tables: Vec<MirroredRegistry> = tables
            .into_iter()
            .map(|(name, entries)| MirroredRegistry::dense(name, entries))
            .collect();
        let first = RegistrySnapshot::encode(&tables).unwrap();
        let second = RegistrySnapshot::encode(&tables).unwrap();
        prop_assert_eq!(first.checksum(), second.checksum());
        prop_assert_eq!(RegistrySnapshot::decode(first.bytes()).unwrap(), tables);
    }
}

#[test]
fn truncated_fixed_width_reports_what_was_missing() {
    let mut buf = WireBuf::from(vec![0u8, 1, 2]);
    assert_eq!(
        buf.read_u32(),
        Err(DecodeError::UnexpectedEnd {
            needed: 4,
            remaining: 3
        })
    );
}
