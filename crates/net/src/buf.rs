//! Growable byte buffer with typed read/write primitives.
//!
//! Writes always append at the end. Reads advance an independent cursor and
//! never panic: running out of bytes is reported as [`DecodeError`].
//! Fixed-width numbers are big-endian.

use crate::error::{DecodeError, EncodeError};
use crate::primitive::EntityState;
use crate::varint;
use glam::{Affine2, Affine3A, DAffine2, DAffine3, DVec2, DVec3, IVec2, IVec3, Vec2, Vec3};
use tickwire_core::RegistryKey;
use uuid::Uuid;

/// Largest length a string, blob or array may declare.
pub const MAX_LENGTH: usize = i32::MAX as usize;

/// Largest number of properties an [`EntityState`] can carry.
pub const MAX_STATE_PROPERTIES: usize = u8::MAX as usize;

/// Byte buffer with a write end and an independent read cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireBuf {
    data: Vec<u8>,
    read_pos: usize,
}

macro_rules! fixed_width {
    ($($write:ident, $read:ident, $ty:ty;)*) => {
        $(
            #[doc = concat!("Append a big-endian `", stringify!($ty), "`.")]
            pub fn $write(&mut self, value: $ty) {
                self.data.extend_from_slice(&value.to_be_bytes());
            }

            #[doc = concat!("Read a big-endian `", stringify!($ty), "`.")]
            pub fn $read(&mut self) -> Result<$ty, DecodeError> {
                let bytes = self.take(std::mem::size_of::<$ty>())?;
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_be_bytes(raw))
            }
        )*
    };
}

impl WireBuf {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// All written bytes, including those already read.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Bytes not yet consumed by reads.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    /// Consume the buffer, returning every written byte.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Total written length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// True while unread bytes remain.
    pub fn has_remaining(&self) -> bool {
        self.read_pos < self.data.len()
    }

    /// CRC-32C of the unread bytes. Does not move the read cursor.
    pub fn checksum(&self) -> u64 {
        u64::from(crc32c::crc32c(self.unread()))
    }

    /// Append raw bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Read exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        self.take(len).map(<[u8]>::to_vec)
    }

    fn take(&mut self, len: usize) -> Result<&[u8], DecodeError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(DecodeError::UnexpectedEnd {
                needed: len,
                remaining,
            });
        }
        let start = self.read_pos;
        self.read_pos += len;
        Ok(&self.data[start..self.read_pos])
    }

    fixed_width! {
        write_i8, read_i8, i8;
        write_u8, read_u8, u8;
        write_i16, read_i16, i16;
        write_u16, read_u16, u16;
        write_i32, read_i32, i32;
        write_u32, read_u32, u32;
        write_i64, read_i64, i64;
        write_u64, read_u64, u64;
        write_f32, read_f32, f32;
        write_f64, read_f64, f64;
    }

    /// Append a variable-width unsigned 32-bit integer.
    pub fn write_var_u32(&mut self, value: u32) {
        varint::encode_u32(value, &mut self.data);
    }

    /// Read a variable-width unsigned 32-bit integer (at most 5 bytes).
    pub fn read_var_u32(&mut self) -> Result<u32, DecodeError> {
        let (value, used) = varint::decode_u32(self.unread())?;
        self.read_pos += used;
        Ok(value)
    }

    /// Append a variable-width unsigned 64-bit integer.
    pub fn write_var_u64(&mut self, value: u64) {
        varint::encode_u64(value, &mut self.data);
    }

    /// Read a variable-width unsigned 64-bit integer (at most 10 bytes).
    pub fn read_var_u64(&mut self) -> Result<u64, DecodeError> {
        let (value, used) = varint::decode_u64(self.unread())?;
        self.read_pos += used;
        Ok(value)
    }

    /// Append a zig-zag variable-width signed 32-bit integer.
    pub fn write_var_i32(&mut self, value: i32) {
        self.write_var_u32(varint::zigzag_32(value));
    }

    /// Read a zig-zag variable-width signed 32-bit integer.
    pub fn read_var_i32(&mut self) -> Result<i32, DecodeError> {
        self.read_var_u32().map(varint::unzigzag_32)
    }

    /// Append a zig-zag variable-width signed 64-bit integer.
    pub fn write_var_i64(&mut self, value: i64) {
        self.write_var_u64(varint::zigzag_64(value));
    }

    /// Read a zig-zag variable-width signed 64-bit integer.
    pub fn read_var_i64(&mut self) -> Result<i64, DecodeError> {
        self.read_var_u64().map(varint::unzigzag_64)
    }

    /// Append a boolean as `0x00` / `0x01`.
    pub fn write_bool(&mut self, value: bool) {
        self.data.push(u8::from(value));
    }

    /// Read a boolean; any byte other than 0 or 1 is rejected.
    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }

    /// Append a length prefix for a string, blob or array.
    pub fn write_len(&mut self, len: usize) -> Result<(), EncodeError> {
        if len > MAX_LENGTH {
            return Err(EncodeError::TooLong {
                len,
                max: MAX_LENGTH,
            });
        }
        self.write_var_u32(len as u32);
        Ok(())
    }

    /// Read a length prefix.
    ///
    /// `min_element_size` bounds the declared length by the unread bytes, so
    /// a hostile length cannot force a large allocation.
    pub fn read_len(&mut self, min_element_size: usize) -> Result<usize, DecodeError> {
        let len = self.read_var_u32()?;
        if len as usize > MAX_LENGTH {
            return Err(DecodeError::LengthOutOfRange(u64::from(len)));
        }
        let len = len as usize;
        let needed = len.saturating_mul(min_element_size);
        if needed > self.remaining() {
            return Err(DecodeError::UnexpectedEnd {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(len)
    }

    /// Append a length-prefixed opaque blob.
    pub fn write_blob(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        self.write_len(bytes.len())?;
        self.write_raw(bytes);
        Ok(())
    }

    /// Read a length-prefixed opaque blob.
    pub fn read_blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_len(1)?;
        self.read_raw(len)
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) -> Result<(), EncodeError> {
        self.write_blob(value.as_bytes())
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_blob()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Append a string whose byte length must equal its character length.
    pub fn write_ascii(&mut self, value: &str) -> Result<(), EncodeError> {
        if !value.is_ascii() {
            return Err(EncodeError::NotAscii(value.to_string()));
        }
        self.write_str(value)
    }

    /// Read an ascii-only string.
    pub fn read_ascii(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_blob()?;
        if !bytes.is_ascii() {
            return Err(DecodeError::NotAscii);
        }
        String::from_utf8(bytes).map_err(|_| DecodeError::NotAscii)
    }

    /// Append a name as the ascii text `namespace:path`.
    pub fn write_key(&mut self, key: &RegistryKey) -> Result<(), EncodeError> {
        self.write_ascii(&key.to_string())
    }

    /// Read a name written by [`WireBuf::write_key`].
    pub fn read_key(&mut self) -> Result<RegistryKey, DecodeError> {
        let text = self.read_ascii()?;
        RegistryKey::parse(&text).map_err(|err| DecodeError::InvalidName {
            input: text,
            reason: err.to_string(),
        })
    }

    /// Append a UUID as two big-endian 64-bit halves, most significant first.
    pub fn write_uuid(&mut self, value: Uuid) {
        let (msb, lsb) = value.as_u64_pair();
        self.write_u64(msb);
        self.write_u64(lsb);
    }

    /// Read a UUID.
    pub fn read_uuid(&mut self) -> Result<Uuid, DecodeError> {
        let msb = self.read_u64()?;
        let lsb = self.read_u64()?;
        Ok(Uuid::from_u64_pair(msb, lsb))
    }

    /// Append a length-prefixed array, writing each element with `write`.
    pub fn write_array<T>(
        &mut self,
        items: &[T],
        mut write: impl FnMut(&mut Self, &T),
    ) -> Result<(), EncodeError> {
        self.write_len(items.len())?;
        for item in items {
            write(self, item);
        }
        Ok(())
    }

    /// Read a length-prefixed array whose elements take at least
    /// `min_element_size` bytes each.
    pub fn read_array<T>(
        &mut self,
        min_element_size: usize,
        mut read: impl FnMut(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Vec<T>, DecodeError> {
        let len = self.read_len(min_element_size)?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(read(self)?);
        }
        Ok(items)
    }

    /// Append an integer 2D vector.
    pub fn write_ivec2(&mut self, v: IVec2) {
        self.write_i32(v.x);
        self.write_i32(v.y);
    }

    /// Read an integer 2D vector.
    pub fn read_ivec2(&mut self) -> Result<IVec2, DecodeError> {
        Ok(IVec2::new(self.read_i32()?, self.read_i32()?))
    }

    /// Append a single-precision 2D vector.
    pub fn write_vec2(&mut self, v: Vec2) {
        self.write_f32(v.x);
        self.write_f32(v.y);
    }

    /// Read a single-precision 2D vector.
    pub fn read_vec2(&mut self) -> Result<Vec2, DecodeError> {
        Ok(Vec2::new(self.read_f32()?, self.read_f32()?))
    }

    /// Append a double-precision 2D vector.
    pub fn write_dvec2(&mut self, v: DVec2) {
        self.write_f64(v.x);
        self.write_f64(v.y);
    }

    /// Read a double-precision 2D vector.
    pub fn read_dvec2(&mut self) -> Result<DVec2, DecodeError> {
        Ok(DVec2::new(self.read_f64()?, self.read_f64()?))
    }

    /// Append an integer 3D vector.
    pub fn write_ivec3(&mut self, v: IVec3) {
        self.write_i32(v.x);
        self.write_i32(v.y);
        self.write_i32(v.z);
    }

    /// Read an integer 3D vector.
    pub fn read_ivec3(&mut self) -> Result<IVec3, DecodeError> {
        Ok(IVec3::new(self.read_i32()?, self.read_i32()?, self.read_i32()?))
    }

    /// Append a single-precision 3D vector.
    pub fn write_vec3(&mut self, v: Vec3) {
        self.write_f32(v.x);
        self.write_f32(v.y);
        self.write_f32(v.z);
    }

    /// Read a single-precision 3D vector.
    pub fn read_vec3(&mut self) -> Result<Vec3, DecodeError> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    /// Append a double-precision 3D vector.
    pub fn write_dvec3(&mut self, v: DVec3) {
        self.write_f64(v.x);
        self.write_f64(v.y);
        self.write_f64(v.z);
    }

    /// Read a double-precision 3D vector.
    pub fn read_dvec3(&mut self) -> Result<DVec3, DecodeError> {
        Ok(DVec3::new(self.read_f64()?, self.read_f64()?, self.read_f64()?))
    }

    /// Append a 2D affine transform as six column-major floats.
    pub fn write_affine2(&mut self, t: Affine2) {
        t.to_cols_array().iter().for_each(|v| self.write_f32(*v));
    }

    /// Read a 2D affine transform.
    pub fn read_affine2(&mut self) -> Result<Affine2, DecodeError> {
        let mut cols = [0f32; 6];
        for v in &mut cols {
            *v = self.read_f32()?;
        }
        Ok(Affine2::from_cols_array(&cols))
    }

    /// Append a double-precision 2D affine transform.
    pub fn write_daffine2(&mut self, t: DAffine2) {
        t.to_cols_array().iter().for_each(|v| self.write_f64(*v));
    }

    /// Read a double-precision 2D affine transform.
    pub fn read_daffine2(&mut self) -> Result<DAffine2, DecodeError> {
        let mut cols = [0f64; 6];
        for v in &mut cols {
            *v = self.read_f64()?;
        }
        Ok(DAffine2::from_cols_array(&cols))
    }

    /// Append a 3D affine transform as twelve column-major floats.
    pub fn write_affine3(&mut self, t: Affine3A) {
        t.to_cols_array().iter().for_each(|v| self.write_f32(*v));
    }

    /// Read a 3D affine transform.
    pub fn read_affine3(&mut self) -> Result<Affine3A, DecodeError> {
        let mut cols = [0f32; 12];
        for v in &mut cols {
            *v = self.read_f32()?;
        }
        Ok(Affine3A::from_cols_array(&cols))
    }

    /// Append a double-precision 3D affine transform.
    pub fn write_daffine3(&mut self, t: DAffine3) {
        t.to_cols_array().iter().for_each(|v| self.write_f64(*v));
    }

    /// Read a double-precision 3D affine transform.
    pub fn read_daffine3(&mut self) -> Result<DAffine3, DecodeError> {
        let mut cols = [0f64; 12];
        for v in &mut cols {
            *v = self.read_f64()?;
        }
        Ok(DAffine3::from_cols_array(&cols))
    }

    /// Append an entity (or entity kind) state: kind id, property count, pairs.
    pub fn write_entity_state(&mut self, state: &EntityState) -> Result<(), EncodeError> {
        if state.properties.len() > MAX_STATE_PROPERTIES {
            return Err(EncodeError::TooLong {
                len: state.properties.len(),
                max: MAX_STATE_PROPERTIES,
            });
        }
        self.write_var_u32(state.kind);
        self.write_u8(state.properties.len() as u8);
        for (name, value) in &state.properties {
            self.write_str(name)?;
            self.write_str(value)?;
        }
        Ok(())
    }

    /// Read an entity (or entity kind) state.
    pub fn read_entity_state(&mut self) -> Result<EntityState, DecodeError> {
        let kind = self.read_var_u32()?;
        let count = self.read_u8()?;
        let mut properties = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let name = self.read_str()?;
            let value = self.read_str()?;
            properties.push((name, value));
        }
        Ok(EntityState { kind, properties })
    }
}

impl From<Vec<u8>> for WireBuf {
    fn from(data: Vec<u8>) -> Self {
        Self { data, read_pos: 0 }
    }
}

impl From<&[u8]> for WireBuf {
    fn from(data: &[u8]) -> Self {
        Self::from(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_is_big_endian() {
        let mut buf = WireBuf::new();
        buf.write_u32(0x0102_0304);
        buf.write_i16(-2);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4, 0xFF, 0xFE]);
        assert_eq!(buf.read_u32(), Ok(0x0102_0304));
        assert_eq!(buf.read_i16(), Ok(-2));
        assert!(!buf.has_remaining());
    }

    #[test]
    fn reading_past_end_is_a_fault() {
        let mut buf = WireBuf::from(vec![0u8; 3]);
        assert_eq!(
            buf.read_u64(),
            Err(DecodeError::UnexpectedEnd {
                needed: 8,
                remaining: 3
            })
        );
        // A failed read leaves the cursor untouched.
        assert_eq!(buf.remaining(), 3);
    }

    #[test]
    fn bool_is_strict() {
        let mut buf = WireBuf::from(vec![0, 1, 2]);
        assert_eq!(buf.read_bool(), Ok(false));
        assert_eq!(buf.read_bool(), Ok(true));
        assert_eq!(buf.read_bool(), Err(DecodeError::InvalidBool(2)));
    }

    #[test]
    fn empty_string_and_blob() {
        let mut buf = WireBuf::new();
        buf.write_str("").unwrap();
        buf.write_blob(&[]).unwrap();
        assert_eq!(buf.as_slice(), &[0, 0]);
        assert_eq!(buf.read_str().unwrap(), "");
        assert_eq!(buf.read_blob().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn strings_are_length_prefixed_utf8() {
        let mut buf = WireBuf::new();
        buf.write_str("héllo").unwrap();
        assert_eq!(buf.as_slice()[0], 6);
        assert_eq!(buf.read_str().unwrap(), "héllo");

        let mut bad = WireBuf::from(vec![2, 0xC3, 0x28]);
        assert_eq!(bad.read_str(), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn ascii_is_verified_both_ways() {
        let mut buf = WireBuf::new();
        assert_eq!(
            buf.write_ascii("naïve"),
            Err(EncodeError::NotAscii("naïve".into()))
        );
        assert!(buf.is_empty());

        buf.write_str("naïve").unwrap();
        assert_eq!(buf.read_ascii(), Err(DecodeError::NotAscii));
    }

    #[test]
    fn oversized_length_is_an_encode_fault() {
        let mut buf = WireBuf::new();
        assert_eq!(
            buf.write_len(MAX_LENGTH + 1),
            Err(EncodeError::TooLong {
                len: MAX_LENGTH + 1,
                max: MAX_LENGTH
            })
        );
    }

    #[test]
    fn hostile_lengths_do_not_allocate() {
        // Declares ~2^31 elements with four bytes of payload behind it.
        let mut buf = WireBuf::new();
        buf.write_var_u32(i32::MAX as u32);
        buf.write_u32(0);
        assert!(matches!(
            buf.read_array(4, WireBuf::read_i32),
            Err(DecodeError::UnexpectedEnd { .. })
        ));

        let mut buf = WireBuf::new();
        buf.write_var_u32(u32::MAX);
        assert_eq!(
            buf.read_blob(),
            Err(DecodeError::LengthOutOfRange(u64::from(u32::MAX)))
        );
    }

    #[test]
    fn keys_travel_as_ascii_text() {
        let key = RegistryKey::parse("tickwire:set_block").unwrap();
        let mut buf = WireBuf::new();
        buf.write_key(&key).unwrap();
        assert_eq!(&buf.as_slice()[1..], b"tickwire:set_block");
        assert_eq!(buf.read_key().unwrap(), key);

        let mut bad = WireBuf::new();
        bad.write_ascii("Not A Key").unwrap();
        assert!(matches!(bad.read_key(), Err(DecodeError::InvalidName { .. })));
    }

    #[test]
    fn uuid_is_two_halves() {
        let id = Uuid::from_u64_pair(1, 2);
        let mut buf = WireBuf::new();
        buf.write_uuid(id);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf.as_slice()[..8], &1u64.to_be_bytes());
        assert_eq!(buf.read_uuid(), Ok(id));
    }

    #[test]
    fn transforms_round_trip() {
        let t2 = DAffine2::from_angle_translation(0.5, DVec2::new(3.0, -4.0));
        let t3 = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let mut buf = WireBuf::new();
        buf.write_daffine2(t2);
        buf.write_affine3(t3);
        assert_eq!(buf.len(), 6 * 8 + 12 * 4);
        assert_eq!(buf.read_daffine2(), Ok(t2));
        assert_eq!(buf.read_affine3(), Ok(t3));
    }

    #[test]
    fn entity_state_layout() {
        let state = EntityState {
            kind: 300,
            properties: vec![("facing".into(), "north".into())],
        };
        let mut buf = WireBuf::new();
        buf.write_entity_state(&state).unwrap();
        assert_eq!(&buf.as_slice()[..3], &[0xAC, 0x02, 1]);
        assert_eq!(buf.read_entity_state().unwrap(), state);

        let crowded = EntityState {
            kind: 0,
            properties: vec![(String::new(), String::new()); 256],
        };
        assert!(WireBuf::new().write_entity_state(&crowded).is_err());
    }

    #[test]
    fn checksum_ignores_consumed_bytes_and_keeps_cursor() {
        let mut a = WireBuf::from(vec![9, 1, 2, 3]);
        let b = WireBuf::from(vec![1, 2, 3]);
        a.read_u8().unwrap();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.remaining(), 3);
        // Standard CRC-32C check value.
        assert_eq!(WireBuf::from(b"123456789".to_vec()).checksum(), 0xE306_9283);
    }
}
