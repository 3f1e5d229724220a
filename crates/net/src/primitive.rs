//! Self-describing values for dynamic regions of the protocol.
//!
//! In a dynamic region each value is preceded by a one-byte [`Primitive`]
//! tag. Tag numbers are part of the wire contract and never change.

use crate::buf::WireBuf;
use crate::error::{DecodeError, EncodeError};
use glam::{Affine2, Affine3A, DAffine2, DAffine3, DVec2, DVec3, IVec2, IVec3, Vec2, Vec3};
use tickwire_core::RegistryKey;
use uuid::Uuid;

/// Opaque simulation state carried by the host's own codec.
///
/// `kind` is the wire id of the entity kind in the host's mirrored table and
/// `properties` are `(name, value)` pairs the host interprets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityState {
    /// Wire id of the kind in its host registry.
    pub kind: u32,
    /// Property name/value pairs, at most 255.
    pub properties: Vec<(String, String)>,
}

impl EntityState {
    /// State of `kind` with no properties.
    pub fn of_kind(kind: u32) -> Self {
        Self {
            kind,
            properties: Vec::new(),
        }
    }

    /// Value of the named property, if present.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

macro_rules! primitives {
    ($($name:ident = $tag:literal,)*) => {
        /// Wire tag for every supported primitive kind.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        #[allow(missing_docs)]
        pub enum Primitive {
            $($name = $tag,)*
        }

        impl Primitive {
            /// Every tag in ascending order.
            pub const ALL: &'static [Primitive] = &[$(Primitive::$name,)*];

            /// Tag byte on the wire.
            pub fn tag(self) -> u8 {
                self as u8
            }
        }

        impl TryFrom<u8> for Primitive {
            type Error = DecodeError;

            fn try_from(tag: u8) -> Result<Self, Self::Error> {
                match tag {
                    $($tag => Ok(Primitive::$name),)*
                    other => Err(DecodeError::UnknownPrimitive(other)),
                }
            }
        }
    };
}

// 0 and 45 are reserved.
primitives! {
    I8 = 1,
    I16 = 2,
    I32 = 3,
    I64 = 4,
    VarI32 = 5,
    VarI64 = 6,
    U8 = 7,
    U16 = 8,
    U32 = 9,
    U64 = 10,
    VarU32 = 11,
    VarU64 = 12,
    F32 = 13,
    F64 = 14,
    Bool = 15,
    I8Array = 16,
    I16Array = 17,
    I32Array = 18,
    I64Array = 19,
    VarI32Array = 20,
    VarI64Array = 21,
    U8Array = 22,
    U16Array = 23,
    U32Array = 24,
    U64Array = 25,
    VarU32Array = 26,
    VarU64Array = 27,
    F32Array = 28,
    F64Array = 29,
    BoolArray = 30,
    IVec2 = 31,
    Vec2 = 32,
    DVec2 = 33,
    IVec3 = 34,
    Vec3 = 35,
    DVec3 = 36,
    Affine2 = 37,
    DAffine2 = 38,
    Affine3 = 39,
    DAffine3 = 40,
    Blob = 41,
    Str = 42,
    Name = 43,
    Uuid = 44,
    EntityState = 46,
    EntityKindState = 47,
}

/// A tagged value.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum Value {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    VarI32(i32),
    VarI64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    VarU32(u32),
    VarU64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    I8Array(Vec<i8>),
    I16Array(Vec<i16>),
    I32Array(Vec<i32>),
    I64Array(Vec<i64>),
    VarI32Array(Vec<i32>),
    VarI64Array(Vec<i64>),
    U8Array(Vec<u8>),
    U16Array(Vec<u16>),
    U32Array(Vec<u32>),
    U64Array(Vec<u64>),
    VarU32Array(Vec<u32>),
    VarU64Array(Vec<u64>),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
    BoolArray(Vec<bool>),
    IVec2(IVec2),
    Vec2(Vec2),
    DVec2(DVec2),
    IVec3(IVec3),
    Vec3(Vec3),
    DVec3(DVec3),
    Affine2(Affine2),
    DAffine2(DAffine2),
    Affine3(Affine3A),
    DAffine3(DAffine3),
    Blob(Vec<u8>),
    Str(String),
    Name(RegistryKey),
    Uuid(Uuid),
    EntityState(EntityState),
    EntityKindState(EntityState),
}

impl Value {
    /// Tag identifying this value's kind.
    pub fn primitive(&self) -> Primitive {
        match self {
            Value::I8(_) => Primitive::I8,
            Value::I16(_) => Primitive::I16,
            Value::I32(_) => Primitive::I32,
            Value::I64(_) => Primitive::I64,
            Value::VarI32(_) => Primitive::VarI32,
            Value::VarI64(_) => Primitive::VarI64,
            Value::U8(_) => Primitive::U8,
            Value::U16(_) => Primitive::U16,
            Value::U32(_) => Primitive::U32,
            Value::U64(_) => Primitive::U64,
            Value::VarU32(_) => Primitive::VarU32,
            Value::VarU64(_) => Primitive::VarU64,
            Value::F32(_) => Primitive::F32,
            Value::F64(_) => Primitive::F64,
            Value::Bool(_) => Primitive::Bool,
            Value::I8Array(_) => Primitive::I8Array,
            Value::I16Array(_) => Primitive::I16Array,
            Value::I32Array(_) => Primitive::I32Array,
            Value::I64Array(_) => Primitive::I64Array,
            Value::VarI32Array(_) => Primitive::VarI32Array,
            Value::VarI64Array(_) => Primitive::VarI64Array,
            Value::U8Array(_) => Primitive::U8Array,
            Value::U16Array(_) => Primitive::U16Array,
            Value::U32Array(_) => Primitive::U32Array,
            Value::U64Array(_) => Primitive::U64Array,
            Value::VarU32Array(_) => Primitive::VarU32Array,
            Value::VarU64Array(_) => Primitive::VarU64Array,
            Value::F32Array(_) => Primitive::F32Array,
            Value::F64Array(_) => Primitive::F64Array,
            Value::BoolArray(_) => Primitive::BoolArray,
            Value::IVec2(_) => Primitive::IVec2,
            Value::Vec2(_) => Primitive::Vec2,
            Value::DVec2(_) => Primitive::DVec2,
            Value::IVec3(_) => Primitive::IVec3,
            Value::Vec3(_) => Primitive::Vec3,
            Value::DVec3(_) => Primitive::DVec3,
            Value::Affine2(_) => Primitive::Affine2,
            Value::DAffine2(_) => Primitive::DAffine2,
            Value::Affine3(_) => Primitive::Affine3,
            Value::DAffine3(_) => Primitive::DAffine3,
            Value::Blob(_) => Primitive::Blob,
            Value::Str(_) => Primitive::Str,
            Value::Name(_) => Primitive::Name,
            Value::Uuid(_) => Primitive::Uuid,
            Value::EntityState(_) => Primitive::EntityState,
            Value::EntityKindState(_) => Primitive::EntityKindState,
        }
    }

    /// Write the value body without a tag.
    pub fn write(&self, buf: &mut WireBuf) -> Result<(), EncodeError> {
        match self {
            Value::I8(v) => buf.write_i8(*v),
            Value::I16(v) => buf.write_i16(*v),
            Value::I32(v) => buf.write_i32(*v),
            Value::I64(v) => buf.write_i64(*v),
            Value::VarI32(v) => buf.write_var_i32(*v),
            Value::VarI64(v) => buf.write_var_i64(*v),
            Value::U8(v) => buf.write_u8(*v),
            Value::U16(v) => buf.write_u16(*v),
            Value::U32(v) => buf.write_u32(*v),
            Value::U64(v) => buf.write_u64(*v),
            Value::VarU32(v) => buf.write_var_u32(*v),
            Value::VarU64(v) => buf.write_var_u64(*v),
            Value::F32(v) => buf.write_f32(*v),
            Value::F64(v) => buf.write_f64(*v),
            Value::Bool(v) => buf.write_bool(*v),
            Value::I8Array(v) => buf.write_array(v, |b, x| b.write_i8(*x))?,
            Value::I16Array(v) => buf.write_array(v, |b, x| b.write_i16(*x))?,
            Value::I32Array(v) => buf.write_array(v, |b, x| b.write_i32(*x))?,
            Value::I64Array(v) => buf.write_array(v, |b, x| b.write_i64(*x))?,
            Value::VarI32Array(v) => buf.write_array(v, |b, x| b.write_var_i32(*x))?,
            Value::VarI64Array(v) => buf.write_array(v, |b, x| b.write_var_i64(*x))?,
            Value::U8Array(v) => buf.write_array(v, |b, x| b.write_u8(*x))?,
            Value::U16Array(v) => buf.write_array(v, |b, x| b.write_u16(*x))?,
            Value::U32Array(v) => buf.write_array(v, |b, x| b.write_u32(*x))?,
            Value::U64Array(v) => buf.write_array(v, |b, x| b.write_u64(*x))?,
            Value::VarU32Array(v) => buf.write_array(v, |b, x| b.write_var_u32(*x))?,
            Value::VarU64Array(v) => buf.write_array(v, |b, x| b.write_var_u64(*x))?,
            Value::F32Array(v) => buf.write_array(v, |b, x| b.write_f32(*x))?,
            Value::F64Array(v) => buf.write_array(v, |b, x| b.write_f64(*x))?,
            Value::BoolArray(v) => buf.write_array(v, |b, x| b.write_bool(*x))?,
            Value::IVec2(v) => buf.write_ivec2(*v),
            Value::Vec2(v) => buf.write_vec2(*v),
            Value::DVec2(v) => buf.write_dvec2(*v),
            Value::IVec3(v) => buf.write_ivec3(*v),
            Value::Vec3(v) => buf.write_vec3(*v),
            Value::DVec3(v) => buf.write_dvec3(*v),
            Value::Affine2(v) => buf.write_affine2(*v),
            Value::DAffine2(v) => buf.write_daffine2(*v),
            Value::Affine3(v) => buf.write_affine3(*v),
            Value::DAffine3(v) => buf.write_daffine3(*v),
            Value::Blob(v) => buf.write_blob(v)?,
            Value::Str(v) => buf.write_str(v)?,
            Value::Name(v) => buf.write_key(v)?,
            Value::Uuid(v) => buf.write_uuid(*v),
            Value::EntityState(v) | Value::EntityKindState(v) => buf.write_entity_state(v)?,
        }
        Ok(())
    }

    /// Read a value body of the given kind.
    pub fn read(primitive: Primitive, buf: &mut WireBuf) -> Result<Self, DecodeError> {
        Ok(match primitive {
            Primitive::I8 => Value::I8(buf.read_i8()?),
            Primitive::I16 => Value::I16(buf.read_i16()?),
            Primitive::I32 => Value::I32(buf.read_i32()?),
            Primitive::I64 => Value::I64(buf.read_i64()?),
            Primitive::VarI32 => Value::VarI32(buf.read_var_i32()?),
            Primitive::VarI64 => Value::VarI64(buf.read_var_i64()?),
            Primitive::U8 => Value::U8(buf.read_u8()?),
            Primitive::U16 => Value::U16(buf.read_u16()?),
            Primitive::U32 => Value::U32(buf.read_u32()?),
            Primitive::U64 => Value::U64(buf.read_u64()?),
            Primitive::VarU32 => Value::VarU32(buf.read_var_u32()?),
            Primitive::VarU64 => Value::VarU64(buf.read_var_u64()?),
            Primitive::F32 => Value::F32(buf.read_f32()?),
            Primitive::F64 => Value::F64(buf.read_f64()?),
            Primitive::Bool => Value::Bool(buf.read_bool()?),
            Primitive::I8Array => Value::I8Array(buf.read_array(1, WireBuf::read_i8)?),
            Primitive::I16Array => Value::I16Array(buf.read_array(2, WireBuf::read_i16)?),
            Primitive::I32Array => Value::I32Array(buf.read_array(4, WireBuf::read_i32)?),
            Primitive::I64Array => Value::I64Array(buf.read_array(8, WireBuf::read_i64)?),
            Primitive::VarI32Array => Value::VarI32Array(buf.read_array(1, WireBuf::read_var_i32)?),
            Primitive::VarI64Array => Value::VarI64Array(buf.read_array(1, WireBuf::read_var_i64)?),
            Primitive::U8Array => Value::U8Array(buf.read_array(1, WireBuf::read_u8)?),
            Primitive::U16Array => Value::U16Array(buf.read_array(2, WireBuf::read_u16)?),
            Primitive::U32Array => Value::U32Array(buf.read_array(4, WireBuf::read_u32)?),
            Primitive::U64Array => Value::U64Array(buf.read_array(8, WireBuf::read_u64)?),
            Primitive::VarU32Array => Value::VarU32Array(buf.read_array(1, WireBuf::read_var_u32)?),
            Primitive::VarU64Array => Value::VarU64Array(buf.read_array(1, WireBuf::read_var_u64)?),
            Primitive::F32Array => Value::F32Array(buf.read_array(4, WireBuf::read_f32)?),
            Primitive::F64Array => Value::F64Array(buf.read_array(8, WireBuf::read_f64)?),
            Primitive::BoolArray => Value::BoolArray(buf.read_array(1, WireBuf::read_bool)?),
            Primitive::IVec2 => Value::IVec2(buf.read_ivec2()?),
            Primitive::Vec2 => Value::Vec2(buf.read_vec2()?),
            Primitive::DVec2 => Value::DVec2(buf.read_dvec2()?),
            Primitive::IVec3 => Value::IVec3(buf.read_ivec3()?),
            Primitive::Vec3 => Value::Vec3(buf.read_vec3()?),
            Primitive::DVec3 => Value::DVec3(buf.read_dvec3()?),
            Primitive::Affine2 => Value::Affine2(buf.read_affine2()?),
            Primitive::DAffine2 => Value::DAffine2(buf.read_daffine2()?),
            Primitive::Affine3 => Value::Affine3(buf.read_affine3()?),
            Primitive::DAffine3 => Value::DAffine3(buf.read_daffine3()?),
            Primitive::Blob => Value::Blob(buf.read_blob()?),
            Primitive::Str => Value::Str(buf.read_str()?),
            Primitive::Name => Value::Name(buf.read_key()?),
            Primitive::Uuid => Value::Uuid(buf.read_uuid()?),
            Primitive::EntityState => Value::EntityState(buf.read_entity_state()?),
            Primitive::EntityKindState => Value::EntityKindState(buf.read_entity_state()?),
        })
    }

    /// Write the tag byte followed by the value body.
    pub fn write_tagged(&self, buf: &mut WireBuf) -> Result<(), EncodeError> {
        buf.write_u8(self.primitive().tag());
        self.write(buf)
    }

    /// Read a tag byte and the value it announces.
    pub fn read_tagged(buf: &mut WireBuf) -> Result<Self, DecodeError> {
        let primitive = Primitive::try_from(buf.read_u8()?)?;
        Self::read(primitive, buf)
    }
}
