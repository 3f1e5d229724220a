//! Wire-level encode and decode faults.

use thiserror::Error;
use tickwire_core::RegistryKey;

/// Malformed or truncated bytes. Always attributed to the peer that sent them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Read past the end of the buffer.
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd {
        /// Bytes the read required.
        needed: usize,
        /// Bytes that were left.
        remaining: usize,
    },
    /// A variable-width integer kept its continuation bit past the width limit.
    #[error("variable-width integer longer than {max_bytes} bytes")]
    VarIntTooLong {
        /// Maximum encoded length for the target width.
        max_bytes: usize,
    },
    /// The final byte of a variable-width integer carried bits past the target width.
    #[error("variable-width integer overflows {bits} bits")]
    VarIntOverflow {
        /// Target width.
        bits: u32,
    },
    /// Boolean byte other than 0 or 1.
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    /// Length field outside the protocol's signed 32-bit range.
    #[error("length {0} exceeds the protocol length range")]
    LengthOutOfRange(u64),
    /// String bytes are not UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    /// Ascii field contained a non-ascii byte.
    #[error("expected ascii text")]
    NotAscii,
    /// Name field did not parse as `namespace:path`.
    #[error("invalid name {input:?}: {reason}")]
    InvalidName {
        /// Text as received.
        input: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Primitive tag byte is not assigned.
    #[error("unknown primitive tag {0}")]
    UnknownPrimitive(u8),
    /// Type is registered but has no wire constructor.
    #[error("{0} cannot be decoded from the wire")]
    NotConstructible(RegistryKey),
    /// Value decoded but is not acceptable where it appeared.
    #[error("invalid value: {0}")]
    Invalid(String),
}

impl DecodeError {
    /// Build an [`DecodeError::Invalid`] from any displayable description.
    pub fn invalid(what: impl Into<String>) -> Self {
        Self::Invalid(what.into())
    }
}

/// A value that cannot be represented on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// String, blob or array longer than its length field allows.
    #[error("length {len} exceeds the maximum of {max}")]
    TooLong {
        /// Observed length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },
    /// Ascii field contained a non-ascii character.
    #[error("text {0:?} is not ascii")]
    NotAscii(String),
}
