//! Protocol constants.

/// QUIC application protocol identifier.
pub const ALPN: &[u8] = b"tickwire/1";

/// Default control port.
pub const DEFAULT_PORT: u16 = 6767;

/// Default cap on a single transport frame (8 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Length of the establish checksum frame.
pub const CHECKSUM_FRAME_LEN: usize = 8;
