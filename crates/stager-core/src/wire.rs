//! Data-plane wire format for the tcp transport backend.
//!
//! Every payload pushed to a remote stagerd's data port is preceded by a
//! `FrameHeader`. The receiver can verify and place a frame before touching
//! any connection state. All types are #[repr(C, packed)] for deterministic
//! layout and use zerocopy derives for allocation-free serialization.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Frame operations.
pub mod op {
    /// Payload is the UTF-8 target path; opens (creates) the file.
    pub const OPEN: u8 = 0x01;
    /// Payload is file data to be written at `offset`.
    pub const DATA: u8 = 0x02;
    /// No payload; flushes and releases the open file.
    pub const CLOSE: u8 = 0x03;
}

/// Per-frame acknowledgement byte sent back by the receiver.
pub mod ack {
    pub const OK: u8 = 0x00;
    pub const IO_ERROR: u8 = 0x01;
    pub const BAD_HASH: u8 = 0x02;
    pub const BAD_FRAME: u8 = 0x03;
}

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Maximum frame payload in bytes. Chunks larger than this are streamed as
/// multiple DATA frames by the sender.
pub const MAX_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;

/// Precedes every payload on a data-port connection.
///
/// Wire size: 48 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// BLAKE3 hash of the payload bytes. Verified by the receiver before the
    /// frame is acted on; a mismatch is acked with `ack::BAD_HASH` and the
    /// sender retries.
    pub payload_hash: [u8; 32],

    /// Byte offset in the target file for DATA frames. Writes are
    /// offset-addressed and therefore idempotent — a retransmitted frame
    /// lands on the same bytes.
    pub offset: u64,

    /// Payload length in bytes, not including this header.
    pub length: u32,

    /// One of the `op` constants.
    pub op: u8,

    /// Frame format version. Unknown versions are acked with BAD_FRAME.
    pub version: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],
}

assert_eq_size!(FrameHeader, [u8; 48]);

impl FrameHeader {
    pub fn new(op: u8, offset: u64, payload: &[u8]) -> Self {
        Self {
            payload_hash: *blake3::hash(payload).as_bytes(),
            offset,
            length: payload.len() as u32,
            op,
            version: FRAME_VERSION,
            reserved: [0; 2],
        }
    }

    /// Validate version, op, and length bounds. Hash verification is the
    /// receiver's job once the payload has been read.
    pub fn validate(&self) -> Result<(), WireError> {
        if self.version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(self.version));
        }
        if !matches!(self.op, op::OPEN | op::DATA | op::CLOSE) {
            return Err(WireError::UnknownOp(self.op));
        }
        let length = self.length;
        if length as usize > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length as usize));
        }
        Ok(())
    }

    pub fn hash_matches(&self, payload: &[u8]) -> bool {
        self.payload_hash == *blake3::hash(payload).as_bytes()
    }
}

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame op: 0x{0:02x}")]
    UnknownOp(u8),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),
}
