//! Greybus operation header codec.
//!
//! Wire format (all multi-byte fields little-endian):
//! ```text
//! ┌───────────┬───────────┬─────────┬───────────┬──────────┐
//! │ size (2B) │  id (2B)  │ type(1B)│ result(1B)│ pad (2B) │
//! │ LE u16    │  LE u16   │         │           │ reserved │
//! └───────────┴───────────┴─────────┴───────────┴──────────┘
//! ```
//!
//! `size` covers the whole frame, header included. `id == 0` marks a
//! request that expects no response. Bit 7 of `type` marks a response.

use core::fmt;

use crate::error::{Error, Result};

/// Header length on the wire.
pub const HEADER_SIZE: usize = 8;

/// Set in `type` on every response frame.
pub const RESPONSE_FLAG: u8 = 0x80;

/// Operation type 0 is reserved and never dispatched to a handler.
pub const INVALID_TYPE: u8 = 0x00;

/// Largest frame expressible by the 16-bit `size` field.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

pub(crate) const ID_OFFSET: usize = 2;
pub(crate) const RESULT_OFFSET: usize = 5;

/// Decoded operation header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationHeader {
    pub size: u16,
    pub id: u16,
    pub op_type: u8,
    pub result: u8,
}

impl OperationHeader {
    /// Header for a fresh request carrying `payload_len` bytes.
    pub fn request(op_type: u8, payload_len: usize) -> Result<Self> {
        Ok(Self {
            size: frame_size(payload_len)?,
            id: 0,
            op_type,
            result: 0,
        })
    }

    /// Decode the header at the start of `buf`. Pad bytes are ignored.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            size: u16::from_le_bytes([buf[0], buf[1]]),
            id: u16::from_le_bytes([buf[2], buf[3]]),
            op_type: buf[4],
            result: buf[5],
        })
    }

    /// Write the header into the first [`HEADER_SIZE`] bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) -> Option<()> {
        let dst = out.get_mut(..HEADER_SIZE)?;
        dst.copy_from_slice(&self.to_bytes());
        Some(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let size = self.size.to_le_bytes();
        let id = self.id.to_le_bytes();
        [size[0], size[1], id[0], id[1], self.op_type, self.result, 0, 0]
    }

    pub fn is_response(&self) -> bool {
        self.op_type & RESPONSE_FLAG != 0
    }

    /// Payload bytes announced by `size`; 0 for a truncated header.
    pub fn payload_size(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }

    /// Operation result carried by a response.
    pub fn op_result(&self) -> OpResult {
        OpResult::from_code(self.result)
    }

    /// Frame-level validation for an inbound buffer.
    ///
    /// Rejects buffers shorter than the header and headers whose `size`
    /// is below the header length or beyond the delivered buffer.
    pub fn validate(frame: &[u8]) -> Result<Self> {
        let hdr = Self::decode(frame).ok_or(Error::InvalidArgument)?;
        let size = hdr.size as usize;
        if size < HEADER_SIZE || size > frame.len() {
            return Err(Error::InvalidArgument);
        }
        Ok(hdr)
    }
}

/// Total frame length for `payload_len`, bounded by the 16-bit size field.
pub(crate) fn frame_size(payload_len: usize) -> Result<u16> {
    payload_len
        .checked_add(HEADER_SIZE)
        .filter(|&n| n <= MAX_FRAME_SIZE)
        .map(|n| n as u16)
        .ok_or(Error::InvalidArgument)
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Status code carried in the `result` byte of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpResult {
    Success = 0x00,
    Interrupted = 0x01,
    Timeout = 0x02,
    NoMemory = 0x03,
    ProtocolBad = 0x04,
    Overflow = 0x05,
    Invalid = 0x06,
    Retry = 0x07,
    Nonexistent = 0x08,
    UnknownError = 0xfe,
    Malfunction = 0xff,
}

impl OpResult {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Map a wire byte to a result; unassigned codes become `UnknownError`.
    pub const fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Success,
            0x01 => Self::Interrupted,
            0x02 => Self::Timeout,
            0x03 => Self::NoMemory,
            0x04 => Self::ProtocolBad,
            0x05 => Self::Overflow,
            0x06 => Self::Invalid,
            0x07 => Self::Retry,
            0x08 => Self::Nonexistent,
            0xff => Self::Malfunction,
            _ => Self::UnknownError,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Timeout => write!(f, "timeout"),
            Self::NoMemory => write!(f, "no memory"),
            Self::ProtocolBad => write!(f, "protocol error"),
            Self::Overflow => write!(f, "overflow"),
            Self::Invalid => write!(f, "invalid"),
            Self::Retry => write!(f, "retry"),
            Self::Nonexistent => write!(f, "nonexistent"),
            Self::UnknownError => write!(f, "unknown error"),
            Self::Malfunction => write!(f, "malfunction"),
        }
    }
}
