//! Wire Header
//!
//! Every remote-cache message is framed as `header || payload`. The header
//! is a fixed 24-byte big-endian record: `status:u32`, `protocol_version:u32`,
//! `payload_size:u64`, `inflated_size:u64`. `payload_size` is the exact byte
//! length of the body that follows; `inflated_size` is the uncompressed
//! length of the payload (equal to `payload_size` for uncompressed bodies).

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Total encoded header length
pub const HEADER_SIZE: usize = 24;

/// Version stamped into every header; peers on a different version do not
/// exchange values.
pub const PROTOCOL_VERSION: u32 = 1;

/// Response status codes.
///
/// The wire carries the raw u32; codes outside this enumeration are kept
/// raw so the slave can treat them as "fall back to local compute".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    /// Request frame, or a response with nothing to say
    None = 0,
    /// Response payload is an lz4 block; inflate before decoding
    CompressedValue = 1,
    /// Response payload is the plain serialized value
    SimpleValue = 2,
    /// Master does not serve this cache or identity
    NotFound = 3,
}

impl Status {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Status::None),
            1 => Some(Status::CompressedValue),
            2 => Some(Status::SimpleValue),
            3 => Some(Status::NotFound),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Decoded frame header. `status` stays raw so unknown codes survive decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCacheHeader {
    pub status: u32,
    pub protocol_version: u32,
    pub payload_size: u64,
    pub inflated_size: u64,
}

impl RemoteCacheHeader {
    pub fn new(status: Status, payload_size: u64, inflated_size: u64) -> Self {
        Self {
            status: status.code(),
            protocol_version: PROTOCOL_VERSION,
            payload_size,
            inflated_size,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        {
            let mut cursor = &mut buf[..];
            cursor.put_u32(self.status);
            cursor.put_u32(self.protocol_version);
            cursor.put_u64(self.payload_size);
            cursor.put_u64(self.inflated_size);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "short header: {} of {} bytes",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        let mut cursor = bytes;
        Ok(Self {
            status: cursor.get_u32(),
            protocol_version: cursor.get_u32(),
            payload_size: cursor.get_u64(),
            inflated_size: cursor.get_u64(),
        })
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.status)
    }
}
