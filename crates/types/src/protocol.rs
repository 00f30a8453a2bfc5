//! Protocol value types for the memcached binary surface.
//!
//! The wire codec itself (framing, sockets) lives outside this repository;
//! the core only deals in decoded requests and the responses handed back to
//! the framer. Opcode and status values match the memcached binary protocol
//! plus the range extensions this store adds.

use bytes::Bytes;

use crate::PartitionId;

/// Opcodes the partition core dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Read a key.
    Get = 0x00,
    /// Write a key.
    Set = 0x01,
    /// Remove a key.
    Delete = 0x04,
    /// Quiet read: misses produce no response.
    GetQ = 0x09,
    /// Read echoing the key back.
    GetK = 0x0c,
    /// Quiet read echoing the key back.
    GetKQ = 0x0d,
    /// Quiet write: success produces no response.
    SetQ = 0x11,
    /// Quiet remove.
    DeleteQ = 0x14,
    /// Ascending range read from a start key.
    RGet = 0x30,
    /// Stream change-log records above a CAS.
    ChangesSince = 0x60,
    /// Read the partition's key-range config as JSON.
    GetVBucketConfig = 0x61,
    /// Replace the partition's key-range config.
    SetVBucketConfig = 0x62,
    /// Atomically re-partition a key range.
    SplitRange = 0x63,
}

impl OpCode {
    /// Decodes a raw opcode byte. Unknown values dispatch to
    /// [`Status::UnknownCommand`].
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Get),
            0x01 => Some(Self::Set),
            0x04 => Some(Self::Delete),
            0x09 => Some(Self::GetQ),
            0x0c => Some(Self::GetK),
            0x0d => Some(Self::GetKQ),
            0x11 => Some(Self::SetQ),
            0x14 => Some(Self::DeleteQ),
            0x30 => Some(Self::RGet),
            0x60 => Some(Self::ChangesSince),
            0x61 => Some(Self::GetVBucketConfig),
            0x62 => Some(Self::SetVBucketConfig),
            0x63 => Some(Self::SplitRange),
            _ => None,
        }
    }

    /// Quiet variants suppress success responses but still emit mutation
    /// events.
    pub fn is_quiet(self) -> bool {
        matches!(self, Self::GetQ | Self::GetKQ | Self::SetQ | Self::DeleteQ)
    }

    /// GETK/GETKQ echo the key in the response.
    pub fn wants_key(self) -> bool {
        matches!(self, Self::GetK | Self::GetKQ)
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    /// The operation succeeded.
    #[default]
    Success = 0x00,
    /// The key does not exist.
    KeyEnoent = 0x01,
    /// Invalid arguments, including CAS mismatches.
    Einval = 0x04,
    /// The key lies outside this partition's configured range.
    NotMyRange = 0x60,
    /// The opcode is not in the dispatch table.
    UnknownCommand = 0x81,
}

/// A decoded request handed to a partition's command channel.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Raw opcode byte; unknown values are counted and rejected.
    pub opcode: u8,
    /// Target partition.
    pub vbid: PartitionId,
    /// Request key.
    pub key: Bytes,
    /// Conditional-write token; 0 means unconditional. For
    /// `CHANGES_SINCE` this is the exclusive lower CAS bound.
    pub cas: u64,
    /// Client flags stored with the item.
    pub flag: u32,
    /// Expiration stored with the item.
    pub exp: u32,
    /// Request body.
    pub body: Bytes,
}

impl Request {
    /// Builds a request with just an opcode and key.
    pub fn new(opcode: OpCode, key: impl Into<Bytes>) -> Self {
        Request { opcode: opcode as u8, key: key.into(), ..Default::default() }
    }
}

/// A response handed back to the framer, or streamed for range reads.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Echo of the request opcode on streamed records.
    pub opcode: u8,
    /// Outcome.
    pub status: Status,
    /// CAS of the affected or returned item.
    pub cas: u64,
    /// Item flags for reads.
    pub flag: u32,
    /// Response key (streamed records, GETK echoes).
    pub key: Bytes,
    /// Response body, or an error message for failures.
    pub body: Bytes,
    /// Set when the transport broke mid-stream; the connection must die.
    pub fatal: bool,
}

impl Response {
    /// Plain success with no payload.
    pub fn ok() -> Self {
        Response::default()
    }

    /// Success carrying the CAS assigned to a mutation.
    pub fn with_cas(cas: u64) -> Self {
        Response { cas, ..Default::default() }
    }

    /// Failure with no message body.
    pub fn status(status: Status) -> Self {
        Response { status, ..Default::default() }
    }

    /// Failure with a human-readable message body.
    pub fn error(status: Status, msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        Response { status, body: Bytes::from(msg.into_bytes()), ..Default::default() }
    }

    /// Transport failure; terminates streaming.
    pub fn fatal() -> Self {
        Response { fatal: true, ..Default::default() }
    }

    /// True for `Status::Success` and no transport failure.
    pub fn is_ok(&self) -> bool {
        self.status == Status::Success && !self.fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for op in [
            OpCode::Get,
            OpCode::Set,
            OpCode::Delete,
            OpCode::GetQ,
            OpCode::GetK,
            OpCode::GetKQ,
            OpCode::SetQ,
            OpCode::DeleteQ,
            OpCode::RGet,
            OpCode::ChangesSince,
            OpCode::GetVBucketConfig,
            OpCode::SetVBucketConfig,
            OpCode::SplitRange,
        ] {
            assert_eq!(OpCode::from_u8(op as u8), Some(op));
        }
        assert_eq!(OpCode::from_u8(0x7f), None);
    }

    #[test]
    fn extension_opcode_values() {
        assert_eq!(OpCode::ChangesSince as u8, 0x60);
        assert_eq!(OpCode::GetVBucketConfig as u8, 0x61);
        assert_eq!(OpCode::SetVBucketConfig as u8, 0x62);
        assert_eq!(OpCode::SplitRange as u8, 0x63);
        assert_eq!(Status::NotMyRange as u16, 0x60);
    }

    #[test]
    fn quiet_and_key_echo() {
        assert!(OpCode::SetQ.is_quiet());
        assert!(OpCode::GetKQ.is_quiet());
        assert!(!OpCode::Set.is_quiet());
        assert!(OpCode::GetK.wants_key());
        assert!(!OpCode::Get.wants_key());
    }

    #[test]
    fn response_constructors() {
        assert!(Response::ok().is_ok());
        assert!(!Response::status(Status::Einval).is_ok());
        assert!(!Response::fatal().is_ok());
        let e = Response::error(Status::Einval, "bad");
        assert_eq!(&e.body[..], b"bad");
    }
}
