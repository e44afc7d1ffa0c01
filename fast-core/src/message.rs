use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crc::CrcMode;

/// Size of the fixed message header in bytes.
pub const FP_HEADER_SZ: usize = 15;

/// Only supported protocol version.
pub const FP_VERSION: u8 = 1;

/// Only supported payload type: UTF-8 encoded JSON.
pub const FP_TYPE_JSON: u8 = 1;

/// Largest legal message identifier. Msgids are 31-bit values; the high bit
/// of the wire field must be zero.
pub const FP_MSGID_MAX: u32 = (1 << 31) - 1;

/// Status byte of a framed message.
///
/// A request is a single DATA message from the client. The server answers
/// with zero or more DATA messages followed by exactly one END or ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageStatus {
    Data = 1,
    End = 2,
    Error = 3,
}

impl TryFrom<u8> for MessageStatus {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        match v {
            1 => Ok(MessageStatus::Data),
            2 => Ok(MessageStatus::End),
            3 => Ok(MessageStatus::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Data => "DATA",
            Self::End => "END",
            Self::Error => "ERROR",
        })
    }
}

/// The `m` subobject of a message payload.
///
/// Requests carry the RPC method name and a microsecond timestamp. The
/// timestamp doubles as the degree of freedom for the matching-CRC search,
/// so peers must not ascribe meaning to its exact value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FastMessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uts: Option<i64>,
}

impl FastMessageMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        FastMessageMetadata {
            name: Some(name.into()),
            uts: Some(now_micros()),
        }
    }
}

/// Payload of a logical message: metadata plus the status-dependent `d`
/// field. For DATA and END messages `d` is an array of values; for ERROR
/// messages it is an object describing the failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastMessageData {
    pub m: FastMessageMetadata,
    pub d: Value,
}

impl FastMessageData {
    pub fn new(name: impl Into<String>, d: Value) -> Self {
        FastMessageData {
            m: FastMessageMetadata::new(name),
            d,
        }
    }
}

/// A logical Fast message: the unit the codec converts to and from framed
/// bytes.
///
/// `crc_mode` has two roles. On encode it optionally overrides the
/// encoder's default CRC variant for this one message. On decode it reports
/// which variant validated the inbound checksum, so a dual-accept server
/// can mirror the client's variant in its responses.
#[derive(Debug, Clone, PartialEq)]
pub struct FastMessage {
    pub msgid: u32,
    pub status: MessageStatus,
    pub data: FastMessageData,
    pub crc_mode: Option<CrcMode>,
}

impl FastMessage {
    pub fn data(msgid: u32, data: FastMessageData) -> Self {
        FastMessage {
            msgid,
            status: MessageStatus::Data,
            data,
            crc_mode: None,
        }
    }

    pub fn end(msgid: u32, data: FastMessageData) -> Self {
        FastMessage {
            msgid,
            status: MessageStatus::End,
            data,
            crc_mode: None,
        }
    }

    pub fn error(msgid: u32, data: FastMessageData) -> Self {
        FastMessage {
            msgid,
            status: MessageStatus::Error,
            data,
            crc_mode: None,
        }
    }

    /// Set the per-message CRC variant.
    pub fn with_crc_mode(mut self, mode: CrcMode) -> Self {
        self.crc_mode = Some(mode);
        self
    }
}

/// Microseconds since the Unix epoch, the timestamp unit used in message
/// metadata.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
