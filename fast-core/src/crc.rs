//! The two CRC16 variants used on the wire.
//!
//! Historical deployments shipped a checksum implementation that computed
//! CRC-16 with polynomial 0x1021, a zero initial value, and no bit
//! reflection. Later peers compute the conventional reflected CRC-16
//! (polynomial 0xA001, zero initial value). Both variants remain live on
//! real connections, so the codec can be configured to emit or accept
//! either, or to accept both and report which one validated.

use std::fmt;
use std::str::FromStr;

use crate::error::{FastError, FastResult};

const fn v1_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn v2_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static V1_TABLE: [u16; 256] = v1_table();
static V2_TABLE: [u16; 256] = v2_table();

/// The legacy checksum variant: polynomial 0x1021, zero init, no
/// reflection. Bit-compatible with what historical peers validate.
pub fn crc16_v1(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc = (crc << 8) ^ V1_TABLE[(((crc >> 8) ^ byte as u16) & 0xff) as usize];
    }
    crc
}

/// The conventional checksum variant: reflected polynomial 0xA001, zero
/// init.
pub fn crc16_v2(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc = (crc >> 8) ^ V2_TABLE[((crc ^ byte as u16) & 0xff) as usize];
    }
    crc
}

/// Which CRC variant(s) a codec computes.
///
/// `V1V2` is a decode-side mode: the decoder accepts a message if either
/// variant validates, and records which one did. It is never a legal
/// encoding mode; an encoder must commit to a single variant per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcMode {
    V1,
    V2,
    V1V2,
}

impl CrcMode {
    /// Reject `V1V2` in contexts that require a single concrete variant
    /// (client construction, per-message encoding overrides).
    pub fn require_concrete(self, what: &str) -> FastResult<CrcMode> {
        match self {
            CrcMode::V1V2 => Err(FastError::InvalidArgument(format!(
                "{what} must name a single CRC variant (v1 or v2), not v1v2"
            ))),
            mode => Ok(mode),
        }
    }
}

impl fmt::Display for CrcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CrcMode::V1 => "v1",
            CrcMode::V2 => "v2",
            CrcMode::V1V2 => "v1v2",
        })
    }
}

impl FromStr for CrcMode {
    type Err = FastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1" => Ok(CrcMode::V1),
            "v2" => Ok(CrcMode::V2),
            "v1v2" => Ok(CrcMode::V1V2),
            other => Err(FastError::InvalidArgument(format!(
                "unknown CRC mode \"{other}\" (expected v1, v2, or v1v2)"
            ))),
        }
    }
}
