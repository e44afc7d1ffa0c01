//! Framing codec: converts between logical messages and framed bytes.
//!
//! A frame is a fixed 15-byte header followed by a JSON payload of the
//! declared length. The codec is exposed as `tokio_util` `Encoder` and
//! `Decoder` implementations so connections can drive it through
//! `FramedRead`/`FramedWrite`.

use bytes::{Buf, BufMut, BytesMut};
use log::*;
use serde_json::{Map, Value};
use tokio_util::codec::{Decoder, Encoder};

use crate::crc::{crc16_v1, crc16_v2, CrcMode};
use crate::error::{FastError, FastProtocolError, FastReason, FastResult};
use crate::message::{
    FastMessage, FastMessageData, FastMessageMetadata, MessageStatus, FP_HEADER_SZ, FP_MSGID_MAX,
    FP_TYPE_JSON, FP_VERSION,
};

/// Iteration cap for the matching-CRC search. Hard; on exhaustion the
/// encoder silently falls back to the legacy checksum alone.
const CRC_SEARCH_MAX_ITERATIONS: i64 = 500_000;

/// Turns logical messages into framed byte buffers.
pub struct MessageEncoder {
    crc_mode: CrcMode,
}

impl MessageEncoder {
    /// Create an encoder whose default CRC variant is `crc_mode`. A
    /// `V1V2` default is only usable when every encoded message carries a
    /// concrete per-message override.
    pub fn new(crc_mode: CrcMode) -> Self {
        MessageEncoder { crc_mode }
    }
}

impl Encoder<FastMessage> for MessageEncoder {
    type Error = FastError;

    fn encode(&mut self, msg: FastMessage, dst: &mut BytesMut) -> FastResult<()> {
        if msg.msgid > FP_MSGID_MAX {
            return Err(FastError::InvalidArgument(format!(
                "msgid {} out of range (max {})",
                msg.msgid, FP_MSGID_MAX
            )));
        }

        let effective = match msg.crc_mode {
            Some(mode) => mode.require_concrete("per-message CRC mode")?,
            None => self.crc_mode.require_concrete("effective CRC mode")?,
        };

        let (payload, crc) = serialize_with_crc(&msg.data, effective)?;
        if payload.len() > u32::MAX as usize {
            return Err(FastError::InvalidArgument(format!(
                "payload of {} bytes exceeds the frameable maximum",
                payload.len()
            )));
        }

        dst.reserve(FP_HEADER_SZ + payload.len());
        dst.put_u8(FP_VERSION);
        dst.put_u8(FP_TYPE_JSON);
        dst.put_u8(msg.status as u8);
        dst.put_u32(msg.msgid);
        dst.put_u32(u32::from(crc));
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

fn serialize_with_crc(data: &FastMessageData, mode: CrcMode) -> FastResult<(Vec<u8>, u16)> {
    let payload = serde_json::to_vec(data).map_err(|e| {
        FastError::InvalidArgument(format!("message data cannot be serialized: {e}"))
    })?;
    match mode {
        CrcMode::V2 => {
            let crc = crc16_v2(&payload);
            Ok((payload, crc))
        }
        _ => Ok(matching_crc_search(data, payload)),
    }
}

/// Find a serialization of `data` whose checksum is identical under both
/// CRC variants, so that a peer validating with either accepts it.
///
/// The only degree of freedom is the `m.uts` timestamp: incrementing it and
/// re-serializing explores the collision space without changing the message
/// meaning. Serialization is deterministic (struct fields in declaration
/// order, object keys sorted), so every increment changes the byte
/// sequence. Payloads without a timestamp, and searches that exhaust the
/// iteration cap, fall back to the legacy checksum of the original
/// serialization.
fn matching_crc_search(data: &FastMessageData, first: Vec<u8>) -> (Vec<u8>, u16) {
    let crc = crc16_v1(&first);
    if crc == crc16_v2(&first) {
        return (first, crc);
    }
    let Some(uts) = data.m.uts else {
        return (first, crc);
    };

    let mut candidate = data.clone();
    for i in 1..=CRC_SEARCH_MAX_ITERATIONS {
        candidate.m.uts = Some(uts.wrapping_add(i));
        let payload = match serde_json::to_vec(&candidate) {
            Ok(p) => p,
            Err(_) => break,
        };
        let v1 = crc16_v1(&payload);
        if v1 == crc16_v2(&payload) {
            trace!("matching-CRC search converged after {i} iterations");
            return (payload, v1);
        }
    }

    debug!("matching-CRC search exhausted; emitting legacy checksum only");
    (first, crc)
}

/// Accumulates inbound bytes and emits fully-validated logical messages.
///
/// Errors latch: after the first protocol fault, every subsequent call
/// reports the same fault and no further messages are emitted.
pub struct MessageDecoder {
    crc_mode: CrcMode,
    failed: Option<FastProtocolError>,
}

impl MessageDecoder {
    pub fn new(crc_mode: CrcMode) -> Self {
        MessageDecoder {
            crc_mode,
            failed: None,
        }
    }

    fn fail(&mut self, reason: FastReason, message: String) -> FastError {
        let err = FastProtocolError::new(reason, message);
        self.failed = Some(err.clone());
        FastError::Protocol(err)
    }

    fn check_crc(&mut self, expected: u32, payload: &[u8]) -> FastResult<Option<CrcMode>> {
        match self.crc_mode {
            CrcMode::V1 => {
                let calculated = u32::from(crc16_v1(payload));
                if calculated == expected {
                    Ok(Some(CrcMode::V1))
                } else {
                    Err(self.fail(
                        FastReason::BadCrc,
                        format!("expected CRC {expected}, calculated {calculated}"),
                    ))
                }
            }
            CrcMode::V2 => {
                let calculated = u32::from(crc16_v2(payload));
                if calculated == expected {
                    Ok(Some(CrcMode::V2))
                } else {
                    Err(self.fail(
                        FastReason::BadCrc,
                        format!("expected CRC {expected}, calculated {calculated}"),
                    ))
                }
            }
            CrcMode::V1V2 => {
                let v1 = u32::from(crc16_v1(payload));
                let v2 = u32::from(crc16_v2(payload));
                match (v1 == expected, v2 == expected) {
                    (true, true) => Ok(Some(CrcMode::V1V2)),
                    (true, false) => Ok(Some(CrcMode::V1)),
                    (false, true) => Ok(Some(CrcMode::V2)),
                    (false, false) => Err(self.fail(
                        FastReason::BadCrc,
                        format!("expected CRC {expected}, calculated {v1} (legacy) / {v2}"),
                    )),
                }
            }
        }
    }

    /// Validate the payload's shape for the given status and pull it apart
    /// into the typed envelope.
    fn check_shape(&mut self, status: MessageStatus, value: Value) -> FastResult<FastMessageData> {
        let Value::Object(mut map) = value else {
            return Err(self.fail(
                FastReason::BadData,
                "message payload is not a JSON object".into(),
            ));
        };

        let m = match map.remove("m") {
            Some(Value::Object(m)) => self.check_metadata(m)?,
            Some(_) => {
                return Err(self.fail(
                    FastReason::BadData,
                    "message metadata (\"m\") is not an object".into(),
                ))
            }
            None => {
                return Err(self.fail(
                    FastReason::BadData,
                    "message payload has no metadata (\"m\")".into(),
                ))
            }
        };

        let d = map.remove("d");
        let d = match status {
            MessageStatus::Data | MessageStatus::End => match d {
                Some(d @ Value::Array(_)) => d,
                _ => {
                    return Err(self.fail(
                        FastReason::BadDataD,
                        format!("{status} message \"d\" is missing or not an array"),
                    ))
                }
            },
            MessageStatus::Error => match d {
                Some(d @ Value::Object(_))
                    if d.get("name").is_some_and(Value::is_string)
                        && d.get("message").is_some_and(Value::is_string) =>
                {
                    d
                }
                _ => {
                    return Err(self.fail(
                        FastReason::BadError,
                        "ERROR message \"d\" is not an object with string \
                         \"name\" and \"message\""
                            .into(),
                    ))
                }
            },
        };

        Ok(FastMessageData { m, d })
    }

    fn check_metadata(&mut self, mut m: Map<String, Value>) -> FastResult<FastMessageMetadata> {
        let name = match m.remove("name") {
            Some(Value::String(s)) => Some(s),
            None => None,
            Some(_) => {
                return Err(self.fail(
                    FastReason::BadData,
                    "metadata \"name\" is not a string".into(),
                ))
            }
        };
        let uts = match m.remove("uts") {
            Some(Value::Number(n)) if n.as_i64().is_some() => n.as_i64(),
            None => None,
            Some(_) => {
                return Err(self.fail(
                    FastReason::BadData,
                    "metadata \"uts\" is not an integer".into(),
                ))
            }
        };
        Ok(FastMessageMetadata { name, uts })
    }
}

impl Decoder for MessageDecoder {
    type Item = FastMessage;
    type Error = FastError;

    fn decode(&mut self, src: &mut BytesMut) -> FastResult<Option<FastMessage>> {
        if let Some(err) = &self.failed {
            return Err(FastError::Protocol(err.clone()));
        }
        if src.len() < FP_HEADER_SZ {
            return Ok(None);
        }

        let mut header = &src[..FP_HEADER_SZ];
        let version = header.get_u8();
        let typ = header.get_u8();
        let status_byte = header.get_u8();
        let msgid = header.get_u32();
        let expected_crc = header.get_u32();
        let dlen = header.get_u32() as usize;

        if version != FP_VERSION {
            return Err(self.fail(
                FastReason::UnsupportedVersion,
                format!("unsupported version {version}"),
            ));
        }
        if typ != FP_TYPE_JSON {
            return Err(self.fail(
                FastReason::UnsupportedType,
                format!("unsupported message type {typ}"),
            ));
        }
        let status = match MessageStatus::try_from(status_byte) {
            Ok(status) => status,
            Err(()) => {
                return Err(self.fail(
                    FastReason::UnsupportedStatus,
                    format!("unsupported status {status_byte}"),
                ))
            }
        };
        if msgid > FP_MSGID_MAX {
            return Err(self.fail(
                FastReason::InvalidMsgid,
                format!("illegal msgid {msgid}"),
            ));
        }

        // Partially buffered payload: re-parse the header when more bytes
        // arrive rather than carrying parse state across calls.
        if src.len() < FP_HEADER_SZ + dlen {
            src.reserve(FP_HEADER_SZ + dlen - src.len());
            return Ok(None);
        }

        src.advance(FP_HEADER_SZ);
        let payload = src.split_to(dlen);

        let crc_mode = self.check_crc(expected_crc, &payload)?;
        let value: Value = serde_json::from_slice(&payload).map_err(|e| {
            self.fail(FastReason::InvalidJson, format!("invalid JSON payload: {e}"))
        })?;
        let data = self.check_shape(status, value)?;

        trace!("decoded {status} message, msgid {msgid}, {dlen} payload bytes");
        Ok(Some(FastMessage {
            msgid,
            status,
            data,
            crc_mode,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> FastResult<Option<FastMessage>> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(self.fail(
                FastReason::IncompleteMessage,
                format!("stream ended with {} unconsumed bytes", src.len()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(msg: FastMessage, mode: CrcMode) -> FastResult<BytesMut> {
        let mut buf = BytesMut::new();
        MessageEncoder::new(mode).encode(msg, &mut buf)?;
        Ok(buf)
    }

    fn decode_one(buf: &mut BytesMut, mode: CrcMode) -> FastResult<Option<FastMessage>> {
        MessageDecoder::new(mode).decode(buf)
    }

    fn request(msgid: u32) -> FastMessage {
        FastMessage::data(
            msgid,
            FastMessageData {
                m: FastMessageMetadata {
                    name: Some("echo".into()),
                    uts: Some(1_467_681_339_456_884),
                },
                d: json!(["lafayette"]),
            },
        )
    }

    /// An END payload without a timestamp: the encoder leaves these bytes
    /// untouched in every mode.
    fn stable_end(msgid: u32) -> FastMessage {
        FastMessage::end(
            msgid,
            FastMessageData {
                m: FastMessageMetadata {
                    name: Some("echo".into()),
                    uts: None,
                },
                d: json!([{"value": "lafayette"}]),
            },
        )
    }

    #[test]
    fn round_trip_v2() {
        for msgid in [0, 1, 17, FP_MSGID_MAX] {
            let msg = request(msgid);
            let mut buf = encode(msg.clone(), CrcMode::V2).unwrap();
            let decoded = decode_one(&mut buf, CrcMode::V2).unwrap().unwrap();
            assert_eq!(decoded.msgid, msg.msgid);
            assert_eq!(decoded.status, msg.status);
            assert_eq!(decoded.data, msg.data);
            assert_eq!(decoded.crc_mode, Some(CrcMode::V2));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn round_trip_v1_without_timestamp() {
        let msg = stable_end(9);
        let mut buf = encode(msg.clone(), CrcMode::V1).unwrap();
        let decoded = decode_one(&mut buf, CrcMode::V1).unwrap().unwrap();
        assert_eq!(decoded.data, msg.data);
        assert_eq!(decoded.crc_mode, Some(CrcMode::V1));
    }

    #[test]
    fn v1_round_trip_preserves_all_but_timestamp() {
        let msg = request(3);
        let mut buf = encode(msg.clone(), CrcMode::V1).unwrap();
        let decoded = decode_one(&mut buf, CrcMode::V1).unwrap().unwrap();
        assert_eq!(decoded.msgid, msg.msgid);
        assert_eq!(decoded.status, msg.status);
        assert_eq!(decoded.data.m.name, msg.data.m.name);
        assert_eq!(decoded.data.d, msg.data.d);
    }

    #[test]
    fn encoded_length_is_header_plus_payload() {
        let msg = stable_end(1);
        let payload = serde_json::to_vec(&msg.data).unwrap();
        let buf = encode(msg, CrcMode::V2).unwrap();
        assert_eq!(buf.len(), FP_HEADER_SZ + payload.len());
    }

    #[test]
    fn matching_search_satisfies_both_variants() {
        let msg = request(1);
        let buf = encode(msg, CrcMode::V1).unwrap();
        let payload = &buf[FP_HEADER_SZ..];
        let expected = u32::from_be_bytes(buf[7..11].try_into().unwrap());
        assert_eq!(u32::from(crc16_v1(payload)), expected);
        assert_eq!(u32::from(crc16_v2(payload)), expected);
    }

    #[test]
    fn v1v2_decoder_accepts_both_variants_and_reports_which() {
        // No timestamp, so the V1 encoding keeps its legacy-only checksum
        // unless the payload collides naturally; either way the decoder
        // must accept it and report a mode that validated.
        let mut buf = encode(stable_end(4), CrcMode::V1).unwrap();
        let decoded = decode_one(&mut buf, CrcMode::V1V2).unwrap().unwrap();
        assert!(matches!(
            decoded.crc_mode,
            Some(CrcMode::V1) | Some(CrcMode::V1V2)
        ));

        let mut buf = encode(stable_end(5), CrcMode::V2).unwrap();
        let decoded = decode_one(&mut buf, CrcMode::V1V2).unwrap().unwrap();
        assert!(matches!(
            decoded.crc_mode,
            Some(CrcMode::V2) | Some(CrcMode::V1V2)
        ));

        // A searched message validates under both.
        let mut buf = encode(request(6), CrcMode::V1).unwrap();
        let decoded = decode_one(&mut buf, CrcMode::V1V2).unwrap().unwrap();
        assert_eq!(decoded.crc_mode, Some(CrcMode::V1V2));
    }

    #[test]
    fn encode_rejects_out_of_range_msgid() {
        let mut msg = stable_end(0);
        msg.msgid = FP_MSGID_MAX + 1;
        let err = encode(msg, CrcMode::V2).unwrap_err();
        assert!(matches!(err, FastError::InvalidArgument(_)));
    }

    #[test]
    fn encode_rejects_v1v2_override() {
        let msg = stable_end(1).with_crc_mode(CrcMode::V1V2);
        let err = encode(msg, CrcMode::V2).unwrap_err();
        assert!(matches!(err, FastError::InvalidArgument(_)));
    }

    #[test]
    fn encode_rejects_v1v2_default_without_override() {
        let err = encode(stable_end(1), CrcMode::V1V2).unwrap_err();
        assert!(matches!(err, FastError::InvalidArgument(_)));

        let msg = stable_end(2).with_crc_mode(CrcMode::V2);
        assert!(encode(msg, CrcMode::V1V2).is_ok());
    }

    fn protocol_reason(err: FastError) -> FastReason {
        match err {
            FastError::Protocol(e) => e.reason,
            other => panic!("expected protocol error, got {other}"),
        }
    }

    #[test]
    fn decode_rejects_bad_header_fields() {
        let good = encode(stable_end(1), CrcMode::V2).unwrap();

        let mut buf = good.clone();
        buf[0] = 2;
        assert_eq!(
            protocol_reason(decode_one(&mut buf, CrcMode::V2).unwrap_err()),
            FastReason::UnsupportedVersion
        );

        let mut buf = good.clone();
        buf[1] = 9;
        assert_eq!(
            protocol_reason(decode_one(&mut buf, CrcMode::V2).unwrap_err()),
            FastReason::UnsupportedType
        );

        let mut buf = good.clone();
        buf[2] = 7;
        assert_eq!(
            protocol_reason(decode_one(&mut buf, CrcMode::V2).unwrap_err()),
            FastReason::UnsupportedStatus
        );

        let mut buf = good.clone();
        buf[3] = 0x80;
        assert_eq!(
            protocol_reason(decode_one(&mut buf, CrcMode::V2).unwrap_err()),
            FastReason::InvalidMsgid
        );
    }

    #[test]
    fn decode_rejects_corrupt_crc() {
        let mut buf = encode(stable_end(1), CrcMode::V2).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        assert_eq!(
            protocol_reason(decode_one(&mut buf, CrcMode::V2).unwrap_err()),
            FastReason::BadCrc
        );
    }

    fn frame_raw(status: u8, payload: &[u8], mode: CrcMode) -> BytesMut {
        let crc = match mode {
            CrcMode::V2 => crc16_v2(payload),
            _ => crc16_v1(payload),
        };
        let mut buf = BytesMut::new();
        buf.put_u8(FP_VERSION);
        buf.put_u8(FP_TYPE_JSON);
        buf.put_u8(status);
        buf.put_u32(1);
        buf.put_u32(u32::from(crc));
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        for (payload, reason) in [
            (&br#"{"m":{},"d":"#[..], FastReason::InvalidJson),
            (br#"null"#, FastReason::BadData),
            (br#"[1,2]"#, FastReason::BadData),
            (br#"{"d":[]}"#, FastReason::BadData),
            (br#"{"m":7,"d":[]}"#, FastReason::BadData),
            (br#"{"m":{"name":7},"d":[]}"#, FastReason::BadData),
            (br#"{"m":{}}"#, FastReason::BadDataD),
            (br#"{"m":{},"d":{}}"#, FastReason::BadDataD),
        ] {
            let mut buf = frame_raw(MessageStatus::Data as u8, payload, CrcMode::V2);
            assert_eq!(
                protocol_reason(decode_one(&mut buf, CrcMode::V2).unwrap_err()),
                reason,
                "payload {:?}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[test]
    fn decode_rejects_malformed_errors() {
        for payload in [
            &br#"{"m":{},"d":[]}"#[..],
            br#"{"m":{},"d":{"name":"E"}}"#,
            br#"{"m":{},"d":{"message":"m"}}"#,
            br#"{"m":{},"d":{"name":1,"message":"m"}}"#,
        ] {
            let mut buf = frame_raw(MessageStatus::Error as u8, payload, CrcMode::V2);
            assert_eq!(
                protocol_reason(decode_one(&mut buf, CrcMode::V2).unwrap_err()),
                FastReason::BadError,
                "payload {:?}",
                String::from_utf8_lossy(payload)
            );
        }

        let mut buf = frame_raw(
            MessageStatus::Error as u8,
            br#"{"m":{},"d":{"name":"E","message":"m","info":{"k":1}}}"#,
            CrcMode::V2,
        );
        let decoded = decode_one(&mut buf, CrcMode::V2).unwrap().unwrap();
        assert_eq!(decoded.status, MessageStatus::Error);
    }

    #[test]
    fn decoder_waits_for_complete_frames() {
        let full = encode(stable_end(1), CrcMode::V2).unwrap();
        let mut decoder = MessageDecoder::new(CrcMode::V2);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..7]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[7..20]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[20..]);
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn incomplete_final_message_is_terminal() {
        let full = encode(stable_end(1), CrcMode::V2).unwrap();
        let mut decoder = MessageDecoder::new(CrcMode::V2);
        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        let err = decoder.decode_eof(&mut buf).unwrap_err();
        assert_eq!(protocol_reason(err), FastReason::IncompleteMessage);
    }

    #[test]
    fn decoder_errors_latch() {
        let mut decoder = MessageDecoder::new(CrcMode::V2);
        let mut buf = encode(stable_end(1), CrcMode::V2).unwrap();
        buf[0] = 9;
        assert!(decoder.decode(&mut buf).is_err());

        // A pristine frame afterwards is still refused.
        let mut good = encode(stable_end(2), CrcMode::V2).unwrap();
        let err = decoder.decode(&mut good).unwrap_err();
        assert_eq!(protocol_reason(err), FastReason::UnsupportedVersion);
    }

    #[test]
    fn very_large_payload_round_trips() {
        let big = "x".repeat(28 * 1024 * 1024);
        let msg = FastMessage::end(
            2,
            FastMessageData {
                m: FastMessageMetadata::default(),
                d: json!([big]),
            },
        );
        let mut buf = encode(msg.clone(), CrcMode::V2).unwrap();
        assert!(buf.len() > 28 * 1024 * 1024);
        let decoded = decode_one(&mut buf, CrcMode::V2).unwrap().unwrap();
        assert_eq!(decoded.data.d, msg.data.d);
    }
}
