//! Wire codec for the augmentor bus.
//!
//! All frames are sequences of length-prefixed byte strings on a datagram
//! transport that preserves frame boundaries. The peer address is not part
//! of the payload: on receive it is the datagram source, on send the
//! destination. Documented frame shapes count the address as element 0,
//! and the errors below report sizes the same way.
//!
//! # Frames
//!
//! ```text
//! outbound AUGMENT : [addr, "AUGMENT", "1.0", augmentor, auctionId,
//!                     requestFormat, requestPayload, encodedAgentSet,
//!                     timestampOfSend]
//! inbound  CONFIG  : [addr, "CONFIG", "1.0", augmentor[, maxInFlight]]
//! outbound CONFIGOK: [addr, "CONFIGOK"]
//! inbound  RESPONSE: [addr, "RESPONSE", "1.0", startTimestamp, auctionId,
//!                     augmentor, payload]
//! ```
//!
//! Each part is a little-endian `u32` length followed by that many bytes.
//! `encodedAgentSet` is the bidder agent identifiers as a postcard-encoded
//! string set; timestamps are decimal seconds since the Unix epoch.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::auction::AuctionId;

/// Protocol version tag carried by every typed frame.
pub const VERSION: &str = "1.0";

/// Errors decoding or encoding bus frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A length prefix points past the end of the datagram.
    #[error("frame part extends past the end of the buffer")]
    Truncated,
    /// Element 1 is not a known message type.
    #[error("unknown augmentor message type {0:?}")]
    UnknownMessageType(String),
    /// Element count (address included) outside the documented shape.
    #[error("{kind} frame has wrong size: {got} elements")]
    WrongSize { kind: &'static str, got: usize },
    #[error("unknown version {got:?} for {kind} frame")]
    BadVersion { kind: &'static str, got: String },
    #[error("malformed {kind} frame: {detail}")]
    Malformed { kind: &'static str, detail: String },
    /// Agent-set serialization failed (encode side only).
    #[error("agent set encoding failed: {0}")]
    AgentSet(#[from] postcard::Error),
}

/// Writer for multipart frames.
struct PartWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> PartWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_part(&mut self, part: &[u8]) {
        self.buf.extend_from_slice(&(part.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(part);
    }

    fn put_str(&mut self, part: &str) {
        self.put_part(part.as_bytes());
    }
}

/// Reader for multipart frames.
struct PartReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> PartReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn is_empty(&self) -> bool {
        self.cursor >= self.buf.len()
    }

    fn take_part(&mut self) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() - self.cursor < 4 {
            return Err(ProtocolError::Truncated);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buf[self.cursor..self.cursor + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        self.cursor += 4;

        if self.buf.len() - self.cursor < len {
            return Err(ProtocolError::Truncated);
        }
        let part = &self.buf[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(part)
    }
}

/// Splits a datagram into its parts.
///
/// # Errors
///
/// Fails with [`ProtocolError::Truncated`] if a length prefix overruns the
/// buffer.
pub fn decode_parts(bytes: &[u8]) -> Result<Vec<&[u8]>, ProtocolError> {
    let mut reader = PartReader::new(bytes);
    let mut parts = Vec::new();
    while !reader.is_empty() {
        parts.push(reader.take_part()?);
    }
    Ok(parts)
}

/// Encodes parts into `buf` (cleared first, capacity preserved).
pub fn encode_parts(parts: &[&[u8]], buf: &mut Vec<u8>) {
    let mut writer = PartWriter::new(buf);
    for part in parts {
        writer.put_part(part);
    }
}

/// Worker registration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFrame {
    pub augmentor: String,
    /// Raw optional fifth element; negative or absent means "use default".
    pub max_in_flight: Option<i64>,
}

impl ConfigFrame {
    /// The in-flight budget this registration asks for, after applying the
    /// absent-or-negative default rule.
    #[must_use]
    pub fn resolved_max_in_flight(&self, default: u32) -> u32 {
        match self.max_in_flight {
            Some(v) if v >= 0 => v as u32,
            _ => default,
        }
    }
}

/// Worker enrichment response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    /// Wall-clock send timestamp echoed from the AUGMENT frame.
    pub start_time_secs: f64,
    pub auction_id: AuctionId,
    pub augmentor: String,
    /// Raw payload: empty, `"null"`, or a JSON document.
    pub payload: String,
}

impl ResponseFrame {
    /// `true` when the payload carries no augmentation.
    #[must_use]
    pub fn is_null_payload(&self) -> bool {
        self.payload.is_empty() || self.payload == "null"
    }
}

/// A parsed inbound frame from an augmentor worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Config(ConfigFrame),
    Response(ResponseFrame),
}

fn utf8_part<'a>(
    part: &'a [u8],
    kind: &'static str,
    what: &str,
) -> Result<&'a str, ProtocolError> {
    std::str::from_utf8(part).map_err(|_| ProtocolError::Malformed {
        kind,
        detail: format!("{what} is not valid UTF-8"),
    })
}

/// Parses a datagram received from a worker.
///
/// # Errors
///
/// Fails with a [`ProtocolError`] on truncation, unknown type, wrong part
/// count, version mismatch, or malformed fields. The caller counts and
/// drops such frames; they never reach the auction path.
pub fn parse_worker_message(bytes: &[u8]) -> Result<WorkerMessage, ProtocolError> {
    let parts = decode_parts(bytes)?;
    let Some(first) = parts.first() else {
        return Err(ProtocolError::UnknownMessageType(String::new()));
    };

    if *first == b"CONFIG" {
        parse_config(&parts).map(WorkerMessage::Config)
    } else if *first == b"RESPONSE" {
        parse_response(&parts).map(WorkerMessage::Response)
    } else {
        Err(ProtocolError::UnknownMessageType(
            String::from_utf8_lossy(first).into_owned(),
        ))
    }
}

fn parse_config(parts: &[&[u8]]) -> Result<ConfigFrame, ProtocolError> {
    const KIND: &str = "CONFIG";
    // [addr, "CONFIG", version, name[, maxInFlight]] — 4 or 5 elements.
    if parts.len() < 3 || parts.len() > 4 {
        return Err(ProtocolError::WrongSize {
            kind: KIND,
            got: parts.len() + 1,
        });
    }

    let version = utf8_part(parts[1], KIND, "version")?;
    if version != VERSION {
        return Err(ProtocolError::BadVersion {
            kind: KIND,
            got: version.to_string(),
        });
    }

    let augmentor = utf8_part(parts[2], KIND, "augmentor name")?;
    if augmentor.is_empty() {
        return Err(ProtocolError::Malformed {
            kind: KIND,
            detail: "no augmentor name specified".to_string(),
        });
    }

    let max_in_flight = match parts.get(3) {
        Some(part) => {
            let text = utf8_part(part, KIND, "maxInFlight")?;
            Some(text.parse::<i64>().map_err(|_| ProtocolError::Malformed {
                kind: KIND,
                detail: format!("maxInFlight {text:?} is not an integer"),
            })?)
        }
        None => None,
    };

    Ok(ConfigFrame {
        augmentor: augmentor.to_string(),
        max_in_flight,
    })
}

fn parse_response(parts: &[&[u8]]) -> Result<ResponseFrame, ProtocolError> {
    const KIND: &str = "RESPONSE";
    // [addr, "RESPONSE", version, startTime, id, augmentor, payload] — 7 elements.
    if parts.len() != 6 {
        return Err(ProtocolError::WrongSize {
            kind: KIND,
            got: parts.len() + 1,
        });
    }

    let version = utf8_part(parts[1], KIND, "version")?;
    if version != VERSION {
        return Err(ProtocolError::BadVersion {
            kind: KIND,
            got: version.to_string(),
        });
    }

    let start_text = utf8_part(parts[2], KIND, "start timestamp")?;
    let start_time_secs = start_text
        .parse::<f64>()
        .map_err(|_| ProtocolError::Malformed {
            kind: KIND,
            detail: format!("start timestamp {start_text:?} is not a number"),
        })?;

    let auction_id: AuctionId = utf8_part(parts[3], KIND, "auction id")?
        .parse()
        .expect("AuctionId::from_str is infallible");
    let augmentor = utf8_part(parts[4], KIND, "augmentor name")?.to_string();
    let payload = utf8_part(parts[5], KIND, "payload")?.to_string();

    Ok(ResponseFrame {
        start_time_secs,
        auction_id,
        augmentor,
        payload,
    })
}

/// Encodes an AUGMENT frame into `buf`.
///
/// # Errors
///
/// Fails only if the agent set cannot be serialized.
pub fn encode_augment(
    augmentor: &str,
    auction_id: &AuctionId,
    request_format: &str,
    request: &str,
    agents: &BTreeSet<String>,
    sent_at_secs: f64,
    buf: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    let agent_bytes = postcard::to_allocvec(agents)?;

    let mut writer = PartWriter::new(buf);
    writer.put_str("AUGMENT");
    writer.put_str(VERSION);
    writer.put_str(augmentor);
    writer.put_str(auction_id.as_str());
    writer.put_str(request_format);
    writer.put_str(request);
    writer.put_part(&agent_bytes);
    writer.put_str(&format_timestamp(sent_at_secs));
    Ok(())
}

/// Encodes the CONFIGOK acknowledgement into `buf`.
pub fn encode_config_ok(buf: &mut Vec<u8>) {
    let mut writer = PartWriter::new(buf);
    writer.put_str("CONFIGOK");
}

/// Decodes the agent set element of an AUGMENT frame.
///
/// # Errors
///
/// Fails if the bytes are not a postcard-encoded string set.
pub fn decode_agent_set(bytes: &[u8]) -> Result<BTreeSet<String>, postcard::Error> {
    postcard::from_bytes(bytes)
}

/// Seconds since the Unix epoch, as carried in frame timestamps.
#[must_use]
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

fn format_timestamp(secs: f64) -> String {
    format!("{secs:.6}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(parts: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_parts(parts, &mut buf);
        buf
    }

    #[test]
    fn parts_roundtrip() {
        let buf = frame(&[b"CONFIG", b"1.0", b"geo"]);
        let parts = decode_parts(&buf).unwrap();
        assert_eq!(parts, vec![&b"CONFIG"[..], b"1.0", b"geo"]);
    }

    #[test]
    fn parts_roundtrip_empty_and_binary() {
        let buf = frame(&[b"", &[0u8, 255, 7]]);
        let parts = decode_parts(&buf).unwrap();
        assert_eq!(parts, vec![&b""[..], &[0u8, 255, 7][..]]);
    }

    #[test]
    fn truncated_frame_rejected() {
        let mut buf = frame(&[b"RESPONSE"]);
        buf.truncate(buf.len() - 2);
        assert!(matches!(
            decode_parts(&buf),
            Err(ProtocolError::Truncated)
        ));

        // Length prefix larger than the remaining bytes.
        let lying = 100u32.to_le_bytes().to_vec();
        assert!(matches!(
            decode_parts(&lying),
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn parse_config_minimal() {
        let buf = frame(&[b"CONFIG", b"1.0", b"geo"]);
        let msg = parse_worker_message(&buf).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Config(ConfigFrame {
                augmentor: "geo".to_string(),
                max_in_flight: None,
            })
        );
    }

    #[test]
    fn parse_config_with_max_in_flight() {
        let buf = frame(&[b"CONFIG", b"1.0", b"geo", b"200"]);
        let WorkerMessage::Config(cfg) = parse_worker_message(&buf).unwrap() else {
            panic!("expected CONFIG");
        };
        assert_eq!(cfg.max_in_flight, Some(200));
        assert_eq!(cfg.resolved_max_in_flight(3000), 200);
    }

    #[test]
    fn config_default_applies_when_absent_or_negative() {
        let absent = ConfigFrame {
            augmentor: "geo".into(),
            max_in_flight: None,
        };
        let negative = ConfigFrame {
            augmentor: "geo".into(),
            max_in_flight: Some(-1),
        };
        assert_eq!(absent.resolved_max_in_flight(3000), 3000);
        assert_eq!(negative.resolved_max_in_flight(3000), 3000);
    }

    #[test]
    fn config_wrong_version_rejected() {
        let buf = frame(&[b"CONFIG", b"2.0", b"geo"]);
        assert!(matches!(
            parse_worker_message(&buf),
            Err(ProtocolError::BadVersion { kind: "CONFIG", .. })
        ));
    }

    #[test]
    fn config_empty_name_rejected() {
        let buf = frame(&[b"CONFIG", b"1.0", b""]);
        assert!(matches!(
            parse_worker_message(&buf),
            Err(ProtocolError::Malformed { kind: "CONFIG", .. })
        ));
    }

    #[test]
    fn config_too_many_elements_rejected() {
        let buf = frame(&[b"CONFIG", b"1.0", b"geo", b"5", b"extra"]);
        // 5 payload parts + the address element = 6.
        assert!(matches!(
            parse_worker_message(&buf),
            Err(ProtocolError::WrongSize {
                kind: "CONFIG",
                got: 6
            })
        ));
    }

    #[test]
    fn parse_response_happy_path() {
        let buf = frame(&[
            b"RESPONSE",
            b"1.0",
            b"1234.5",
            b"42",
            b"geo",
            br#"{"tags":["x"]}"#,
        ]);
        let WorkerMessage::Response(resp) = parse_worker_message(&buf).unwrap() else {
            panic!("expected RESPONSE");
        };
        assert_eq!(resp.start_time_secs, 1234.5);
        assert_eq!(resp.auction_id, AuctionId::from(42));
        assert_eq!(resp.augmentor, "geo");
        assert_eq!(resp.payload, r#"{"tags":["x"]}"#);
        assert!(!resp.is_null_payload());
    }

    #[test]
    fn response_null_payload_variants() {
        for payload in [&b""[..], b"null"] {
            let buf = frame(&[b"RESPONSE", b"1.0", b"0", b"1", b"geo", payload]);
            let WorkerMessage::Response(resp) = parse_worker_message(&buf).unwrap() else {
                panic!("expected RESPONSE");
            };
            assert!(resp.is_null_payload());
        }
    }

    #[test]
    fn response_wrong_size_rejected() {
        let buf = frame(&[b"RESPONSE", b"1.0", b"0", b"1", b"geo"]);
        assert!(matches!(
            parse_worker_message(&buf),
            Err(ProtocolError::WrongSize {
                kind: "RESPONSE",
                got: 6
            })
        ));
    }

    #[test]
    fn response_bad_timestamp_rejected() {
        let buf = frame(&[b"RESPONSE", b"1.0", b"soon", b"1", b"geo", b""]);
        assert!(matches!(
            parse_worker_message(&buf),
            Err(ProtocolError::Malformed {
                kind: "RESPONSE",
                ..
            })
        ));
    }

    #[test]
    fn unknown_message_type_rejected() {
        let buf = frame(&[b"PING", b"1.0"]);
        assert!(matches!(
            parse_worker_message(&buf),
            Err(ProtocolError::UnknownMessageType(t)) if t == "PING"
        ));
    }

    #[test]
    fn augment_roundtrip() {
        let agents: BTreeSet<String> = ["bidder-a", "bidder-b"]
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut buf = Vec::new();
        encode_augment(
            "geo",
            &AuctionId::from(7),
            "openrtb",
            r#"{"imp":[]}"#,
            &agents,
            1000.25,
            &mut buf,
        )
        .unwrap();

        let parts = decode_parts(&buf).unwrap();
        assert_eq!(parts.len(), 8);
        assert_eq!(parts[0], b"AUGMENT");
        assert_eq!(parts[1], b"1.0");
        assert_eq!(parts[2], b"geo");
        assert_eq!(parts[3], b"7");
        assert_eq!(parts[4], b"openrtb");
        assert_eq!(parts[5], br#"{"imp":[]}"#);
        assert_eq!(decode_agent_set(parts[6]).unwrap(), agents);
        assert_eq!(parts[7], b"1000.250000");
    }

    #[test]
    fn config_ok_encoding() {
        let mut buf = Vec::new();
        encode_config_ok(&mut buf);
        let parts = decode_parts(&buf).unwrap();
        assert_eq!(parts, vec![&b"CONFIGOK"[..]]);
    }
}
