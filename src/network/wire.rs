//! Tactical event (CoT) XML envelope codec for federation traffic.
//!
//! Envelope grammar: one `<event>` root carrying a `<point>` and a `<detail>` element.
//! Stream framing: envelopes are written back-to-back; the reader resynchronizes on the
//! closing `</event>` tag and keeps any trailing partial envelope for the next read.
//! Datagram framing: exactly one complete envelope per datagram.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::types::{ChangeKind, MissionChange};

/// Maximum allowed size of a single buffered envelope (4MB)
pub const DEFAULT_MAX_ENVELOPE_SIZE: usize = 4 * 1024 * 1024;

/// CoT type for a mission content change
pub const MISSION_CHANGE_TYPE: &str = "t-x-m-c";
/// CoT type for a contact/ping assertion
pub const HEARTBEAT_TYPE: &str = "t-x-c-t";

const EVENT_CLOSE: &[u8] = b"</event>";
const STALE_SECS: i64 = 60;
const POINT: &str =
    r#"<point lat="0.0" lon="0.0" hae="0.0" ce="9999999.0" le="9999999.0"/>"#;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Malformed envelope: {0}")]
    Malformed(String),
    #[error("Incomplete envelope")]
    Incomplete,
    #[error("Unexpected root element <{0}>")]
    UnexpectedRoot(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("Envelope too large: {size} bytes buffered without a boundary (max: {max})")]
    EnvelopeTooLarge { size: usize, max: usize },
    #[error("Datagram too large: {size} bytes (max: {max})")]
    DatagramTooLarge { size: usize, max: usize },
}

/// Liveness assertion sent on the heartbeat interval.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    pub fn now(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A decoded envelope, classified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    MissionChange(MissionChange),
    Heartbeat(Heartbeat),
    /// Any other tactical event; relayed as raw bytes when CoT sync is enabled
    Other { uid: String, cot_type: String },
}

/// A decoded envelope together with the exact bytes it was decoded from.
#[derive(Clone, Debug)]
pub struct DecodedEnvelope {
    pub envelope: Envelope,
    pub raw: Bytes,
}

/// Whether a datagram payload fits below the fragmentation threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatagramFit {
    Safe,
    FragmentationRisk,
}

/// Check an encoded payload against the datagram limits. A payload exactly at `max_size`
/// is accepted; one byte over is rejected before any transmit attempt.
pub fn check_datagram_size(
    len: usize,
    safe_size: usize,
    max_size: usize,
) -> Result<DatagramFit, WireError> {
    if len > max_size {
        Err(WireError::DatagramTooLarge {
            size: len,
            max: max_size,
        })
    } else if len > safe_size {
        Ok(DatagramFit::FragmentationRisk)
    } else {
        Ok(DatagramFit::Safe)
    }
}

fn format_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, WireError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| WireError::InvalidTimestamp(format!("{}: {}", s, e)))
}

fn event_open(uid: &str, cot_type: &str, ts: &DateTime<Utc>) -> String {
    let time = format_time(ts);
    let stale = format_time(&(*ts + Duration::seconds(STALE_SECS)));
    format!(
        r#"<event version="2.0" uid="{}" type="{}" how="h-g-i-g-o" time="{}" start="{}" stale="{}">"#,
        escape(uid),
        escape(cot_type),
        time,
        time,
        stale
    )
}

/// Serialize a mission change into a self-delimited envelope.
pub fn encode_mission_change(change: &MissionChange) -> Vec<u8> {
    let mut xml = event_open(&change.change_id, MISSION_CHANGE_TYPE, &change.timestamp);
    xml.push_str(POINT);
    xml.push_str(&format!(
        r#"<detail><mission type="CHANGE" tool="public" name="{}" authorUid="{}"><MissionChanges><MissionChange>"#,
        escape(&change.mission_name),
        escape(&change.creator_uid)
    ));
    xml.push_str(&format!(
        "<changeUid>{}</changeUid><creatorUid>{}</creatorUid><missionName>{}</missionName><timestamp>{}</timestamp><type>{}</type><payload>{}</payload>",
        escape(&change.change_id),
        escape(&change.creator_uid),
        escape(&change.mission_name),
        format_time(&change.timestamp),
        escape(change.kind.as_str()),
        escape(&change.payload)
    ));
    xml.push_str("</MissionChange></MissionChanges></mission></detail></event>");
    xml.into_bytes()
}

/// Serialize a heartbeat. Same grammar as data events so framing is indistinguishable.
pub fn encode_heartbeat(heartbeat: &Heartbeat) -> Vec<u8> {
    let uid = format!("{}-ping", heartbeat.node_id);
    let mut xml = event_open(&uid, HEARTBEAT_TYPE, &heartbeat.timestamp);
    xml.push_str(POINT);
    xml.push_str(&format!(
        r#"<detail><contact callsign="{}"/><__federation nodeId="{}"/></detail></event>"#,
        escape(&heartbeat.node_id),
        escape(&heartbeat.node_id)
    ));
    xml.into_bytes()
}

pub fn encode(envelope: &Envelope) -> Vec<u8> {
    match envelope {
        Envelope::MissionChange(change) => encode_mission_change(change),
        Envelope::Heartbeat(hb) => encode_heartbeat(hb),
        Envelope::Other { uid, cot_type } => {
            let mut xml = event_open(uid, cot_type, &Utc::now());
            xml.push_str(POINT);
            xml.push_str("<detail/></event>");
            xml.into_bytes()
        }
    }
}

/// Decode exactly one complete envelope (datagram mode).
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| WireError::Malformed(format!("not UTF-8: {}", e)))?;
    let trimmed = text.trim();
    if trimmed.is_empty() || !trimmed.as_bytes().ends_with(EVENT_CLOSE) {
        return Err(WireError::Incomplete);
    }
    let root = parse_element_tree(trimmed)?;
    recognize(root)
}

/// Decode a single datagram, keeping the raw bytes for relay.
pub fn decode_datagram(datagram: &[u8]) -> Result<DecodedEnvelope, WireError> {
    let envelope = decode_envelope(datagram)?;
    Ok(DecodedEnvelope {
        envelope,
        raw: Bytes::copy_from_slice(datagram),
    })
}

/// Accumulating decoder for stream transports.
pub struct StreamDecoder {
    buf: BytesMut,
    max_envelope_size: usize,
    /// Bytes already searched for a close tag
    scanned: usize,
}

impl StreamDecoder {
    pub fn new(max_envelope_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            max_envelope_size,
            scanned: 0,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held back as a partial envelope.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Yield the next complete envelope, if one is buffered. A malformed envelope is
    /// consumed and returned as an error so the caller can log and continue.
    pub fn next_envelope(&mut self) -> Option<Result<DecodedEnvelope, WireError>> {
        // resume where the last search stopped, minus a tag that may straddle the edge
        let from = self
            .scanned
            .saturating_sub(EVENT_CLOSE.len() - 1)
            .min(self.buf.len());
        match find_subslice(&self.buf[from..], EVENT_CLOSE) {
            Some(pos) => {
                let unit = self.buf.split_to(from + pos + EVENT_CLOSE.len()).freeze();
                self.scanned = 0;
                let start = unit
                    .iter()
                    .position(|b| !b.is_ascii_whitespace())
                    .unwrap_or(unit.len());
                let raw = unit.slice(start..);
                Some(decode_envelope(&raw).map(|envelope| DecodedEnvelope { envelope, raw }))
            }
            None if self.buf.len() > self.max_envelope_size => {
                let size = self.buf.len();
                self.buf.clear();
                self.scanned = 0;
                Some(Err(WireError::EnvelopeTooLarge {
                    size,
                    max: self.max_envelope_size,
                }))
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, WireError> {
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| WireError::Malformed(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| WireError::Malformed(e.to_string()))?
                .into_owned();
            attrs.push((key, value));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attrs,
            ..Default::default()
        })
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }
}

fn parse_element_tree(xml: &str) -> Result<Element, WireError> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| WireError::Malformed(e.to_string()))?;
        match event {
            Event::Start(start) => {
                if root.is_some() {
                    return Err(WireError::Malformed("data after root element".to_string()));
                }
                stack.push(Element::from_start(&start)?);
            }
            Event::Empty(start) => {
                let element = Element::from_start(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None if root.is_none() => root = Some(element),
                    None => {
                        return Err(WireError::Malformed("multiple root elements".to_string()))
                    }
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| WireError::Malformed("unbalanced end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Text(text) => match stack.last_mut() {
                Some(current) => {
                    let unescaped = text
                        .unescape()
                        .map_err(|e| WireError::Malformed(e.to_string()))?;
                    current.text.push_str(&unescaped);
                }
                None => {
                    if !text.iter().all(|b| b.is_ascii_whitespace()) {
                        return Err(WireError::Malformed(
                            "text outside root element".to_string(),
                        ));
                    }
                }
            },
            Event::CData(cdata) => {
                if let Some(current) = stack.last_mut() {
                    let inner = cdata.into_inner();
                    let s = std::str::from_utf8(&inner)
                        .map_err(|e| WireError::Malformed(e.to_string()))?;
                    current.text.push_str(s);
                }
            }
            Event::Eof => break,
            // declarations, comments, processing instructions
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(WireError::Incomplete);
    }
    root.ok_or(WireError::Incomplete)
}

fn recognize(root: Element) -> Result<Envelope, WireError> {
    if root.name != "event" {
        return Err(WireError::UnexpectedRoot(root.name));
    }
    let uid = root.attr("uid").ok_or(WireError::MissingField("uid"))?;
    let cot_type = root.attr("type").ok_or(WireError::MissingField("type"))?;
    let detail = root.child("detail");

    match cot_type {
        MISSION_CHANGE_TYPE => {
            let mission = detail
                .and_then(|d| d.child("mission"))
                .ok_or(WireError::MissingField("detail/mission"))?;
            let change = mission
                .child("MissionChanges")
                .and_then(|c| c.child("MissionChange"))
                .ok_or(WireError::MissingField("MissionChanges/MissionChange"))?;

            let mission_name = change
                .child_text("missionName")
                .or_else(|| mission.attr("name"))
                .filter(|name| !name.is_empty())
                .ok_or(WireError::MissingField("missionName"))?;
            let kind = change
                .child_text("type")
                .ok_or(WireError::MissingField("type"))?;
            let timestamp = match change.child_text("timestamp") {
                Some(ts) => parse_time(ts)?,
                None => parse_time(root.attr("time").ok_or(WireError::MissingField("time"))?)?,
            };

            Ok(Envelope::MissionChange(MissionChange {
                change_id: change.child_text("changeUid").unwrap_or(uid).to_string(),
                mission_name: mission_name.to_string(),
                kind: ChangeKind::parse(kind),
                creator_uid: change
                    .child_text("creatorUid")
                    .or_else(|| mission.attr("authorUid"))
                    .unwrap_or_default()
                    .to_string(),
                timestamp,
                payload: change.child_text("payload").unwrap_or_default().to_string(),
            }))
        }
        HEARTBEAT_TYPE => {
            let node_id = detail
                .and_then(|d| {
                    d.child("__federation")
                        .and_then(|f| f.attr("nodeId"))
                        .or_else(|| d.child("contact").and_then(|c| c.attr("callsign")))
                })
                .ok_or(WireError::MissingField("nodeId"))?;
            let timestamp = parse_time(root.attr("time").ok_or(WireError::MissingField("time"))?)?;
            Ok(Envelope::Heartbeat(Heartbeat {
                node_id: node_id.to_string(),
                timestamp,
            }))
        }
        other => Ok(Envelope::Other {
            uid: uid.to_string(),
            cot_type: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_change(id: &str, payload: &str) -> MissionChange {
        MissionChange {
            change_id: id.to_string(),
            mission_name: "Training-Alpha".to_string(),
            kind: ChangeKind::AddContent,
            creator_uid: "ANDROID-1234".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap()
                + Duration::nanoseconds(123_456_789),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_mission_change_roundtrip_datagram() {
        let change = sample_change("chg-1", r#"{"hash":"abc","name":"a & b <c>"}"#);
        let bytes = encode_mission_change(&change);
        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded, Envelope::MissionChange(change));
    }

    #[test]
    fn test_heartbeat_roundtrip_stream() {
        let hb = Heartbeat {
            node_id: "fed-node-1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        };
        let mut decoder = StreamDecoder::new(DEFAULT_MAX_ENVELOPE_SIZE);
        decoder.extend(&encode_heartbeat(&hb));
        let decoded = decoder.next_envelope().unwrap().unwrap();
        assert_eq!(decoded.envelope, Envelope::Heartbeat(hb));
        assert!(decoder.next_envelope().is_none());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_heartbeat_roundtrip_datagram() {
        let hb = Heartbeat {
            node_id: "fed-node-1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        };
        let bytes = encode_heartbeat(&hb);
        let decoded = decode_datagram(&bytes).unwrap();
        assert_eq!(decoded.envelope, Envelope::Heartbeat(hb));
        assert_eq!(&decoded.raw[..], &bytes[..]);
    }

    #[test]
    fn test_large_envelope_in_small_chunks() {
        let payload = "x".repeat(3 * 1024 * 1024);
        let change = sample_change("chg-big", &payload);
        let bytes = encode_mission_change(&change);

        let mut decoder = StreamDecoder::new(DEFAULT_MAX_ENVELOPE_SIZE);
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(8192) {
            decoder.extend(chunk);
            while let Some(result) = decoder.next_envelope() {
                decoded.push(result.unwrap());
            }
            if decoded.is_empty() {
                // each read searches only what arrived since the last one
                assert_eq!(decoder.scanned, decoder.buffered());
            }
        }

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].envelope, Envelope::MissionChange(change));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_close_tag_split_across_reads() {
        let first = sample_change("chg-1", "one");
        let second = sample_change("chg-2", "two");
        let mut bytes = encode_mission_change(&first);
        bytes.extend_from_slice(&encode_mission_change(&second));

        // every split point, including ones inside either close tag
        for cut in 1..bytes.len() {
            let mut decoder = StreamDecoder::new(DEFAULT_MAX_ENVELOPE_SIZE);
            let mut ids = Vec::new();
            for part in [&bytes[..cut], &bytes[cut..]] {
                for piece in part.chunks(3) {
                    decoder.extend(piece);
                    while let Some(result) = decoder.next_envelope() {
                        if let Envelope::MissionChange(c) = result.unwrap().envelope {
                            ids.push(c.change_id);
                        }
                    }
                }
            }
            assert_eq!(ids, vec!["chg-1", "chg-2"], "cut at {}", cut);
        }
    }

    #[test]
    fn test_back_to_back_envelopes_in_one_chunk() {
        let first = sample_change("chg-1", "one");
        let second = sample_change("chg-2", "two");
        let mut chunk = encode_mission_change(&first);
        chunk.extend_from_slice(b"\n");
        chunk.extend_from_slice(&encode_mission_change(&second));

        let mut decoder = StreamDecoder::new(DEFAULT_MAX_ENVELOPE_SIZE);
        decoder.extend(&chunk);
        let a = decoder.next_envelope().unwrap().unwrap();
        let b = decoder.next_envelope().unwrap().unwrap();
        assert_eq!(a.envelope, Envelope::MissionChange(first));
        assert_eq!(b.envelope, Envelope::MissionChange(second));
        assert!(decoder.next_envelope().is_none());
    }

    #[test]
    fn test_partial_envelope_is_retained() {
        let change = sample_change("chg-9", "split");
        let bytes = encode_mission_change(&change);
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        let mut decoder = StreamDecoder::new(DEFAULT_MAX_ENVELOPE_SIZE);
        decoder.extend(head);
        assert!(decoder.next_envelope().is_none());
        assert_eq!(decoder.buffered(), head.len());

        decoder.extend(tail);
        let decoded = decoder.next_envelope().unwrap().unwrap();
        assert_eq!(decoded.envelope, Envelope::MissionChange(change));
    }

    #[test]
    fn test_payload_containing_close_tag_does_not_split() {
        let change = sample_change("chg-x", "</event><event>");
        let mut decoder = StreamDecoder::new(DEFAULT_MAX_ENVELOPE_SIZE);
        decoder.extend(&encode_mission_change(&change));
        let decoded = decoder.next_envelope().unwrap().unwrap();
        assert_eq!(decoded.envelope, Envelope::MissionChange(change));
    }

    #[test]
    fn test_malformed_stream_unit_does_not_poison_following_unit() {
        let good = sample_change("chg-ok", "fine");
        let mut chunk = b"<event uid=\"x\"><broken></event>".to_vec();
        chunk.extend_from_slice(&encode_mission_change(&good));

        let mut decoder = StreamDecoder::new(DEFAULT_MAX_ENVELOPE_SIZE);
        decoder.extend(&chunk);
        assert!(decoder.next_envelope().unwrap().is_err());
        let decoded = decoder.next_envelope().unwrap().unwrap();
        assert_eq!(decoded.envelope, Envelope::MissionChange(good));
    }

    #[test]
    fn test_incomplete_datagram_is_distinct_error() {
        let bytes = encode_mission_change(&sample_change("chg-1", "x"));
        let truncated = &bytes[..bytes.len() - 10];
        assert_eq!(decode_envelope(truncated), Err(WireError::Incomplete));
    }

    #[test]
    fn test_oversize_buffer_is_discarded() {
        let mut decoder = StreamDecoder::new(64);
        decoder.extend(&[b'a'; 65]);
        match decoder.next_envelope() {
            Some(Err(WireError::EnvelopeTooLarge { size, max })) => {
                assert_eq!(size, 65);
                assert_eq!(max, 64);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_other_event_is_recognized() {
        let xml = br#"<event version="2.0" uid="ANDROID-1" type="a-f-G-U-C" how="m-g" time="2024-01-01T00:00:00Z" start="2024-01-01T00:00:00Z" stale="2024-01-01T00:01:00Z"><point lat="1" lon="2" hae="0" ce="1" le="1"/><detail><contact callsign="ALPHA"/></detail></event>"#;
        let decoded = decode_datagram(xml).unwrap();
        assert_eq!(
            decoded.envelope,
            Envelope::Other {
                uid: "ANDROID-1".to_string(),
                cot_type: "a-f-G-U-C".to_string()
            }
        );
        assert_eq!(&decoded.raw[..], &xml[..]);
    }

    #[test]
    fn test_mission_change_without_type_is_rejected() {
        let xml = br#"<event version="2.0" uid="u" type="t-x-m-c" time="2024-01-01T00:00:00Z"><detail><mission name="m"><MissionChanges><MissionChange><missionName>m</missionName></MissionChange></MissionChanges></mission></detail></event>"#;
        assert_eq!(decode_envelope(xml), Err(WireError::MissingField("type")));
    }

    #[test]
    fn test_datagram_size_boundaries() {
        assert_eq!(check_datagram_size(1400, 1400, 65507), Ok(DatagramFit::Safe));
        assert_eq!(
            check_datagram_size(1401, 1400, 65507),
            Ok(DatagramFit::FragmentationRisk)
        );
        assert_eq!(
            check_datagram_size(65507, 1400, 65507),
            Ok(DatagramFit::FragmentationRisk)
        );
        assert_eq!(
            check_datagram_size(65508, 1400, 65507),
            Err(WireError::DatagramTooLarge {
                size: 65508,
                max: 65507
            })
        );
    }
}
