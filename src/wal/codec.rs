//! Versioned blob codec.
//!
//! A blob is a 2-byte little-endian schema id followed by the encoded event
//! list; schemas 3 and above gzip the body. The current schema (6) encodes
//! events as field-tagged CBOR maps. Readers accept schemas 1–6, upgrading
//! legacy field layouts to the current event shape; writers only emit 6.
//!
//! Truncated bodies are soft failures: the events decoded so far are
//! returned, since a blob observed mid-upload may well be complete on the
//! next pull.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use md5::{Digest, Md5};
use minicbor::{Decoder, Encoder};

use super::CodecError;
use crate::core::{Event, EventKind, ItemKey, LineFriends, ReplicaId};

pub const LATEST_WAL_SCHEMA: u16 = 6;

/// Hex md5 of a blob's full payload, schema prefix included. The checksum
/// IS the blob's content identifier and file name stem.
pub fn checksum_hex(bytes: &[u8]) -> String {
    let digest = Md5::digest(bytes);
    let mut out = String::with_capacity(32);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Encode a log into a current-schema blob.
pub fn build_blob(events: &[Event]) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::new();
    let mut enc = Encoder::new(&mut body);
    enc.array(events.len() as u64)?;
    for e in events {
        encode_event(&mut enc, e)?;
    }

    let mut payload = Vec::new();
    payload.extend_from_slice(&LATEST_WAL_SCHEMA.to_le_bytes());
    let mut gz = GzEncoder::new(&mut payload, Compression::default());
    gz.write_all(&body)?;
    gz.finish()?;
    Ok(payload)
}

/// Decode a blob of any supported schema into the current event shape.
pub fn read_blob(bytes: &[u8]) -> Result<Vec<Event>, CodecError> {
    if bytes.len() < 2 {
        return Ok(Vec::new());
    }
    let schema = u16::from_le_bytes([bytes[0], bytes[1]]);
    let body = &bytes[2..];

    match schema {
        1 | 2 => Ok(decode_fixed_records(body)),
        3 => Ok(decode_fixed_records(&gunzip_soft(body))),
        4 => Ok(decode_cbor_legacy(&gunzip_soft(body), true)),
        5 => Ok(decode_cbor_legacy(&gunzip_soft(body), false)),
        6 => Ok(decode_cbor_current(&gunzip_soft(body))),
        other => Err(CodecError::UnsupportedSchema(other)),
    }
}

/// Decompress as much of a gzip stream as is available. A truncated stream
/// yields the prefix that made it through.
fn gunzip_soft(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut decoder = GzDecoder::new(body);
    let mut chunk = [0u8; 8192];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) => {
                tracing::debug!("gzip stream ended early: {e}");
                break;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Schema 6 (current): field-tagged CBOR maps
// ---------------------------------------------------------------------------

fn encode_event(
    enc: &mut Encoder<&mut Vec<u8>>,
    e: &Event,
) -> Result<(), minicbor::encode::Error<std::convert::Infallible>> {
    let mut len = 7;
    if e.note.is_some() {
        len += 1;
    }
    enc.map(len)?;

    enc.str("friends")?;
    enc.map(3)?;
    enc.str("emails")?;
    enc.array(e.friends.emails.len() as u64)?;
    for email in &e.friends.emails {
        enc.str(email)?;
    }
    enc.str("offset")?;
    enc.i32(e.friends.offset)?;
    enc.str("processed")?;
    enc.bool(e.friends.processed)?;

    enc.str("item_key")?;
    enc.str(e.item_key.as_str())?;

    enc.str("kind")?;
    enc.str(e.kind.as_str())?;

    enc.str("lamport")?;
    enc.i64(e.lamport)?;

    enc.str("line")?;
    enc.str(&e.line)?;

    if let Some(note) = &e.note {
        enc.str("note")?;
        enc.bytes(note)?;
    }

    enc.str("replica")?;
    enc.u32(e.replica.as_u32())?;

    enc.str("target_key")?;
    enc.str(e.target_key.as_str())?;

    Ok(())
}

fn decode_cbor_current(body: &[u8]) -> Vec<Event> {
    let mut events = Vec::new();
    let mut dec = Decoder::new(body);
    let Ok(Some(count)) = dec.array() else {
        return events;
    };
    for _ in 0..count {
        match decode_event_map(&mut dec) {
            Ok(e) => events.push(e),
            Err(e) => {
                tracing::debug!("event body ended early: {e}");
                break;
            }
        }
    }
    events
}

fn decode_event_map(dec: &mut Decoder<'_>) -> Result<Event, minicbor::decode::Error> {
    let map_len = dec
        .map()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite map"))?;

    let mut replica = ReplicaId::default();
    let mut lamport = 0i64;
    let mut kind = EventKind::Null;
    let mut item_key = ItemKey::absent();
    let mut target_key = ItemKey::absent();
    let mut line = String::new();
    let mut note = None;
    let mut friends = LineFriends::default();

    for _ in 0..map_len {
        let key = dec.str()?;
        match key {
            "friends" => friends = decode_friends_map(dec)?,
            "item_key" => item_key = ItemKey::from(dec.str()?),
            "kind" => {
                let raw = dec.str()?;
                kind = EventKind::parse(raw)
                    .ok_or_else(|| minicbor::decode::Error::message("unknown event kind"))?;
            }
            "lamport" => lamport = dec.i64()?,
            "line" => line = dec.str()?.to_string(),
            "note" => note = Some(dec.bytes()?.to_vec()),
            "replica" => replica = ReplicaId(dec.u32()?),
            "target_key" => target_key = ItemKey::from(dec.str()?),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(Event {
        replica,
        lamport,
        kind,
        item_key,
        target_key,
        line,
        note,
        friends,
    })
}

fn decode_friends_map(dec: &mut Decoder<'_>) -> Result<LineFriends, minicbor::decode::Error> {
    let map_len = dec
        .map()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite map"))?;
    let mut friends = LineFriends::default();
    for _ in 0..map_len {
        match dec.str()? {
            "emails" => {
                let count = dec
                    .array()?
                    .ok_or_else(|| minicbor::decode::Error::message("indefinite array"))?;
                for _ in 0..count {
                    friends.emails.push(dec.str()?.to_string());
                }
            }
            "offset" => friends.offset = dec.i32()?,
            "processed" => friends.processed = dec.bool()?,
            _ => {
                dec.skip()?;
            }
        }
    }
    Ok(friends)
}

// ---------------------------------------------------------------------------
// Schemas 4–5: CBOR with the pre-Lamport field set
// ---------------------------------------------------------------------------

// Legacy events carried wall-clock timestamps and split uuid/creation-time
// identities. The upgrade path reconstructs `item_key` from
// `<uuid>:<creation_ts>` and takes the old `event_time` as the Lamport
// value. Schema 4 stored the share set as a CBOR map keyed by email;
// schema 5 switched to a sorted array.
fn decode_cbor_legacy(body: &[u8], emails_as_map: bool) -> Vec<Event> {
    let mut events = Vec::new();
    let mut dec = Decoder::new(body);
    let Ok(Some(count)) = dec.array() else {
        return events;
    };
    for _ in 0..count {
        match decode_legacy_map(&mut dec, emails_as_map) {
            Ok(e) => events.push(e),
            Err(e) => {
                tracing::debug!("legacy event body ended early: {e}");
                break;
            }
        }
    }
    events
}

fn decode_legacy_map(
    dec: &mut Decoder<'_>,
    emails_as_map: bool,
) -> Result<Event, minicbor::decode::Error> {
    let map_len = dec
        .map()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite map"))?;

    let mut uuid = 0u32;
    let mut target_uuid = 0u32;
    let mut creation_ts = 0i64;
    let mut target_creation_ts = 0i64;
    let mut event_time = 0i64;
    let mut event_type = 0u16;
    let mut line = String::new();
    let mut note = None;
    let mut friends = LineFriends::default();

    for _ in 0..map_len {
        match dec.str()? {
            "uuid" => uuid = dec.u32()?,
            "target_uuid" => target_uuid = dec.u32()?,
            "creation_ts" => creation_ts = dec.i64()?,
            "target_creation_ts" => target_creation_ts = dec.i64()?,
            "event_time" => event_time = dec.i64()?,
            "event_type" => event_type = dec.u16()?,
            "line" => line = dec.str()?.to_string(),
            "note" => note = Some(dec.bytes()?.to_vec()),
            "friends" => {
                friends = decode_legacy_friends(dec, emails_as_map)?;
            }
            _ => {
                dec.skip()?;
            }
        }
    }

    let kind = EventKind::from_u16(event_type)
        .ok_or_else(|| minicbor::decode::Error::message("unknown event type"))?;

    Ok(Event {
        replica: ReplicaId(uuid),
        lamport: event_time,
        kind,
        item_key: ItemKey::from(format!("{uuid}:{creation_ts}").as_str()),
        target_key: ItemKey::from(format!("{target_uuid}:{target_creation_ts}").as_str()),
        line,
        note,
        friends,
    })
}

fn decode_legacy_friends(
    dec: &mut Decoder<'_>,
    emails_as_map: bool,
) -> Result<LineFriends, minicbor::decode::Error> {
    let map_len = dec
        .map()?
        .ok_or_else(|| minicbor::decode::Error::message("indefinite map"))?;
    let mut friends = LineFriends::default();
    for _ in 0..map_len {
        match dec.str()? {
            "emails" => {
                if emails_as_map {
                    let count = dec
                        .map()?
                        .ok_or_else(|| minicbor::decode::Error::message("indefinite map"))?;
                    for _ in 0..count {
                        friends.emails.push(dec.str()?.to_string());
                        dec.skip()?;
                    }
                    friends.emails.sort();
                } else {
                    let count = dec
                        .array()?
                        .ok_or_else(|| minicbor::decode::Error::message("indefinite array"))?;
                    for _ in 0..count {
                        friends.emails.push(dec.str()?.to_string());
                    }
                }
            }
            "offset" => friends.offset = dec.i32()?,
            "processed" => friends.processed = dec.bool()?,
            _ => {
                dec.skip()?;
            }
        }
    }
    Ok(friends)
}

// ---------------------------------------------------------------------------
// Schemas 1–3: fixed-width little-endian records
// ---------------------------------------------------------------------------

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64_le(&mut self) -> Option<i64> {
        self.take(8).map(|b| {
            i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    fn u64_le(&mut self) -> Option<u64> {
        self.take(8).map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }
}

// Record layout: uuid u32, target_uuid u32, creation_ts i64,
// target_creation_ts i64, event_time i64, event_type u16, line_len u64,
// note_exists u8, note_len u64, then line and note bytes.
fn decode_fixed_records(body: &[u8]) -> Vec<Event> {
    let mut events = Vec::new();
    let mut reader = ByteReader::new(body);

    while !reader.is_empty() {
        let Some(event) = decode_fixed_record(&mut reader) else {
            // Mid-record truncation; keep what we have.
            break;
        };
        events.push(event);
    }
    events
}

fn decode_fixed_record(reader: &mut ByteReader<'_>) -> Option<Event> {
    let uuid = reader.u32_le()?;
    let target_uuid = reader.u32_le()?;
    let creation_ts = reader.i64_le()?;
    let target_creation_ts = reader.i64_le()?;
    let event_time = reader.i64_le()?;
    let event_type = reader.u16_le()?;
    let line_len = reader.u64_le()?;
    let note_exists = reader.u8()? != 0;
    let note_len = reader.u64_le()?;

    let kind = EventKind::from_u16(event_type)?;
    let line_bytes = reader.take(usize::try_from(line_len).ok()?)?;
    let line = String::from_utf8_lossy(line_bytes).into_owned();

    let note = if note_len > 0 {
        Some(reader.take(usize::try_from(note_len).ok()?)?.to_vec())
    } else if note_exists {
        Some(Vec::new())
    } else {
        None
    };

    Some(Event {
        replica: ReplicaId(uuid),
        lamport: event_time,
        kind,
        item_key: ItemKey::from(format!("{uuid}:{creation_ts}").as_str()),
        target_key: ItemKey::from(format!("{target_uuid}:{target_creation_ts}").as_str()),
        line,
        note,
        friends: LineFriends::default(),
    })
}
