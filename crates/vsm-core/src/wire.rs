//! Crate-local binary wire codec for [`Event`]. Not claimed to be
//! compatible with any external encoder or a prior protocol version — a
//! version byte is carried so a future incompatible layout can be rejected
//! rather than silently misparsed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use vsm_types::{EventId, NodeId, Subsystem};

use crate::clock::HlcTimestamp;
use crate::error::CoreError;
use crate::event::{Event, Payload};

const WIRE_VERSION: u8 = 1;

fn subsystem_tag(subsystem: Subsystem) -> u8 {
    match subsystem {
        Subsystem::S1 => 0,
        Subsystem::S2 => 1,
        Subsystem::S3 => 2,
        Subsystem::S4 => 3,
        Subsystem::S5 => 4,
        Subsystem::Algedonic => 5,
        Subsystem::Unknown => 6,
    }
}

fn subsystem_from_tag(tag: u8) -> Result<Subsystem, CoreError> {
    match tag {
        0 => Ok(Subsystem::S1),
        1 => Ok(Subsystem::S2),
        2 => Ok(Subsystem::S3),
        3 => Ok(Subsystem::S4),
        4 => Ok(Subsystem::S5),
        5 => Ok(Subsystem::Algedonic),
        6 => Ok(Subsystem::Unknown),
        other => Err(CoreError::Serialization(format!("unknown subsystem tag {other}"))),
    }
}

/// Encodes `event` as: version, HLC (physical/logical/node_id), subsystem
/// tag, event-type tag (length-prefixed UTF-8), urgency, valence, payload
/// length, payload bytes (JSON).
pub fn encode(event: &Event) -> Result<Bytes, CoreError> {
    let payload_bytes = serde_json::to_vec(&event.payload)?;
    let type_bytes = event.event_type.as_bytes();

    let mut buf = BytesMut::with_capacity(64 + type_bytes.len() + payload_bytes.len());
    buf.put_u8(WIRE_VERSION);
    buf.put_u128(event.id.0.as_u128());
    buf.put_u64(event.timestamp.physical);
    buf.put_u32(event.timestamp.logical);
    buf.put_u16(event.timestamp.node_id.0);
    buf.put_u8(subsystem_tag(event.subsystem));
    buf.put_u16(type_bytes.len() as u16);
    buf.put_slice(type_bytes);
    buf.put_f64(event.urgency());
    buf.put_f64(event.valence());
    buf.put_u32(payload_bytes.len() as u32);
    buf.put_slice(&payload_bytes);
    Ok(buf.freeze())
}

/// Decodes an [`Event`] previously produced by [`encode`]. Rejects a
/// version mismatch outright rather than attempting best-effort parsing.
pub fn decode(mut bytes: Bytes) -> Result<Event, CoreError> {
    if bytes.is_empty() {
        return Err(CoreError::Serialization("empty wire buffer".into()));
    }
    let version = bytes.get_u8();
    if version != WIRE_VERSION {
        return Err(CoreError::Serialization(format!(
            "unsupported wire version {version}, expected {WIRE_VERSION}"
        )));
    }
    if bytes.remaining() < 16 + 8 + 4 + 2 + 1 + 2 {
        return Err(CoreError::Serialization("truncated wire buffer".into()));
    }
    let id = EventId(uuid::Uuid::from_u128(bytes.get_u128()));
    let physical = bytes.get_u64();
    let logical = bytes.get_u32();
    let node_id = NodeId(bytes.get_u16());
    let timestamp = HlcTimestamp { physical, logical, node_id };
    let subsystem = subsystem_from_tag(bytes.get_u8())?;

    let type_len = bytes.get_u16() as usize;
    if bytes.remaining() < type_len {
        return Err(CoreError::Serialization("truncated event_type field".into()));
    }
    let event_type = String::from_utf8(bytes.copy_to_bytes(type_len).to_vec())
        .map_err(|e| CoreError::Serialization(e.to_string()))?;

    if bytes.remaining() < 8 + 8 + 4 {
        return Err(CoreError::Serialization("truncated numeric fields".into()));
    }
    let urgency = bytes.get_f64();
    let valence = bytes.get_f64();
    let payload_len = bytes.get_u32() as usize;
    if bytes.remaining() < payload_len {
        return Err(CoreError::Serialization("truncated payload".into()));
    }
    let payload_bytes = bytes.copy_to_bytes(payload_len);
    let payload: Payload = serde_json::from_slice(&payload_bytes)?;

    Ok(Event::new(id, timestamp, event_type, subsystem, urgency, valence, payload))
}
