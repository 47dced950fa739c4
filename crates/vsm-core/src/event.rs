use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use vsm_types::{EventId, Subsystem};

use crate::clock::HlcTimestamp;
use crate::numeric::clamp;

/// Opaque auxiliary fields carried on an event: severity, effectiveness,
/// `caused_by`, `trigger`, `new_state`, metric values, and so on. Kept as a
/// map rather than a fixed struct — the catalog of fields is open-ended and
/// detector-specific (spec §3).
pub type Payload = HashMap<String, serde_json::Value>;

/// Immutable event record (spec §3). Constructed once at ingest and never
/// mutated afterward; the Store only ever hands out shared references.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: HlcTimestamp,
    /// Application-defined type tag, e.g. `"error"`, `"metric"`, `"state_change"`.
    pub event_type: String,
    pub subsystem: Subsystem,
    /// `[0,1]`, default 0.
    urgency: f64,
    /// `[-1,1]`, sign distinguishes pain from pleasure. Default 0.
    valence: f64,
    pub payload: Payload,
}

impl Event {
    /// Builds an event with urgency and valence clamped into their legal
    /// ranges (I5), so a malformed producer input can never violate the
    /// invariant downstream.
    pub fn new(
        id: EventId,
        timestamp: HlcTimestamp,
        event_type: impl Into<String>,
        subsystem: Subsystem,
        urgency: f64,
        valence: f64,
        payload: Payload,
    ) -> Self {
        Self {
            id,
            timestamp,
            event_type: event_type.into(),
            subsystem,
            urgency: clamp(urgency, 0.0, 1.0),
            valence: clamp(valence, -1.0, 1.0),
            payload,
        }
    }

    pub fn urgency(&self) -> f64 {
        self.urgency
    }

    pub fn valence(&self) -> f64 {
        self.valence
    }

    /// Looks up `caused_by` in the payload as an `EventId`, for causal-chain
    /// detectors (`recursive_instability`). `caused_by` is a lookup key, not
    /// an ownership edge — the referenced event may have been evicted.
    pub fn caused_by(&self) -> Option<EventId> {
        self.payload
            .get("caused_by")
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
            .map(EventId)
    }

    /// Numeric metric field used by `statistical_anomaly` and
    /// `control_loop_oscillation` detectors. Returns `None` if absent or
    /// non-numeric.
    pub fn metric(&self, field: &str) -> Option<f64> {
        self.payload.get(field).and_then(|v| v.as_f64())
    }

    pub fn approx_payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map(|v| v.len()).unwrap_or(0)
    }
}

/// Half-open temporal interval `[start, end)` with optional filters (spec §3).
#[derive(Clone, Debug)]
pub struct Window {
    pub start: HlcTimestamp,
    pub end: HlcTimestamp,
    pub subsystem: Option<Subsystem>,
    pub event_type: Option<String>,
    pub min_urgency: Option<f64>,
}

impl Window {
    pub fn new(start: HlcTimestamp, end: HlcTimestamp) -> Self {
        Self {
            start,
            end,
            subsystem: None,
            event_type: None,
            min_urgency: None,
        }
    }

    pub fn with_subsystem(mut self, subsystem: Subsystem) -> Self {
        self.subsystem = Some(subsystem);
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_min_urgency(mut self, min_urgency: f64) -> Self {
        self.min_urgency = Some(min_urgency);
        self
    }

    /// Whether `event` falls in `[start, end)` and matches every configured filter.
    pub fn matches(&self, event: &Event) -> bool {
        if event.timestamp < self.start || event.timestamp >= self.end {
            return false;
        }
        if let Some(subsystem) = self.subsystem {
            if event.subsystem != subsystem {
                return false;
            }
        }
        if let Some(ref event_type) = self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if let Some(min_urgency) = self.min_urgency {
            if event.urgency() < min_urgency {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsm_types::NodeId;

    fn ts(physical: u64) -> HlcTimestamp {
        HlcTimestamp { physical, logical: 0, node_id: NodeId(1) }
    }

    fn sample_event(physical: u64, subsystem: Subsystem, event_type: &str) -> Event {
        Event::new(EventId::new(), ts(physical), event_type, subsystem, 0.5, 0.0, Payload::new())
    }

    #[test]
    fn urgency_and_valence_are_clamped() {
        let e = Event::new(EventId::new(), ts(0), "x", Subsystem::S1, 5.0, -5.0, Payload::new());
        assert_eq!(e.urgency(), 1.0);
        assert_eq!(e.valence(), -1.0);
    }

    #[test]
    fn window_matches_half_open_interval() {
        let window = Window::new(ts(100), ts(200));
        assert!(!window.matches(&sample_event(99, Subsystem::S1, "x")));
        assert!(window.matches(&sample_event(100, Subsystem::S1, "x")));
        assert!(window.matches(&sample_event(199, Subsystem::S1, "x")));
        assert!(!window.matches(&sample_event(200, Subsystem::S1, "x")));
    }

    #[test]
    fn window_filters_by_subsystem_and_type() {
        let window = Window::new(ts(0), ts(1000))
            .with_subsystem(Subsystem::S2)
            .with_event_type("error");
        assert!(!window.matches(&sample_event(10, Subsystem::S1, "error")));
        assert!(!window.matches(&sample_event(10, Subsystem::S2, "metric")));
        assert!(window.matches(&sample_event(10, Subsystem::S2, "error")));
    }

    #[test]
    fn caused_by_parses_payload_reference() {
        let referenced = EventId::new();
        let mut payload = Payload::new();
        payload.insert("caused_by".into(), serde_json::json!(referenced.0.to_string()));
        let e = Event::new(EventId::new(), ts(0), "x", Subsystem::S1, 0.0, 0.0, payload);
        assert_eq!(e.caused_by(), Some(referenced));
    }

    #[test]
    fn caused_by_absent_is_none() {
        let e = sample_event(0, Subsystem::S1, "x");
        assert_eq!(e.caused_by(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let mut payload = Payload::new();
        payload.insert("severity".into(), serde_json::json!(0.9));
        let event = Event::new(EventId::new(), ts(42), "error", Subsystem::S3, 0.8, -0.6, payload);
        let json = serde_json::to_string(&event).unwrap();
        let restored: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, restored.id);
        assert_eq!(event.urgency(), restored.urgency());
    }
}
