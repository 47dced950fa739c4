use serde::{Deserialize, Serialize};

/// Opaque unique identifier for an ingested event.
///
/// Ordered lexicographically on the underlying UUID so two events sharing an
/// HLC timestamp still sort deterministically (spec §4.3 edge case).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub uuid::Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "evt:{}", self.0)
    }
}

/// Node identifier embedded in every HLC timestamp for distributed disambiguation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u16);

/// Subscription identifier returned by `EventBus::subscribe`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub uuid::Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}

/// Name of a registered pattern specification. Newtype over `String` so
/// detector registries and cooldown maps key on something more specific than
/// a bare string at call sites.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatternName(pub String);

impl From<&str> for PatternName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PatternName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for PatternName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_uniqueness() {
        let a = EventId::new();
        let b = EventId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn event_id_serialization() {
        let id = EventId::new();
        let json = serde_json::to_string(&id).unwrap();
        let restored: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, restored);
    }

    #[test]
    fn display_formats() {
        let eid = EventId::new();
        assert!(format!("{}", eid).starts_with("evt:"));

        let sid = SubscriptionId::new();
        assert!(format!("{}", sid).starts_with("sub:"));

        let pn: PatternName = "rate_burst".into();
        assert_eq!(format!("{}", pn), "rate_burst");
    }

    #[test]
    fn event_id_ordering_is_total() {
        let a = EventId::new();
        let b = EventId::new();
        assert!(a < b || b < a || a == b);
    }
}
