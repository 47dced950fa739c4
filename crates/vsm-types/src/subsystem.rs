use serde::{Deserialize, Serialize};

/// The closed set of VSM subsystem routing tags an event can carry.
///
/// Resolves the open question in spec.md §9: the source mixes three
/// inconsistently-used tag sets (`s1..s5`, `:algedonic`, `:unknown`). This is
/// the single canonical set, represented as a sum type so an unhandled
/// variant is a compile error rather than a silent no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// S1 — Operations
    S1,
    /// S2 — Coordination
    S2,
    /// S3 — Control
    S3,
    /// S4 — Intelligence
    S4,
    /// S5 — Policy
    S5,
    /// Algedonic channel — pain/pleasure bypass signals
    Algedonic,
    /// Routing could not classify the event's origin
    Unknown,
}

impl Subsystem {
    /// All VSM operational subsystems in hierarchy order, excluding the
    /// algedonic channel and the unknown fallback.
    pub const OPERATIONAL: [Subsystem; 5] = [
        Subsystem::S1,
        Subsystem::S2,
        Subsystem::S3,
        Subsystem::S4,
        Subsystem::S5,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::S1 => "s1",
            Subsystem::S2 => "s2",
            Subsystem::S3 => "s3",
            Subsystem::S4 => "s4",
            Subsystem::S5 => "s5",
            Subsystem::Algedonic => "algedonic",
            Subsystem::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        for s in [
            Subsystem::S1,
            Subsystem::S2,
            Subsystem::S3,
            Subsystem::S4,
            Subsystem::S5,
            Subsystem::Algedonic,
            Subsystem::Unknown,
        ] {
            let json = serde_json::to_string(&s).unwrap();
            let back: Subsystem = serde_json::from_str(&json).unwrap();
            assert_eq!(s, back);
        }
    }

    #[test]
    fn operational_excludes_algedonic_and_unknown() {
        assert!(!Subsystem::OPERATIONAL.contains(&Subsystem::Algedonic));
        assert!(!Subsystem::OPERATIONAL.contains(&Subsystem::Unknown));
        assert_eq!(Subsystem::OPERATIONAL.len(), 5);
    }
}
