use thiserror::Error;

/// Errors surfaced by the temporal event processing core.
///
/// Clock and spec-validation failures are synchronous and propagate to the
/// caller. Handler and background-task failures are isolated — they never
/// escape `Bus::publish` or `Store::ingest` — and are instead logged,
/// metric-counted, and (for handlers) may result in `HandlerEvicted`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("clock unavailable: {0}")]
    ClockUnavailable(String),

    #[error("logical counter exhausted within physical tick {physical_ms}")]
    ClockExhausted { physical_ms: u64 },

    #[error("event {event_id} is older than the store's retention window")]
    Retired { event_id: String },

    #[error("queue full: publish rejected")]
    QueueFull,

    #[error("operation exceeded its deadline")]
    DeadlineExceeded,

    #[error("subscription {subscription_id} evicted after repeated handler faults")]
    HandlerEvicted { subscription_id: String },

    #[error("pattern spec invalid: {0}")]
    SpecInvalid(String),

    #[error("store invariant violated: {0}")]
    StoreCorrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
