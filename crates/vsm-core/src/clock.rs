use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use vsm_types::NodeId;

use crate::error::CoreError;

/// Hybrid Logical Clock for causal ordering without a global clock.
///
/// Combines wall-clock time with a logical counter to guarantee:
/// - If event A happens-before event B, then `hlc(A) < hlc(B)`.
/// - HLC timestamps are monotonically increasing per node.
/// - HLC stays close to wall-clock time.
pub struct HybridLogicalClock {
    physical: AtomicU64,
    logical: AtomicU32,
    node_id: NodeId,
}

/// HLC timestamp — the causal ordering primitive.
///
/// Totally ordered: physical → logical → node_id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    pub physical: u64,
    pub logical: u32,
    pub node_id: NodeId,
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.physical
            .cmp(&other.physical)
            .then(self.logical.cmp(&other.logical))
            .then(self.node_id.0.cmp(&other.node_id.0))
    }
}

impl std::fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.physical, self.logical, self.node_id.0)
    }
}

fn wall_clock_ms() -> Result<u64, CoreError> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| CoreError::ClockUnavailable(e.to_string()))
}

impl HybridLogicalClock {
    pub fn new(node_id: NodeId) -> Self {
        let now = wall_clock_ms().unwrap_or(0);
        Self {
            physical: AtomicU64::new(now),
            logical: AtomicU32::new(0),
            node_id,
        }
    }

    /// Generate a new timestamp. Guarantees strictly monotonic increase.
    ///
    /// Lock-free CAS loop on the atomics. Fails with `ClockUnavailable` only
    /// if the physical clock source itself fails (spec §4.1), and with
    /// `ClockExhausted` if the logical counter would overflow within a
    /// single physical millisecond.
    pub fn now(&self) -> Result<HlcTimestamp, CoreError> {
        loop {
            let wall = wall_clock_ms()?;
            let prev_physical = self.physical.load(Ordering::Acquire);
            let prev_logical = self.logical.load(Ordering::Acquire);

            if wall > prev_physical {
                if self
                    .physical
                    .compare_exchange(prev_physical, wall, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.logical.store(0, Ordering::Release);
                    return Ok(HlcTimestamp {
                        physical: wall,
                        logical: 0,
                        node_id: self.node_id,
                    });
                }
            } else {
                let new_logical = match prev_logical.checked_add(1) {
                    Some(l) => l,
                    None => {
                        return Err(CoreError::ClockExhausted {
                            physical_ms: prev_physical,
                        })
                    }
                };
                if self
                    .logical
                    .compare_exchange(
                        prev_logical,
                        new_logical,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Ok(HlcTimestamp {
                        physical: prev_physical,
                        logical: new_logical,
                        node_id: self.node_id,
                    });
                }
            }
        }
    }

    /// Merge a remote timestamp into the local clock (`observe` in spec §4.1).
    /// Returns the resulting local timestamp, which is causally after both
    /// the remote timestamp and the prior local timestamp.
    pub fn observe(&self, remote: HlcTimestamp) -> Result<HlcTimestamp, CoreError> {
        let wall = wall_clock_ms()?;

        loop {
            let prev_physical = self.physical.load(Ordering::Acquire);
            let prev_logical = self.logical.load(Ordering::Acquire);

            let new_physical = wall.max(prev_physical).max(remote.physical);

            let new_logical = if new_physical == prev_physical && new_physical == remote.physical
            {
                prev_logical.max(remote.logical) + 1
            } else if new_physical == prev_physical {
                prev_logical + 1
            } else if new_physical == remote.physical {
                remote.logical + 1
            } else {
                0
            };

            if self
                .physical
                .compare_exchange(
                    prev_physical,
                    new_physical,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.logical.store(new_logical, Ordering::Release);
                return Ok(HlcTimestamp {
                    physical: new_physical,
                    logical: new_logical,
                    node_id: self.node_id,
                });
            }
        }
    }

    /// Total-order comparison: does `a` happen-before `b`?
    pub fn before(a: &HlcTimestamp, b: &HlcTimestamp) -> bool {
        a < b
    }

    /// Stable sort of anything carrying an `HlcTimestamp` by `(physical, logical, node_id)`.
    pub fn order<T>(mut items: Vec<T>, key: impl Fn(&T) -> HlcTimestamp) -> Vec<T> {
        items.sort_by_key(|item| key(item));
        items
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}
