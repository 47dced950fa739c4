use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vsm_types::NodeId;

/// Top-level configuration tree (spec §6). Plain serde struct, no
/// config-loading crate — parsing/loading from disk or environment is the
/// embedding application's concern.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VsmConfig {
    pub clock: ClockConfig,
    pub store: StoreConfig,
    pub bus: BusConfig,
    pub detector: DetectorConfig,
    pub integrator: IntegratorConfig,
    pub vsm_scales: VsmScales,
    /// Directory for the optional restart-warmth snapshot. `None` disables it.
    pub data_dir: Option<PathBuf>,
}

impl VsmConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            clock: ClockConfig { node_id, ..ClockConfig::default_without_node() },
            ..Self::default_with_node_zero()
        }
    }

    fn default_with_node_zero() -> Self {
        Self {
            clock: ClockConfig::default_without_node(),
            store: StoreConfig::default(),
            bus: BusConfig::default(),
            detector: DetectorConfig::default(),
            integrator: IntegratorConfig::default(),
            vsm_scales: VsmScales::default(),
            data_dir: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Identifier embedded in every HLC timestamp. Required; no sensible default.
    pub node_id: NodeId,
}

impl ClockConfig {
    fn default_without_node() -> Self {
        Self { node_id: NodeId(0) }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub retention_ms: u64,
    pub cleanup_interval_ms: u64,
    pub max_events: usize,
    pub compression_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_ms: 3_600_000,
            cleanup_interval_ms: 60_000,
            max_events: 1_000_000,
            compression_threshold: 1_024,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BusConfig {
    pub buffer_window_ms: u64,
    pub queue_capacity: usize,
    /// Per-handler invocation deadline (spec §5 cancellation/timeouts).
    pub handler_deadline_ms: u64,
    /// Consecutive handler faults (timeout or panic) before the subscription
    /// is auto-evicted and a `HandlerEvicted` notification published.
    pub handler_fault_threshold: u32,
    /// Tick period for the ordering-release and queue-drain loop.
    pub dispatch_tick_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_window_ms: 100,
            queue_capacity: 10_000,
            handler_deadline_ms: 50,
            handler_fault_threshold: 5,
            dispatch_tick_ms: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub default_cooldown_ms: u64,
    pub max_detections_per_hour: u32,
    /// How often the engine's background loop re-evaluates registered
    /// pattern specs against the store's recent window.
    pub scan_interval_ms: u64,
    /// Width of the recent-events window handed to the detector on each scan.
    pub scan_window_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            default_cooldown_ms: 10_000,
            max_detections_per_hour: 100,
            scan_interval_ms: 1_000,
            scan_window_ms: 5_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct IntegratorConfig {
    pub emergency_bypass_threshold: f64,
    pub temporal_decay_rate: f64,
    pub learning_rate: f64,
    /// Cumulative pleasure level above which the saturation factor starts
    /// reducing pleasure intensity (spec §4.5 "diminishing returns").
    pub pleasure_saturation_level: f64,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            emergency_bypass_threshold: 0.85,
            temporal_decay_rate: 0.02,
            learning_rate: 0.05,
            pleasure_saturation_level: 0.8,
        }
    }
}

/// Per-subsystem `(window_ms, slide_ms, threshold_multiplier)` used to weight
/// variety-pressure computations (spec §4.4).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ScaleBand {
    pub window_ms: u64,
    pub slide_ms: u64,
    pub threshold_multiplier: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VsmScales {
    pub s1: ScaleBand,
    pub s2: ScaleBand,
    pub s3: ScaleBand,
    pub s4: ScaleBand,
    pub s5: ScaleBand,
}

impl Default for VsmScales {
    fn default() -> Self {
        Self {
            s1: ScaleBand { window_ms: 1_000, slide_ms: 100, threshold_multiplier: 1.0 },
            s2: ScaleBand { window_ms: 10_000, slide_ms: 1_000, threshold_multiplier: 0.8 },
            s3: ScaleBand { window_ms: 60_000, slide_ms: 5_000, threshold_multiplier: 0.6 },
            s4: ScaleBand { window_ms: 300_000, slide_ms: 30_000, threshold_multiplier: 0.4 },
            s5: ScaleBand { window_ms: 1_800_000, slide_ms: 180_000, threshold_multiplier: 0.2 },
        }
    }
}

impl VsmScales {
    pub fn for_subsystem(&self, subsystem: vsm_types::Subsystem) -> Option<ScaleBand> {
        use vsm_types::Subsystem::*;
        match subsystem {
            S1 => Some(self.s1),
            S2 => Some(self.s2),
            S3 => Some(self.s3),
            S4 => Some(self.s4),
            S5 => Some(self.s5),
            Algedonic | Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let store = StoreConfig::default();
        assert_eq!(store.retention_ms, 3_600_000);
        assert_eq!(store.cleanup_interval_ms, 60_000);
        assert_eq!(store.max_events, 1_000_000);
        assert_eq!(store.compression_threshold, 1_024);

        let bus = BusConfig::default();
        assert_eq!(bus.buffer_window_ms, 100);
        assert_eq!(bus.queue_capacity, 10_000);

        let detector = DetectorConfig::default();
        assert_eq!(detector.default_cooldown_ms, 10_000);
        assert_eq!(detector.max_detections_per_hour, 100);

        let integrator = IntegratorConfig::default();
        assert_eq!(integrator.emergency_bypass_threshold, 0.85);
        assert_eq!(integrator.temporal_decay_rate, 0.02);
        assert_eq!(integrator.learning_rate, 0.05);
    }

    #[test]
    fn vsm_scales_match_spec_table() {
        let scales = VsmScales::default();
        assert_eq!(scales.s1.window_ms, 1_000);
        assert_eq!(scales.s5.threshold_multiplier, 0.2);
    }

    #[test]
    fn new_with_node_id_overrides_default() {
        let cfg = VsmConfig::new(NodeId(7));
        assert_eq!(cfg.clock.node_id, NodeId(7));
    }
}
