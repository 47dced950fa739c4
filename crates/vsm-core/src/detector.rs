use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vsm_types::{EventId, PatternName, Subsystem};

use crate::clock::{HlcTimestamp, HybridLogicalClock};
use crate::config::{DetectorConfig, VsmScales};
use crate::error::CoreError;
use crate::event::Event;
use crate::metrics::{CoreMetrics, MetricsSink};
use crate::numeric::{lagged_correlation, least_squares_slope, mean_stddev, normalized_entropy, safe_div, z_score};
use crate::store::EventStore;

/// Detection severity (spec §3). Ordered so severity functions can stay
/// monotone in the triggering quantity by comparing ratios against fixed
/// breakpoints; ties break toward the lower variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

/// Maps a triggering-quantity-over-threshold ratio onto a severity, the same
/// breakpoints for every kind so scoring stays consistent across detectors
/// (spec §4.4: "severity functions are kind-specific but must be monotone").
fn severity_for_ratio(ratio: f64) -> Severity {
    if ratio < 1.0 {
        Severity::Minimal
    } else if ratio < 1.25 {
        Severity::Low
    } else if ratio < 1.75 {
        Severity::Medium
    } else if ratio < 2.5 {
        Severity::High
    } else {
        Severity::Critical
    }
}

/// The closed set of detector kinds an implementer must support (spec §4.4
/// table). Represented as a sum type per the REDESIGN FLAGS so an unhandled
/// kind is a compile error rather than a silently-ignored string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    RateBurst,
    RateThreshold,
    ErrorCascade,
    StateTransitionSequence,
    StatisticalAnomaly,
    BehaviorAnomaly,
    CoordinationBreakdown,
    CrossSubsystemCorrelation,
    VarietyOverload,
    ControlLoopOscillation,
    RecursiveInstability,
    AlgedonicStorm,
    PainEscalation,
    PleasureSaturation,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        use DetectorKind::*;
        match self {
            RateBurst => "rate_burst",
            RateThreshold => "rate_threshold",
            ErrorCascade => "error_cascade",
            StateTransitionSequence => "state_transition_sequence",
            StatisticalAnomaly => "statistical_anomaly",
            BehaviorAnomaly => "behavior_anomaly",
            CoordinationBreakdown => "coordination_breakdown",
            CrossSubsystemCorrelation => "cross_subsystem_correlation",
            VarietyOverload => "variety_overload",
            ControlLoopOscillation => "control_loop_oscillation",
            RecursiveInstability => "recursive_instability",
            AlgedonicStorm => "algedonic_storm",
            PainEscalation => "pain_escalation",
            PleasureSaturation => "pleasure_saturation",
        }
    }
}

/// Named pattern configuration (spec §3). Kind-specific knobs that don't
/// apply to every detector (anomaly thresholds, oscillation counts, ...)
/// live in `params` rather than as one giant struct of mostly-unused fields;
/// `param` falls back to the spec table's default when a key is absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternSpec {
    pub name: PatternName,
    pub kind: DetectorKind,
    pub window_ms: u64,
    pub cooldown_ms: u64,
    pub threshold: f64,
    pub min_events: usize,
    pub max_gap_ms: u64,
    pub target_subsystems: Vec<Subsystem>,
    pub event_type: Option<String>,
    pub metric_field: Option<String>,
    pub state_sequence: Option<Vec<String>>,
    pub params: HashMap<String, f64>,
}

impl PatternSpec {
    /// Builds a spec with the defaults from the spec §4.4 table for `kind`.
    pub fn new(name: impl Into<PatternName>, kind: DetectorKind) -> Self {
        use DetectorKind::*;
        let mut spec = Self {
            name: name.into(),
            kind,
            window_ms: 5_000,
            cooldown_ms: 10_000,
            threshold: 10.0,
            min_events: 3,
            max_gap_ms: 2_000,
            target_subsystems: Vec::new(),
            event_type: None,
            metric_field: None,
            state_sequence: None,
            params: HashMap::new(),
        };
        match kind {
            RateBurst => {
                spec.threshold = 10.0;
                spec.window_ms = 5_000;
            }
            RateThreshold => {
                spec.threshold = 5.0; // events/sec
                spec.window_ms = 5_000;
            }
            ErrorCascade => {
                spec.min_events = 3;
                spec.max_gap_ms = 2_000;
            }
            StateTransitionSequence => {
                spec.max_gap_ms = 5_000;
            }
            StatisticalAnomaly => {
                spec.params.insert("anomaly_threshold".into(), 3.0);
                spec.params.insert("min_samples".into(), 10.0);
            }
            BehaviorAnomaly => {
                spec.params.insert("anomaly_multiplier".into(), 2.0);
            }
            CoordinationBreakdown => {
                spec.params.insert("s2_failure_rate".into(), 0.7);
                spec.window_ms = 10_000;
            }
            CrossSubsystemCorrelation => {
                spec.params.insert("correlation_threshold".into(), 0.7);
                spec.params.insert("time_lag_ms".into(), 1_000.0);
            }
            VarietyOverload => {
                spec.params.insert("variety_threshold".into(), 0.8);
                spec.params.insert("capacity_threshold".into(), 0.9);
            }
            ControlLoopOscillation => {
                spec.params.insert("min_oscillations".into(), 3.0);
                spec.params.insert("amplitude_threshold".into(), 0.3);
            }
            RecursiveInstability => {
                spec.params.insert("recursion_depth".into(), 3.0);
                spec.params.insert("feedback_threshold".into(), 0.7);
            }
            AlgedonicStorm => {
                spec.params.insert("pain_threshold".into(), 0.8);
                spec.params.insert("duration_ms".into(), 10_000.0);
                spec.params.insert("intensity_escalation".into(), 1.5);
                spec.min_events = 3;
                spec.window_ms = 10_000;
            }
            PainEscalation => {
                spec.params.insert("escalation_rate".into(), 0.1);
                spec.params.insert("min_pain_events".into(), 3.0);
            }
            PleasureSaturation => {
                spec.params.insert("diminishing_returns_threshold".into(), 0.3);
                spec.params.insert("saturation_level".into(), 0.8);
            }
        }
        spec
    }

    pub fn with_target_subsystems(mut self, subsystems: Vec<Subsystem>) -> Self {
        self.target_subsystems = subsystems;
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_metric_field(mut self, field: impl Into<String>) -> Self {
        self.metric_field = Some(field.into());
        self
    }

    pub fn with_state_sequence(mut self, sequence: Vec<String>) -> Self {
        self.state_sequence = Some(sequence);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: f64) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn param(&self, key: &str, default: f64) -> f64 {
        self.params.get(key).copied().unwrap_or(default)
    }

    /// Validates the closed invariants from spec §3: a declared kind (always
    /// true — `DetectorKind` is an exhaustive enum) and a usable cooldown.
    fn validate(&self) -> Result<(), CoreError> {
        if self.cooldown_ms == 0 {
            return Err(CoreError::SpecInvalid(format!(
                "pattern {} has zero cooldown_ms",
                self.name
            )));
        }
        if matches!(self.kind, DetectorKind::StateTransitionSequence) && self.state_sequence.is_none() {
            return Err(CoreError::SpecInvalid(format!(
                "pattern {} is state_transition_sequence but declares no state_sequence",
                self.name
            )));
        }
        if matches!(self.kind, DetectorKind::CrossSubsystemCorrelation) && self.target_subsystems.len() != 2 {
            return Err(CoreError::SpecInvalid(format!(
                "pattern {} is cross_subsystem_correlation but does not name exactly two target subsystems",
                self.name
            )));
        }
        Ok(())
    }
}

/// Reference evidence for a [`Detection`]: either the source events or a
/// summary-statistics map, per spec §3 ("evidence: references to source
/// events or summary statistics").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Evidence {
    Events(Vec<EventId>),
    Summary(HashMap<String, f64>),
}

/// A single pattern occurrence (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Detection {
    pub pattern_name: PatternName,
    pub kind: DetectorKind,
    pub timestamp: HlcTimestamp,
    pub severity: Severity,
    pub algedonic_intensity: Option<f64>,
    /// Peak urgency among the triggering events. Feeds the integrator's
    /// emergency-bypass urgency path (spec §4.5: "urgency >= 0.9 AND kind is
    /// bypass-eligible").
    pub urgency: f64,
    pub emergency: bool,
    pub affected_subsystems: Vec<Subsystem>,
    pub evidence: Evidence,
    /// Identifying fingerprint used for cooldown suppression (I3). Two
    /// detections of the same pattern with the same fingerprint are subject
    /// to the cooldown; different fingerprints (e.g. a different target
    /// subsystem set) are tracked independently.
    pub fingerprint: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DetectionStats {
    pub total_detections: u64,
    pub suppressed_by_cooldown: u64,
    pub suppressed_by_rate_cap: u64,
    /// Exponential moving average of per-`detect()`-call processing time.
    pub avg_processing_time_us: f64,
}

struct CooldownState {
    last_fired: Instant,
    last_severity: Severity,
}

struct DetectorInner {
    store: EventStore,
    clock: Arc<HybridLogicalClock>,
    config: DetectorConfig,
    vsm_scales: VsmScales,
    specs: DashMap<PatternName, PatternSpec>,
    cooldowns: DashMap<String, CooldownState>,
    rate_windows: DashMap<PatternName, Mutex<VecDeque<Instant>>>,
    stats: Mutex<DetectionStats>,
    metrics: Arc<CoreMetrics>,
    sink: Arc<dyn MetricsSink>,
}

/// Registry and execution engine for temporal pattern detectors (spec §4.4).
/// Cheap to clone — internally an `Arc`.
#[derive(Clone)]
pub struct PatternDetector {
    inner: Arc<DetectorInner>,
}

impl PatternDetector {
    pub fn new(
        store: EventStore,
        clock: Arc<HybridLogicalClock>,
        config: DetectorConfig,
        vsm_scales: VsmScales,
        metrics: Arc<CoreMetrics>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                store,
                clock,
                config,
                vsm_scales,
                specs: DashMap::new(),
                cooldowns: DashMap::new(),
                rate_windows: DashMap::new(),
                stats: Mutex::new(DetectionStats::default()),
                metrics,
                sink,
            }),
        }
    }

    pub fn register(&self, spec: PatternSpec) -> Result<(), CoreError> {
        spec.validate()?;
        tracing::debug!(pattern = %spec.name, kind = spec.kind.as_str(), "pattern spec registered");
        self.inner.specs.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn unregister(&self, name: &PatternName) {
        self.inner.specs.remove(name);
        self.inner.rate_windows.remove(name);
        tracing::debug!(pattern = %name, "pattern spec unregistered");
    }

    /// Runs every registered spec over `events`, consulting the Store for
    /// historical context where a detector needs it, and returns every
    /// detection that clears its threshold, cooldown, and rate cap.
    pub async fn detect(&self, events: &[Event]) -> Vec<Detection> {
        let start = Instant::now();
        let mut out = Vec::new();
        let specs: Vec<PatternSpec> = self.inner.specs.iter().map(|e| e.value().clone()).collect();

        for spec in &specs {
            let Some(mut detection) = self.run_one(spec, events).await else { continue };
            if !self.admit(spec, &mut detection).await {
                continue;
            }
            self.inner.metrics.record_detection();
            self.inner.sink.incr_counter("detector.detections_emitted", 1);
            out.push(detection);
        }

        let elapsed_us = start.elapsed().as_micros() as f64;
        let mut stats = self.inner.stats.lock().await;
        stats.total_detections += out.len() as u64;
        stats.avg_processing_time_us = if stats.avg_processing_time_us == 0.0 {
            elapsed_us
        } else {
            0.9 * stats.avg_processing_time_us + 0.1 * elapsed_us
        };
        out
    }

    pub async fn stats(&self) -> DetectionStats {
        *self.inner.stats.lock().await
    }

    /// Applies cooldown (I3/P6) and the per-pattern hourly rate cap (spec
    /// §5). Returns `false` if the detection must be suppressed.
    async fn admit(&self, spec: &PatternSpec, detection: &mut Detection) -> bool {
        let key = format!("{}:{}", spec.name, detection.fingerprint);
        let now = Instant::now();

        if let Some(state) = self.inner.cooldowns.get(&key) {
            let elapsed = now.duration_since(state.last_fired);
            let escalated = detection.severity == Severity::Critical || detection.emergency;
            if elapsed < Duration::from_millis(spec.cooldown_ms) && !escalated {
                self.inner.stats.try_lock().map(|mut s| s.suppressed_by_cooldown += 1).ok();
                return false;
            }
        }

        {
            let entry = self.inner.rate_windows.entry(spec.name.clone()).or_insert_with(|| Mutex::new(VecDeque::new()));
            let mut window = entry.lock().await;
            let hour_ago = now.checked_sub(Duration::from_secs(3600)).unwrap_or(now);
            while window.front().map(|t| *t < hour_ago).unwrap_or(false) {
                window.pop_front();
            }
            if window.len() as u32 >= self.inner.config.max_detections_per_hour {
                self.inner.stats.try_lock().map(|mut s| s.suppressed_by_rate_cap += 1).ok();
                return false;
            }
            window.push_back(now);
        }

        self.inner.cooldowns.insert(
            key,
            CooldownState { last_fired: now, last_severity: detection.severity },
        );
        true
    }

    async fn run_one(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        use DetectorKind::*;
        match spec.kind {
            RateBurst => self.detect_rate_burst(spec, events).await,
            RateThreshold => self.detect_rate_threshold(spec, events).await,
            ErrorCascade => self.detect_error_cascade(spec, events).await,
            StateTransitionSequence => self.detect_state_transition_sequence(spec, events),
            StatisticalAnomaly => self.detect_statistical_anomaly(spec, events),
            BehaviorAnomaly => self.detect_behavior_anomaly(spec, events).await,
            CoordinationBreakdown => self.detect_coordination_breakdown(spec, events).await,
            CrossSubsystemCorrelation => self.detect_cross_subsystem_correlation(spec, events),
            VarietyOverload => self.detect_variety_overload(spec, events),
            ControlLoopOscillation => self.detect_control_loop_oscillation(spec, events),
            RecursiveInstability => self.detect_recursive_instability(spec, events),
            AlgedonicStorm => self.detect_algedonic_storm(spec, events),
            PainEscalation => self.detect_pain_escalation(spec, events),
            PleasureSaturation => self.detect_pleasure_saturation(spec, events),
        }
    }

    fn now_or_latest(&self, events: &[Event]) -> HlcTimestamp {
        events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .or_else(|| self.inner.clock.now().ok())
            .unwrap_or(HlcTimestamp { physical: 0, logical: 0, node_id: self.inner.clock.node_id() })
    }

    async fn detect_rate_burst(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let recent = self.inner.store.recent(None, spec.window_ms).await;
        let matching = dedup_matching(recent, events, spec.event_type.as_deref());
        let count = matching.len();
        let ratio = safe_div(count as f64, spec.threshold, 0.0);
        if ratio < 1.0 {
            return None;
        }
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: self.now_or_latest(events),
            severity: severity_for_ratio(ratio),
            algedonic_intensity: None,
            urgency: max_urgency(matching.iter()),
            emergency: false,
            affected_subsystems: distinct_subsystems(matching.iter()),
            evidence: Evidence::Summary(HashMap::from([("event_count".into(), count as f64)])),
            fingerprint: spec.name.0.clone(),
        })
    }

    async fn detect_rate_threshold(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let recent = self.inner.store.recent(None, spec.window_ms).await;
        let matching = dedup_matching(recent, events, spec.event_type.as_deref());
        let rate_per_sec = safe_div(matching.len() as f64, spec.window_ms as f64 / 1000.0, 0.0);
        let ratio = safe_div(rate_per_sec, spec.threshold, 0.0);
        if ratio < 1.0 {
            return None;
        }
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: self.now_or_latest(events),
            severity: severity_for_ratio(ratio),
            algedonic_intensity: None,
            urgency: max_urgency(matching.iter()),
            emergency: false,
            affected_subsystems: distinct_subsystems(matching.iter()),
            evidence: Evidence::Summary(HashMap::from([("rate_per_sec".into(), rate_per_sec)])),
            fingerprint: spec.name.0.clone(),
        })
    }

    /// Cascade detection (spec §4.4 algorithms): sort by HLC, roll a previous
    /// pointer, start a new chain whenever the gap exceeds `max_gap_ms`, and
    /// emit chains whose length clears `min_events`.
    async fn detect_error_cascade(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let recent = self.inner.store.recent(None, spec.window_ms).await;
        let mut candidates: Vec<Event> = recent
            .into_iter()
            .chain(events.iter().cloned())
            .filter(|e| {
                let is_target = spec.target_subsystems.is_empty() || spec.target_subsystems.contains(&e.subsystem);
                is_target && (e.event_type == "error" || e.urgency() >= 0.7)
            })
            .collect();
        candidates.sort_by_key(|e| e.timestamp);
        candidates.dedup_by_key(|e| e.id.clone());

        let mut best: Option<Vec<Event>> = None;
        let mut current: Vec<Event> = Vec::new();
        for event in candidates {
            match current.last() {
                Some(prev) if event.timestamp.physical.saturating_sub(prev.timestamp.physical) <= spec.max_gap_ms => {
                    current.push(event);
                }
                Some(_) => {
                    if current.len() >= spec.min_events
                        && best.as_ref().map(|b| b.len() < current.len()).unwrap_or(true)
                    {
                        best = Some(std::mem::take(&mut current));
                    } else {
                        current.clear();
                    }
                    current.push(event);
                }
                None => current.push(event),
            }
        }
        if current.len() >= spec.min_events && best.as_ref().map(|b| b.len() < current.len()).unwrap_or(true) {
            best = Some(current);
        }

        let chain = best?;
        let ratio = chain.len() as f64 / spec.min_events as f64;
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: chain.last().map(|e| e.timestamp).unwrap_or_else(|| self.now_or_latest(events)),
            severity: severity_for_ratio(ratio),
            algedonic_intensity: None,
            urgency: max_urgency(chain.iter()),
            emergency: false,
            affected_subsystems: distinct_subsystems(chain.iter()),
            evidence: Evidence::Events(chain.iter().map(|e| e.id.clone()).collect()),
            fingerprint: spec.name.0.clone(),
        })
    }

    fn detect_state_transition_sequence(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let wanted = spec.state_sequence.as_ref()?;
        if wanted.is_empty() {
            return None;
        }
        let mut transitions: Vec<&Event> = events
            .iter()
            .filter(|e| e.event_type == "state_change")
            .collect();
        transitions.sort_by_key(|e| e.timestamp);

        let mut cursor = 0usize;
        let mut matched: Vec<&Event> = Vec::new();
        let mut last_ts: Option<HlcTimestamp> = None;
        for event in &transitions {
            let Some(new_state) = event.payload.get("new_state").and_then(|v| v.as_str()) else { continue };
            if cursor >= wanted.len() {
                break;
            }
            if new_state == wanted[cursor] {
                if let Some(prev_ts) = last_ts {
                    if event.timestamp.physical.saturating_sub(prev_ts.physical) > spec.max_gap_ms {
                        // Gap too large: restart the match from this event.
                        cursor = 0;
                        matched.clear();
                        if new_state != wanted[0] {
                            continue;
                        }
                    }
                }
                matched.push(event);
                last_ts = Some(event.timestamp);
                cursor += 1;
            }
        }

        if cursor < wanted.len() {
            return None;
        }
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: matched.last().map(|e| e.timestamp).unwrap_or_else(|| self.now_or_latest(events)),
            severity: Severity::Medium,
            algedonic_intensity: None,
            urgency: max_urgency(matched.iter().copied()),
            emergency: false,
            affected_subsystems: distinct_subsystems(matched.iter().copied()),
            evidence: Evidence::Events(matched.iter().map(|e| e.id.clone()).collect()),
            fingerprint: spec.name.0.clone(),
        })
    }

    /// Two-pass mean/stddev over `metric_field`; flags samples at or beyond
    /// `anomaly_threshold` standard deviations (spec §4.4 algorithms).
    fn detect_statistical_anomaly(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let field = spec.metric_field.as_deref().unwrap_or("value");
        let samples: Vec<(EventId, f64)> = events.iter().filter_map(|e| e.metric(field).map(|v| (e.id.clone(), v))).collect();
        let min_samples = spec.param("min_samples", 10.0) as usize;
        if samples.len() < min_samples {
            return None;
        }
        let values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
        let (mean, stddev) = mean_stddev(&values);
        let threshold = spec.param("anomaly_threshold", 3.0);

        let anomalies: Vec<&(EventId, f64)> = samples.iter().filter(|(_, v)| z_score(*v, mean, stddev) >= threshold).collect();
        if anomalies.is_empty() {
            return None;
        }
        let max_z = anomalies
            .iter()
            .map(|(_, v)| z_score(*v, mean, stddev))
            .fold(0.0, f64::max);
        let ratio = safe_div(max_z, threshold, 0.0);
        let affected: Vec<EventId> = anomalies.iter().map(|(id, _)| id.clone()).collect();
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: self.now_or_latest(events),
            severity: severity_for_ratio(ratio),
            algedonic_intensity: None,
            urgency: max_urgency(events.iter().filter(|e| affected.contains(&e.id))),
            emergency: false,
            affected_subsystems: distinct_subsystems(events.iter().filter(|e| affected.contains(&e.id))),
            evidence: Evidence::Summary(HashMap::from([
                ("anomaly_count".into(), anomalies.len() as f64),
                ("mean".into(), mean),
                ("stddev".into(), stddev),
            ])),
            fingerprint: spec.name.0.clone(),
        })
    }

    /// Frequency deviation against the Store's recent baseline for the same
    /// event type, by a multiplicative factor (spec §4.4).
    async fn detect_behavior_anomaly(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let event_type = spec.event_type.as_deref()?;
        let baseline_window_ms = spec.window_ms.saturating_mul(4);
        let baseline = self.inner.store.recent(None, baseline_window_ms).await;
        let baseline_count = baseline.iter().filter(|e| e.event_type == event_type).count() as f64;
        let baseline_rate = safe_div(baseline_count, baseline_window_ms as f64, 0.0);

        let current_count = events.iter().filter(|e| e.event_type == event_type).count() as f64;
        let current_rate = safe_div(current_count, spec.window_ms as f64, 0.0);

        let multiplier = spec.param("anomaly_multiplier", 2.0);
        let factor = safe_div(current_rate, baseline_rate, if current_rate > 0.0 { f64::INFINITY } else { 0.0 });
        if !factor.is_finite() || factor < multiplier {
            return None;
        }
        let ratio = safe_div(factor, multiplier, 0.0);
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: self.now_or_latest(events),
            severity: severity_for_ratio(ratio),
            algedonic_intensity: None,
            urgency: max_urgency(events.iter().filter(|e| e.event_type == event_type)),
            emergency: false,
            affected_subsystems: distinct_subsystems(events.iter().filter(|e| e.event_type == event_type)),
            evidence: Evidence::Summary(HashMap::from([
                ("baseline_rate".into(), baseline_rate),
                ("current_rate".into(), current_rate),
                ("factor".into(), factor),
            ])),
            fingerprint: spec.name.0.clone(),
        })
    }

    async fn detect_coordination_breakdown(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let recent = self.inner.store.recent(Some(Subsystem::S2), spec.window_ms).await;
        let s2_events: Vec<&Event> = recent.iter().chain(events.iter().filter(|e| e.subsystem == Subsystem::S2)).collect();
        if s2_events.is_empty() {
            return None;
        }
        let failures = s2_events.iter().filter(|e| e.event_type == "error" || e.urgency() >= 0.7).count();
        let failure_rate = failures as f64 / s2_events.len() as f64;
        let s2_threshold = spec.param("s2_failure_rate", 0.7);

        let s1_recent = self.inner.store.recent(Some(Subsystem::S1), spec.window_ms).await;
        let s1_overloaded = s1_recent.len() as f64 >= spec.threshold;

        if failure_rate < s2_threshold && !(s1_overloaded && failure_rate > 0.0) {
            return None;
        }
        let ratio = safe_div(failure_rate, s2_threshold, 1.0).max(1.0);
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: self.now_or_latest(events),
            severity: severity_for_ratio(ratio),
            algedonic_intensity: None,
            urgency: max_urgency(s2_events.iter().map(|e| *e)),
            emergency: false,
            affected_subsystems: vec![Subsystem::S1, Subsystem::S2],
            evidence: Evidence::Summary(HashMap::from([
                ("s2_failure_rate".into(), failure_rate),
                ("s1_overloaded".into(), if s1_overloaded { 1.0 } else { 0.0 }),
            ])),
            fingerprint: spec.name.0.clone(),
        })
    }

    /// Co-occurrence correlation between the two named target subsystems
    /// (spec §4.4 "Temporal correlation" algorithm).
    fn detect_cross_subsystem_correlation(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let [a_sys, b_sys] = spec.target_subsystems.as_slice() else { return None };
        let a: Vec<u64> = events.iter().filter(|e| e.subsystem == *a_sys).map(|e| e.timestamp.physical).collect();
        let b: Vec<u64> = events.iter().filter(|e| e.subsystem == *b_sys).map(|e| e.timestamp.physical).collect();
        if a.is_empty() || b.is_empty() {
            return None;
        }
        let max_lag_ms = spec.param("time_lag_ms", 1_000.0) as u64;
        let score = lagged_correlation(&a, &b, max_lag_ms);
        let threshold = spec.param("correlation_threshold", 0.7);
        if score < threshold {
            return None;
        }
        let ratio = safe_div(score, threshold, 0.0);
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: self.now_or_latest(events),
            severity: severity_for_ratio(ratio),
            algedonic_intensity: None,
            urgency: max_urgency(events.iter().filter(|e| e.subsystem == *a_sys || e.subsystem == *b_sys)),
            emergency: false,
            affected_subsystems: vec![*a_sys, *b_sys],
            evidence: Evidence::Summary(HashMap::from([("correlation_score".into(), score)])),
            fingerprint: spec.name.0.clone(),
        })
    }

    /// Normalized Shannon entropy of event types within a subsystem window,
    /// weighted by the VSM scale table's per-subsystem multiplier (spec §4.4
    /// "variety pressure = Σ count_i × multiplier_i").
    fn detect_variety_overload(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let subsystem = spec.target_subsystems.first().copied()?;
        let relevant: Vec<&Event> = events.iter().filter(|e| e.subsystem == subsystem).collect();
        if relevant.is_empty() {
            return None;
        }
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for e in &relevant {
            *counts.entry(e.event_type.as_str()).or_insert(0) += 1;
        }
        let entropy = normalized_entropy(&counts.values().copied().collect::<Vec<_>>());

        let multiplier = self.inner.vsm_scales.for_subsystem(subsystem).map(|b| b.threshold_multiplier).unwrap_or(1.0);
        let pressure = relevant.len() as f64 * multiplier;
        let capacity_threshold = spec.param("capacity_threshold", 0.9) * spec.threshold.max(1.0);
        let variety_threshold = spec.param("variety_threshold", 0.8);

        let capacity_usage = safe_div(pressure, capacity_threshold, 0.0);
        if entropy < variety_threshold && capacity_usage < 1.0 {
            return None;
        }
        let ratio = (safe_div(entropy, variety_threshold, 0.0)).max(capacity_usage);
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: self.now_or_latest(events),
            severity: severity_for_ratio(ratio),
            algedonic_intensity: None,
            urgency: max_urgency(relevant.iter().map(|e| *e)),
            emergency: false,
            affected_subsystems: vec![subsystem],
            evidence: Evidence::Summary(HashMap::from([
                ("entropy".into(), entropy),
                ("variety_pressure".into(), pressure),
            ])),
            fingerprint: format!("{}:{}", spec.name.0, subsystem.as_str()),
        })
    }

    /// Peak/trough counting over `metric_field` with amplitude guard (spec
    /// §4.4 "control_loop_oscillation").
    fn detect_control_loop_oscillation(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let field = spec.metric_field.as_deref().unwrap_or("value");
        let mut series: Vec<(HlcTimestamp, f64)> =
            events.iter().filter_map(|e| e.metric(field).map(|v| (e.timestamp, v))).collect();
        series.sort_by_key(|(ts, _)| *ts);
        if series.len() < 3 {
            return None;
        }
        let amplitude_threshold = spec.param("amplitude_threshold", 0.3);
        let mut oscillations = 0usize;
        let mut max_amplitude = 0.0f64;
        for window in series.windows(3) {
            let [(_, a), (_, b), (_, c)] = window else { continue };
            let is_peak = *b > *a && *b > *c;
            let is_trough = *b < *a && *b < *c;
            if is_peak || is_trough {
                let amplitude = (b - a).abs().max((b - c).abs());
                if amplitude >= amplitude_threshold {
                    oscillations += 1;
                    max_amplitude = max_amplitude.max(amplitude);
                }
            }
        }
        let min_oscillations = spec.param("min_oscillations", 3.0) as usize;
        if oscillations < min_oscillations {
            return None;
        }
        let ratio = oscillations as f64 / min_oscillations as f64;
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: self.now_or_latest(events),
            severity: severity_for_ratio(ratio),
            algedonic_intensity: None,
            urgency: max_urgency(events.iter()),
            emergency: false,
            affected_subsystems: distinct_subsystems(events.iter()),
            evidence: Evidence::Summary(HashMap::from([
                ("oscillations".into(), oscillations as f64),
                ("max_amplitude".into(), max_amplitude),
            ])),
            fingerprint: spec.name.0.clone(),
        })
    }

    /// Follows `caused_by` chains to find recursion depth and computes
    /// feedback amplification as the mean last-to-first intensity ratio
    /// across chains deep enough to matter (spec §4.4 "Feedback
    /// amplification"). `caused_by` is a lookup key, not an ownership edge —
    /// a broken link (evicted source) simply truncates the chain there.
    fn detect_recursive_instability(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let by_id: HashMap<&EventId, &Event> = events.iter().map(|e| (&e.id, e)).collect();
        let depth_threshold = spec.param("recursion_depth", 3.0) as usize;
        let mut chains: Vec<Vec<&Event>> = Vec::new();

        for event in events {
            let mut chain = vec![event];
            let mut cursor = event;
            while let Some(parent_id) = cursor.caused_by() {
                let Some(parent) = by_id.get(&parent_id) else { break };
                chain.push(parent);
                cursor = parent;
                if chain.len() > 64 {
                    break; // guards against a cyclic caused_by reference
                }
            }
            if chain.len() >= depth_threshold {
                chains.push(chain);
            }
        }
        if chains.is_empty() {
            return None;
        }

        let ratios: Vec<f64> = chains
            .iter()
            .map(|chain| {
                let first = chain.last().map(|e| e.urgency()).unwrap_or(0.0);
                let last = chain.first().map(|e| e.urgency()).unwrap_or(0.0);
                if first == 0.0 { 1.0 } else { last / first }
            })
            .collect();
        let strength = ratios.iter().sum::<f64>() / ratios.len() as f64;
        let feedback_threshold = spec.param("feedback_threshold", 0.7);
        if strength < feedback_threshold {
            return None;
        }
        let ratio = safe_div(strength, feedback_threshold, 0.0);
        let deepest = chains.iter().max_by_key(|c| c.len())?;
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: self.now_or_latest(events),
            severity: severity_for_ratio(ratio),
            algedonic_intensity: None,
            urgency: max_urgency(deepest.iter().copied()),
            emergency: strength >= feedback_threshold * 1.5,
            affected_subsystems: distinct_subsystems(deepest.iter().copied()),
            evidence: Evidence::Events(deepest.iter().map(|e| e.id.clone()).collect()),
            fingerprint: spec.name.0.clone(),
        })
    }

    /// Pain-storm detection: >= 3 pain events (negative valence) with
    /// `|valence| >= pain_threshold` within `duration_ms`, escalating in
    /// intensity (spec §4.4).
    fn detect_algedonic_storm(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let pain_threshold = spec.param("pain_threshold", 0.8);
        let duration_ms = spec.param("duration_ms", 10_000.0) as u64;
        let mut pains: Vec<&Event> = events.iter().filter(|e| e.valence() < 0.0 && e.valence().abs() >= pain_threshold).collect();
        pains.sort_by_key(|e| e.timestamp);
        if pains.len() < spec.min_events.max(3) {
            return None;
        }
        let span = pains.last().unwrap().timestamp.physical.saturating_sub(pains.first().unwrap().timestamp.physical);
        if span > duration_ms {
            return None;
        }
        let escalation = safe_div(pains.last().unwrap().valence().abs(), pains.first().unwrap().valence().abs(), 1.0);
        let intensity_escalation = spec.param("intensity_escalation", 1.5);
        if escalation < intensity_escalation {
            return None;
        }
        let ratio = safe_div(escalation, intensity_escalation, 0.0);
        let severity = severity_for_ratio(ratio);
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: pains.last().unwrap().timestamp,
            severity,
            algedonic_intensity: Some((pains.iter().map(|e| e.valence().abs()).sum::<f64>() / pains.len() as f64).min(1.0)),
            urgency: max_urgency(pains.iter().copied()),
            emergency: severity == Severity::Critical,
            affected_subsystems: distinct_subsystems(pains.iter().copied()),
            evidence: Evidence::Events(pains.iter().map(|e| e.id.clone()).collect()),
            fingerprint: spec.name.0.clone(),
        })
    }

    /// Least-squares slope of pain intensity over index (spec §4.4
    /// "Escalation slope").
    fn detect_pain_escalation(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let mut pains: Vec<&Event> = events.iter().filter(|e| e.valence() < 0.0).collect();
        pains.sort_by_key(|e| e.timestamp);
        let min_pain_events = spec.param("min_pain_events", 3.0) as usize;
        if pains.len() < min_pain_events {
            return None;
        }
        let points: Vec<(f64, f64)> = pains.iter().enumerate().map(|(i, e)| (i as f64, e.valence().abs())).collect();
        let slope = least_squares_slope(&points);
        let escalation_rate = spec.param("escalation_rate", 0.1);
        if slope < escalation_rate {
            return None;
        }
        let ratio = safe_div(slope, escalation_rate, 0.0);
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: pains.last().unwrap().timestamp,
            severity: severity_for_ratio(ratio),
            algedonic_intensity: Some(pains.last().unwrap().valence().abs()),
            urgency: max_urgency(pains.iter().copied()),
            emergency: false,
            affected_subsystems: distinct_subsystems(pains.iter().copied()),
            evidence: Evidence::Summary(HashMap::from([("slope".into(), slope)])),
            fingerprint: spec.name.0.clone(),
        })
    }

    /// Sustained high pleasure (positive valence) with a diminishing-returns
    /// check: the slope of successive pleasure intensities must be shrinking
    /// relative to `diminishing_returns_threshold` (spec §4.4).
    fn detect_pleasure_saturation(&self, spec: &PatternSpec, events: &[Event]) -> Option<Detection> {
        let mut pleasures: Vec<&Event> = events.iter().filter(|e| e.valence() > 0.0).collect();
        pleasures.sort_by_key(|e| e.timestamp);
        if pleasures.len() < 3 {
            return None;
        }
        let saturation_level = spec.param("saturation_level", 0.8);
        let cumulative: f64 = pleasures.iter().map(|e| e.valence()).sum::<f64>() / pleasures.len() as f64;
        if cumulative < saturation_level {
            return None;
        }
        let deltas: Vec<f64> = pleasures.windows(2).map(|w| w[1].valence() - w[0].valence()).collect();
        let avg_delta = deltas.iter().sum::<f64>() / deltas.len().max(1) as f64;
        let diminishing_returns_threshold = spec.param("diminishing_returns_threshold", 0.3);
        // Diminishing returns: the rate of gain per event has fallen under the
        // threshold even though cumulative pleasure remains high.
        if avg_delta.abs() > diminishing_returns_threshold {
            return None;
        }
        let saturation_factor = (1.0 - avg_delta.abs() / diminishing_returns_threshold.max(f64::EPSILON)).clamp(0.0, 1.0);
        Some(Detection {
            pattern_name: spec.name.clone(),
            kind: spec.kind,
            timestamp: pleasures.last().unwrap().timestamp,
            severity: Severity::Low,
            algedonic_intensity: Some(cumulative.min(1.0)),
            urgency: max_urgency(pleasures.iter().copied()),
            emergency: false,
            affected_subsystems: distinct_subsystems(pleasures.iter().copied()),
            evidence: Evidence::Summary(HashMap::from([
                ("cumulative_pleasure".into(), cumulative),
                ("saturation_factor".into(), saturation_factor),
            ])),
            fingerprint: spec.name.0.clone(),
        })
    }
}

fn max_urgency<'a>(events: impl Iterator<Item = &'a Event>) -> f64 {
    events.map(|e| e.urgency()).fold(0.0, f64::max)
}

fn distinct_subsystems<'a>(events: impl Iterator<Item = &'a Event>) -> Vec<Subsystem> {
    let mut seen = Vec::new();
    for e in events {
        if !seen.contains(&e.subsystem) {
            seen.push(e.subsystem);
        }
    }
    seen
}

/// Merges a store-backed `recent` query with the caller-supplied `events`
/// slice and dedups by id. The two sources overlap whenever `events` itself
/// came from a prior `store.recent()` call (the engine's scan loop does
/// exactly that), so counting both without dedup would double every event
/// already persisted.
fn dedup_matching(recent: Vec<Event>, events: &[Event], event_type: Option<&str>) -> Vec<Event> {
    let mut combined: Vec<Event> = recent.into_iter().chain(events.iter().cloned()).collect();
    combined.sort_by_key(|e| e.id.clone());
    combined.dedup_by_key(|e| e.id.clone());
    combined.retain(|e| event_type.map(|t| t == e.event_type).unwrap_or(true));
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use vsm_types::NodeId;

    fn ts(physical: u64) -> HlcTimestamp {
        HlcTimestamp { physical, logical: 0, node_id: NodeId(1) }
    }

    fn event(physical: u64, subsystem: Subsystem, event_type: &str, urgency: f64, valence: f64) -> Event {
        Event::new(EventId::new(), ts(physical), event_type, subsystem, urgency, valence, Payload::new())
    }

    async fn detector() -> PatternDetector {
        let clock = Arc::new(HybridLogicalClock::new(NodeId(1)));
        let store = EventStore::new(
            crate::config::StoreConfig::default(),
            clock.clone(),
            Arc::new(CoreMetrics::default()),
            Arc::new(crate::metrics::NoopMetricsSink),
        );
        PatternDetector::new(
            store,
            clock,
            DetectorConfig::default(),
            VsmScales::default(),
            Arc::new(CoreMetrics::default()),
            Arc::new(crate::metrics::NoopMetricsSink),
        )
    }

    #[tokio::test]
    async fn rate_burst_fires_above_threshold() {
        let d = detector().await;
        let mut spec = PatternSpec::new("burst", DetectorKind::RateBurst);
        spec.threshold = 10.0;
        spec.window_ms = 5_000;
        d.register(spec).unwrap();

        let events: Vec<Event> = (0..25).map(|i| event(i * 100, Subsystem::S1, "request", 0.2, 0.0)).collect();
        let detections = d.detect(&events).await;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].kind, DetectorKind::RateBurst);
        assert!(detections[0].severity >= Severity::Medium);
    }

    #[tokio::test]
    async fn error_cascade_detects_chain_across_subsystems() {
        let d = detector().await;
        let spec = PatternSpec::new("cascade", DetectorKind::ErrorCascade)
            .with_target_subsystems(vec![Subsystem::S1, Subsystem::S2, Subsystem::S3]);
        d.register(spec).unwrap();

        let events = vec![
            event(0, Subsystem::S1, "error", 0.8, 0.0),
            event(500, Subsystem::S1, "error", 0.8, 0.0),
            event(1000, Subsystem::S2, "error", 0.8, 0.0),
            event(1500, Subsystem::S3, "error", 0.8, 0.0),
            event(2000, Subsystem::S3, "error", 0.8, 0.0),
            event(2500, Subsystem::S3, "error", 0.8, 0.0),
        ];
        let detections = d.detect(&events).await;
        assert_eq!(detections.len(), 1);
        // chain length 6 over min_events 3 => ratio 2.0, comfortably into the High band.
        assert!(detections[0].severity >= Severity::High);
        assert_eq!(detections[0].affected_subsystems.len(), 3);
    }

    #[tokio::test]
    async fn cooldown_suppresses_second_non_critical_detection() {
        let d = detector().await;
        let mut spec = PatternSpec::new("burst", DetectorKind::RateBurst);
        spec.threshold = 5.0;
        spec.cooldown_ms = 30_000;
        d.register(spec).unwrap();

        let events: Vec<Event> = (0..10).map(|i| event(i * 100, Subsystem::S1, "request", 0.2, 0.0)).collect();
        let first = d.detect(&events).await;
        assert_eq!(first.len(), 1);
        let second = d.detect(&events).await;
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn statistical_anomaly_flags_outliers() {
        let d = detector().await;
        let spec = PatternSpec::new("anomaly", DetectorKind::StatisticalAnomaly).with_metric_field("value");
        d.register(spec).unwrap();

        // 30 samples at the baseline plus a single far outlier keeps the
        // baseline's own z-score well under threshold while pushing the
        // outlier's z-score (~5.5) past it with enough margin for a High
        // severity ratio (population stddev is pulled toward the mean by
        // the outlier itself, so a handful of outliers among few samples
        // would *not* clear the threshold - this shape is deliberate).
        let mut events: Vec<Event> = Vec::new();
        for i in 0..30u64 {
            let mut e = event(i * 100, Subsystem::S4, "metric", 0.1, 0.0);
            e.payload.insert("value".into(), serde_json::json!(100.0));
            events.push(e);
        }
        let mut outlier = event(3100, Subsystem::S4, "metric", 0.1, 0.0);
        outlier.payload.insert("value".into(), serde_json::json!(200.0));
        events.push(outlier);

        let detections = d.detect(&events).await;
        assert_eq!(detections.len(), 1);
        assert!(detections[0].severity >= Severity::High);
    }

    #[tokio::test]
    async fn algedonic_storm_marks_emergency_only_at_critical_severity() {
        let d = detector().await;
        let spec = PatternSpec::new("storm", DetectorKind::AlgedonicStorm)
            .with_param("pain_threshold", 0.1);
        d.register(spec).unwrap();

        // Escalation ratio (0.32/0.20 = 1.6) clears the 1.5 admission bar but
        // lands the severity ratio (1.6/1.5 ~= 1.07) in the Low band, well
        // short of Critical - this must not force an emergency bypass.
        let events = vec![
            event(0, Subsystem::S1, "pain", 0.2, -0.20),
            event(1000, Subsystem::S1, "pain", 0.2, -0.25),
            event(2000, Subsystem::S1, "pain", 0.2, -0.32),
        ];
        let detections = d.detect(&events).await;
        assert_eq!(detections.len(), 1);
        assert!(detections[0].severity < Severity::Critical);
        assert!(!detections[0].emergency);
    }

    #[test]
    fn severity_is_monotone_in_ratio() {
        assert!(severity_for_ratio(0.5) < severity_for_ratio(1.1));
        assert!(severity_for_ratio(1.1) < severity_for_ratio(1.5));
        assert!(severity_for_ratio(1.5) < severity_for_ratio(2.0));
        assert!(severity_for_ratio(2.0) < severity_for_ratio(3.0));
    }
}
