use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vsm_types::{PatternName, Subsystem};

use crate::clock::HlcTimestamp;
use crate::config::IntegratorConfig;
use crate::detector::{Detection, DetectorKind, Severity};
use crate::metrics::{CoreMetrics, MetricsSink};
use crate::numeric::clamp;

const HISTORY_CAPACITY: usize = 100;

/// Whether a classified signal is pain (negative valence territory) or
/// pleasure (positive), per spec §4.5.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgedonicCategory {
    Pain,
    Pleasure,
}

/// The base kind every classified signal carries (spec §4.5's catalog of
/// named pain/pleasure kinds). A [`Detection`] is mapped to one of these via
/// [`classify_kind`] — the mapping is not 1:1 with [`DetectorKind`], since
/// several detector kinds share an underlying algedonic meaning (e.g. both
/// `error_cascade` and `coordination_breakdown` signal `cascade_failure`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgedonicKind {
    CascadeFailure,
    TemporalDeadlock,
    VarietyOverload,
    PerformanceDegradation,
    PatternInstability,
    LearningAcceleration,
    CoordinationHarmony,
    OptimizationSuccess,
    StabilityAchievement,
}

impl AlgedonicKind {
    pub fn as_str(&self) -> &'static str {
        use AlgedonicKind::*;
        match self {
            CascadeFailure => "cascade_failure",
            TemporalDeadlock => "temporal_deadlock",
            VarietyOverload => "variety_overload",
            PerformanceDegradation => "performance_degradation",
            PatternInstability => "pattern_instability",
            LearningAcceleration => "learning_acceleration",
            CoordinationHarmony => "coordination_harmony",
            OptimizationSuccess => "optimization_success",
            StabilityAchievement => "stability_achievement",
        }
    }
}

/// Maps a detector kind to its algedonic category and base kind (spec §4.5).
/// Most kinds are unambiguously pain or pleasure; `recursive_instability` and
/// `control_loop_oscillation` are pain (runaway feedback, thrashing control),
/// `pleasure_saturation` is the sole pleasure-side detector kind besides the
/// cross-subsystem/statistical kinds routed by observed valence sign.
fn classify_kind(kind: DetectorKind, dominant_valence: f64) -> (AlgedonicCategory, AlgedonicKind) {
    use AlgedonicCategory::*;
    use AlgedonicKind::*;
    use DetectorKind::*;
    match kind {
        ErrorCascade | CoordinationBreakdown => (Pain, CascadeFailure),
        ControlLoopOscillation | RecursiveInstability => (Pain, TemporalDeadlock),
        VarietyOverload => (Pain, AlgedonicKind::VarietyOverload),
        RateBurst | RateThreshold => (Pain, PerformanceDegradation),
        StatisticalAnomaly | BehaviorAnomaly => {
            if dominant_valence >= 0.0 {
                (Pleasure, OptimizationSuccess)
            } else {
                (Pain, PatternInstability)
            }
        }
        StateTransitionSequence => (Pain, StabilityAchievement),
        CrossSubsystemCorrelation => {
            if dominant_valence >= 0.0 {
                (Pleasure, CoordinationHarmony)
            } else {
                (Pain, CascadeFailure)
            }
        }
        AlgedonicStorm | PainEscalation => (Pain, CascadeFailure),
        PleasureSaturation => (Pleasure, LearningAcceleration),
    }
}

/// A single emitted pain or pleasure signal (spec §4.5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlgedonicSignal {
    pub pattern_name: PatternName,
    pub category: AlgedonicCategory,
    pub kind: AlgedonicKind,
    pub timestamp: HlcTimestamp,
    /// `[0, 1]`, clamped (I5/P7).
    pub intensity: f64,
    pub emergency: bool,
    pub affected_subsystems: Vec<Subsystem>,
    pub prescribed_action: &'static str,
}

fn prescribed_action(kind: AlgedonicKind, category: AlgedonicCategory) -> &'static str {
    use AlgedonicKind::*;
    match (category, kind) {
        (AlgedonicCategory::Pain, CascadeFailure) => "isolate_affected_subsystems",
        (AlgedonicCategory::Pain, TemporalDeadlock) => "reset_control_loop",
        (AlgedonicCategory::Pain, AlgedonicKind::VarietyOverload) => "shed_load_or_escalate_to_s5",
        (AlgedonicCategory::Pain, PerformanceDegradation) => "throttle_ingress",
        (AlgedonicCategory::Pain, PatternInstability) => "flag_for_s4_review",
        (AlgedonicCategory::Pain, StabilityAchievement) => "investigate_unexpected_transition",
        (AlgedonicCategory::Pleasure, LearningAcceleration) => "reinforce_current_policy",
        (AlgedonicCategory::Pleasure, CoordinationHarmony) => "no_action_continue_monitoring",
        (AlgedonicCategory::Pleasure, OptimizationSuccess) => "capture_as_baseline",
        _ => "no_action_continue_monitoring",
    }
}

/// Base intensity per algedonic kind (spec §4.5's pain/pleasure tables).
fn base_intensity(kind: AlgedonicKind) -> f64 {
    use AlgedonicKind::*;
    match kind {
        CascadeFailure => 0.95,
        TemporalDeadlock => 0.90,
        VarietyOverload => 0.80,
        PerformanceDegradation => 0.70,
        PatternInstability => 0.60,
        LearningAcceleration => 0.85,
        CoordinationHarmony => 0.75,
        OptimizationSuccess => 0.70,
        StabilityAchievement => 0.65,
    }
}

/// Whether a pain kind is eligible for the urgency-driven emergency bypass
/// path (spec §4.5's pain table "bypass-eligible" column). Pleasure kinds
/// are never bypass-eligible.
fn bypass_eligible(kind: AlgedonicKind) -> bool {
    matches!(kind, AlgedonicKind::CascadeFailure | AlgedonicKind::TemporalDeadlock)
}

/// Per-severity multiplier applied to intensity (spec §4.5's literal table:
/// `{critical:1.2, high:1.1, medium:1.0, low:0.9, default:1.0}`).
fn severity_multiplier(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 1.2,
        Severity::High => 1.1,
        Severity::Medium => 1.0,
        Severity::Low => 0.9,
        Severity::Minimal => 1.0,
    }
}

struct HistoryEntry {
    timestamp_ms: u64,
    intensity: f64,
}

struct LearningState {
    /// Exponential moving average of "success" (pain: resulting intensity
    /// stayed < 0.7; pleasure: stayed > 0.5), alpha fixed at 0.1 per spec
    /// §4.5, independent of `IntegratorConfig.learning_rate` (which instead
    /// scales how far `learning_adjustment` moves off 1.0). Starts at 0.5 —
    /// neutral, neither a success nor failure streak — until observed.
    success_ema: f64,
    observations: u64,
}

struct IntegratorInner {
    config: IntegratorConfig,
    pain_history: Mutex<VecDeque<HistoryEntry>>,
    pleasure_history: Mutex<VecDeque<HistoryEntry>>,
    learning: DashMap<PatternName, LearningState>,
    emergency_bypasses: AtomicU64,
    metrics: Arc<CoreMetrics>,
    sink: Arc<dyn MetricsSink>,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Classifies [`Detection`]s into pain/pleasure signals and tracks the
/// adaptive learning state and rolling history spec §4.5 requires. Cheap to
/// clone — internally an `Arc`.
#[derive(Clone)]
pub struct AlgedonicIntegrator {
    inner: Arc<IntegratorInner>,
}

impl AlgedonicIntegrator {
    pub fn new(config: IntegratorConfig, metrics: Arc<CoreMetrics>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(IntegratorInner {
                config,
                pain_history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
                pleasure_history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
                learning: DashMap::new(),
                emergency_bypasses: AtomicU64::new(0),
                metrics,
                sink,
            }),
        }
    }

    /// Pure classification (P8: calling this twice on the same detection with
    /// no intervening [`integrate`](Self::integrate) call yields the same
    /// signal). Does not mutate history or learning state.
    ///
    /// Intensity follows spec §4.5's formula: `base × severity_mult ×
    /// escalation_factor × learning_adjustment`, with an additional
    /// saturation factor on the pleasure side once cumulative pleasure
    /// crosses `pleasure_saturation_level`.
    pub fn classify(&self, detection: &Detection) -> AlgedonicSignal {
        let dominant_valence = detection.algedonic_intensity.unwrap_or(0.0);
        let (category, kind) = classify_kind(detection.kind, dominant_valence);

        let base = base_intensity(kind);
        let severity_mult = severity_multiplier(detection.severity);
        let escalation_factor = self.escalation_factor_for(category);
        let learning_adjustment = self.learning_adjustment_for(&detection.pattern_name);

        let mut raw = base * severity_mult * escalation_factor * learning_adjustment;
        if category == AlgedonicCategory::Pleasure {
            raw *= self.saturation_factor();
        }
        let intensity = clamp(raw, 0.0, 1.0);

        let emergency = category == AlgedonicCategory::Pain
            && (intensity >= self.inner.config.emergency_bypass_threshold
                || (detection.urgency >= 0.9 && bypass_eligible(kind)));

        AlgedonicSignal {
            pattern_name: detection.pattern_name.clone(),
            category,
            kind,
            timestamp: detection.timestamp,
            intensity,
            emergency,
            affected_subsystems: detection.affected_subsystems.clone(),
            prescribed_action: prescribed_action(kind, category),
        }
    }

    /// Classifies `detection`, then records the resulting signal into the
    /// rolling history and updates the per-pattern learning EMA. Use
    /// [`classify`](Self::classify) alone where idempotence matters (tests,
    /// dry runs); use this for the production path.
    pub async fn integrate(&self, detection: &Detection) -> AlgedonicSignal {
        let signal = self.classify(detection);
        self.record_history(&signal).await;
        self.update_learning(&signal.pattern_name, signal.category, signal.intensity);

        self.inner.metrics.record_algedonic_signal();
        self.inner.sink.incr_counter("integrator.signals_emitted", 1);
        if signal.emergency {
            self.inner.emergency_bypasses.fetch_add(1, Ordering::Relaxed);
            self.inner.metrics.record_emergency_bypass();
            self.inner.sink.incr_counter("integrator.emergency_bypasses", 1);
            tracing::warn!(
                pattern = %signal.pattern_name,
                kind = signal.kind.as_str(),
                intensity = signal.intensity,
                "emergency algedonic bypass triggered"
            );
        } else {
            tracing::debug!(
                pattern = %signal.pattern_name,
                kind = signal.kind.as_str(),
                intensity = signal.intensity,
                "algedonic signal integrated"
            );
        }
        signal
    }

    pub fn emergency_bypass_count(&self) -> u64 {
        self.inner.emergency_bypasses.load(Ordering::Relaxed)
    }

    /// Escalation factor (spec §4.5): the ratio of newest-to-oldest intensity
    /// over the last <= 5 same-category signals, clamped to `[0.5, 2.0]`;
    /// defaults to 1.0 with fewer than two prior signals to compare.
    fn escalation_factor_for(&self, category: AlgedonicCategory) -> f64 {
        let history = match category {
            AlgedonicCategory::Pain => self.inner.pain_history.try_lock(),
            AlgedonicCategory::Pleasure => self.inner.pleasure_history.try_lock(),
        };
        let Ok(history) = history else { return 1.0 };
        if history.len() < 2 {
            return 1.0;
        }
        let window: Vec<&HistoryEntry> = history.iter().rev().take(5).collect();
        let newest = window.first().map(|e| e.intensity).unwrap_or(0.0);
        let oldest = window.last().map(|e| e.intensity).unwrap_or(0.0);
        let ratio = if oldest <= f64::EPSILON {
            if newest > 0.0 { 2.0 } else { 1.0 }
        } else {
            newest / oldest
        };
        ratio.clamp(0.5, 2.0)
    }

    /// Decayed "current level" of recent same-category intensity (spec §4.5
    /// "Rolling history": temporal decay weights older signals less). Used
    /// only by the pleasure saturation check — the pain side has no
    /// analogous "current level" gate in spec §4.5.
    fn current_level(&self, category: AlgedonicCategory) -> f64 {
        let history = match category {
            AlgedonicCategory::Pain => self.inner.pain_history.try_lock(),
            AlgedonicCategory::Pleasure => self.inner.pleasure_history.try_lock(),
        };
        let Ok(history) = history else { return 0.0 };
        if history.is_empty() {
            return 0.0;
        }
        let now = now_ms();
        let decay_rate = self.inner.config.temporal_decay_rate;
        let weighted: f64 = history
            .iter()
            .map(|entry| {
                let age_s = now.saturating_sub(entry.timestamp_ms) as f64 / 1000.0;
                entry.intensity * (-decay_rate * age_s).exp()
            })
            .sum();
        weighted / history.len() as f64
    }

    /// Pleasure-only diminishing-returns factor: once the decayed current
    /// pleasure level crosses `pleasure_saturation_level`, intensity is
    /// pulled down proportional to how far over the line it sits (spec §4.5
    /// "saturation factor that reduces intensity once cumulative pleasure
    /// crosses a configurable level").
    fn saturation_factor(&self) -> f64 {
        let level = self.current_level(AlgedonicCategory::Pleasure);
        let threshold = self.inner.config.pleasure_saturation_level;
        if level <= threshold {
            return 1.0;
        }
        (1.0 - (level - threshold)).clamp(0.2, 1.0)
    }

    /// Learning adjustment (spec §4.5): `1 + (base_adjust - 1) ×
    /// learning_rate`, where `base_adjust` is 0.9 once the per-pattern
    /// success EMA exceeds 0.7, 1.1 once it drops below 0.3, else 1.0.
    fn learning_adjustment_for(&self, pattern: &PatternName) -> f64 {
        let base_adjust = match self.inner.learning.get(pattern) {
            Some(state) if state.observations > 0 => {
                if state.success_ema > 0.7 {
                    0.9
                } else if state.success_ema < 0.3 {
                    1.1
                } else {
                    1.0
                }
            }
            _ => 1.0,
        };
        1.0 + (base_adjust - 1.0) * self.inner.config.learning_rate
    }

    /// Updates the per-pattern success EMA (spec §4.5: pain "success" =
    /// resulting intensity stayed < 0.7; pleasure "success" = intensity
    /// stayed > 0.5), alpha fixed at 0.1 regardless of `learning_rate`.
    fn update_learning(&self, pattern: &PatternName, category: AlgedonicCategory, intensity: f64) {
        const SUCCESS_EMA_ALPHA: f64 = 0.1;
        let success = match category {
            AlgedonicCategory::Pain => intensity < 0.7,
            AlgedonicCategory::Pleasure => intensity > 0.5,
        };
        let success_value = if success { 1.0 } else { 0.0 };
        let mut entry = self
            .inner
            .learning
            .entry(pattern.clone())
            .or_insert_with(|| LearningState { success_ema: 0.5, observations: 0 });
        entry.success_ema += SUCCESS_EMA_ALPHA * (success_value - entry.success_ema);
        entry.observations += 1;
    }

    async fn record_history(&self, signal: &AlgedonicSignal) {
        let entry = HistoryEntry { timestamp_ms: now_ms(), intensity: signal.intensity };
        let mut history = match signal.category {
            AlgedonicCategory::Pain => self.inner.pain_history.lock().await,
            AlgedonicCategory::Pleasure => self.inner.pleasure_history.lock().await,
        };
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Evidence;
    use vsm_types::{EventId, NodeId};

    fn ts(physical: u64) -> HlcTimestamp {
        HlcTimestamp { physical, logical: 0, node_id: NodeId(1) }
    }

    fn detection(kind: DetectorKind, severity: Severity, emergency: bool) -> Detection {
        detection_with_urgency(kind, severity, emergency, 0.0)
    }

    fn detection_with_urgency(kind: DetectorKind, severity: Severity, emergency: bool, urgency: f64) -> Detection {
        Detection {
            pattern_name: "test_pattern".into(),
            kind,
            timestamp: ts(1000),
            severity,
            algedonic_intensity: None,
            urgency,
            emergency,
            affected_subsystems: vec![Subsystem::S1],
            evidence: Evidence::Events(vec![EventId::new()]),
            fingerprint: "test_pattern".into(),
        }
    }

    fn integrator() -> AlgedonicIntegrator {
        AlgedonicIntegrator::new(
            IntegratorConfig::default(),
            Arc::new(CoreMetrics::default()),
            Arc::new(crate::metrics::NoopMetricsSink),
        )
    }

    #[test]
    fn error_cascade_classifies_as_pain_cascade_failure() {
        let integrator = integrator();
        let signal = integrator.classify(&detection(DetectorKind::ErrorCascade, Severity::High, false));
        assert_eq!(signal.category, AlgedonicCategory::Pain);
        assert_eq!(signal.kind, AlgedonicKind::CascadeFailure);
    }

    #[test]
    fn pleasure_saturation_classifies_as_pleasure() {
        let integrator = integrator();
        let signal = integrator.classify(&detection(DetectorKind::PleasureSaturation, Severity::Low, false));
        assert_eq!(signal.category, AlgedonicCategory::Pleasure);
    }

    #[test]
    fn intensity_is_always_clamped_to_unit_interval() {
        let integrator = integrator();
        for severity in [Severity::Minimal, Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            let signal = integrator.classify(&detection(DetectorKind::ErrorCascade, severity, false));
            assert!((0.0..=1.0).contains(&signal.intensity));
        }
    }

    #[test]
    fn critical_severity_with_emergency_flag_triggers_bypass() {
        let integrator = integrator();
        let signal = integrator.classify(&detection(DetectorKind::AlgedonicStorm, Severity::Critical, true));
        assert!(signal.emergency);
        assert_eq!(signal.category, AlgedonicCategory::Pain);
    }

    #[test]
    fn classify_is_idempotent_without_integrate() {
        let integrator = integrator();
        let d = detection(DetectorKind::RateBurst, Severity::Medium, false);
        let a = integrator.classify(&d);
        let b = integrator.classify(&d);
        assert_eq!(a.intensity, b.intensity);
        assert_eq!(a.kind, b.kind);
    }

    #[tokio::test]
    async fn integrate_updates_learning_state_and_history() {
        let integrator = integrator();
        let d = detection(DetectorKind::RateBurst, Severity::High, false);
        let first = integrator.integrate(&d).await;
        let second = integrator.integrate(&d).await;
        // Escalation/learning adjustments mean repeated firing of the same
        // pattern does not necessarily reproduce the exact same intensity.
        assert!(integrator.inner.learning.get(&PatternName::from("test_pattern")).unwrap().observations == 2);
        let _ = (first, second);
    }

    #[test]
    fn high_urgency_bypasses_even_below_intensity_threshold() {
        let integrator = integrator();
        // temporal_deadlock base(0.90) * low severity_mult(0.9) = 0.81, short
        // of the default 0.85 threshold, so only the urgency path can trip it.
        let d = detection_with_urgency(DetectorKind::ControlLoopOscillation, Severity::Low, false, 0.95);
        let signal = integrator.classify(&d);
        assert!(signal.intensity < 0.85);
        assert!(signal.emergency, "bypass-eligible kind at urgency >= 0.9 should still trigger bypass");
    }

    #[test]
    fn low_urgency_pain_below_threshold_does_not_bypass() {
        let integrator = integrator();
        let d = detection_with_urgency(DetectorKind::ControlLoopOscillation, Severity::Low, false, 0.2);
        let signal = integrator.classify(&d);
        assert!(!signal.emergency);
    }

    #[tokio::test]
    async fn emergency_signal_increments_bypass_counter() {
        let integrator = integrator();
        let d = detection(DetectorKind::AlgedonicStorm, Severity::Critical, true);
        integrator.integrate(&d).await;
        assert_eq!(integrator.emergency_bypass_count(), 1);
    }

    proptest::proptest! {
        #[test]
        fn intensity_never_escapes_unit_interval(
            severity_idx in 0..5usize,
            emergency in proptest::bool::ANY,
        ) {
            let severities = [Severity::Minimal, Severity::Low, Severity::Medium, Severity::High, Severity::Critical];
            let integrator = integrator();
            let d = detection(DetectorKind::ErrorCascade, severities[severity_idx], emergency);
            let signal = integrator.classify(&d);
            proptest::prop_assert!(signal.intensity >= 0.0 && signal.intensity <= 1.0);
        }
    }
}
