//! HPA target decision engine
//!
//! Per deployment the engine keeps only the last decision and the time of
//! the last adjustment; everything else is recomputed each tick.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::behavior::synthesize_behavior;
use super::{Action, HpaDecision};
use crate::cluster::ClusterApi;
use crate::models::WorkloadRef;
use crate::observability::{StructuredLogger, TunerMetrics};
use crate::telemetry::{NodeMetrics, PodCpuUsage, PressureLevel, Telemetry};

/// Engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum time between adjustments of one deployment
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
    /// Decisions below this confidence are computed but not applied
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// A pod younger than this marks a recent scheduling spike
    #[serde(default = "default_spike_pod_age_secs")]
    pub spike_pod_age_secs: i64,
    #[serde(default = "default_step")]
    pub step: i32,
    #[serde(default = "default_critical_step")]
    pub critical_step: i32,
    /// Safe pressure raises the target only above this headroom percent
    #[serde(default = "default_safe_increase_headroom")]
    pub safe_increase_headroom_percent: f64,
    /// Requests below this use the small-request band
    #[serde(default = "default_small_request_millicores")]
    pub small_request_millicores: u32,
    #[serde(default = "default_small_band")]
    pub small_request_band: (i32, i32),
    #[serde(default = "default_band")]
    pub default_band: (i32, i32),
    /// Assumed current target for an HPA without a CPU metric
    #[serde(default = "default_fallback_target")]
    pub fallback_target: i32,
}

fn default_cooldown_secs() -> i64 {
    300
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_spike_pod_age_secs() -> i64 {
    180
}

fn default_step() -> i32 {
    5
}

fn default_critical_step() -> i32 {
    10
}

fn default_safe_increase_headroom() -> f64 {
    40.0
}

fn default_small_request_millicores() -> u32 {
    100
}

fn default_small_band() -> (i32, i32) {
    (60, 90)
}

fn default_band() -> (i32, i32) {
    (50, 85)
}

fn default_fallback_target() -> i32 {
    70
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            min_confidence: default_min_confidence(),
            spike_pod_age_secs: default_spike_pod_age_secs(),
            step: default_step(),
            critical_step: default_critical_step(),
            safe_increase_headroom_percent: default_safe_increase_headroom(),
            small_request_millicores: default_small_request_millicores(),
            small_request_band: default_small_band(),
            default_band: default_band(),
            fallback_target: default_fallback_target(),
        }
    }
}

/// Base target widened for small CPU requests and tightened for very large ones
///
/// Fixed-size measurement noise is a bigger share of a small request, so small
/// requests get a higher target to avoid flapping.
pub fn adjusted_base_target(base_target: i32, cpu_request_millicores: Option<u32>) -> i32 {
    match cpu_request_millicores {
        Some(m) if m < 50 => (base_target + 15).min(90),
        Some(m) if m < 100 => (base_target + 10).min(85),
        Some(m) if m < 200 => (base_target + 5).min(80),
        Some(m) if m > 2000 => (base_target - 5).max(60),
        _ => base_target,
    }
}

/// Allowed `[min, max]` target for a CPU request size
pub fn target_band(config: &EngineConfig, cpu_request_millicores: Option<u32>) -> (i32, i32) {
    match cpu_request_millicores {
        Some(m) if m < config.small_request_millicores => config.small_request_band,
        _ => config.default_band,
    }
}

/// Everything one decision needs about a deployment
#[derive(Debug, Clone)]
pub struct DecisionInput<'a> {
    pub workload: &'a WorkloadRef,
    pub current_target: i32,
    /// Priority-adjusted base target
    pub base_target: i32,
    pub cpu_request_millicores: Option<u32>,
    pub node_metrics: &'a Telemetry<NodeMetrics>,
    pub pod_usage: &'a Telemetry<PodCpuUsage>,
}

/// Result of trying to apply a decision
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Recommended target equals the current one
    Unchanged,
    /// Confidence below the gate
    Gated,
    Applied,
    /// Patch failed; left for the next tick
    Failed(String),
}

pub struct HpaDecisionEngine {
    cluster: Arc<dyn ClusterApi>,
    config: EngineConfig,
    last_decisions: DashMap<String, HpaDecision>,
    last_adjustments: DashMap<String, DateTime<Utc>>,
    logger: StructuredLogger,
    metrics: TunerMetrics,
}

impl HpaDecisionEngine {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: EngineConfig) -> Self {
        Self {
            cluster,
            config,
            last_decisions: DashMap::new(),
            last_adjustments: DashMap::new(),
            logger: StructuredLogger::new("hpa_engine"),
            metrics: TunerMetrics::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Most recent decision for a `namespace/deployment` key
    pub fn last_decision(&self, key: &str) -> Option<HpaDecision> {
        self.last_decisions.get(key).map(|d| d.clone())
    }

    /// All retained decisions keyed by `namespace/deployment`
    pub fn decisions(&self) -> Vec<(String, HpaDecision)> {
        let mut all: Vec<_> = self
            .last_decisions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn calculate_hpa_target(&self, input: &DecisionInput<'_>) -> HpaDecision {
        self.calculate_hpa_target_at(input, Utc::now())
    }

    /// Decide the next CPU target for one deployment as of `now`
    pub fn calculate_hpa_target_at(&self, input: &DecisionInput<'_>, now: DateTime<Utc>) -> HpaDecision {
        let key = input.workload.key();
        let decision = self.decide(&key, input, now);

        self.metrics.record_decision(decision.action.as_str());
        self.metrics
            .set_recommended_target(input.workload, decision.recommended_target);
        debug!(
            namespace = %input.workload.namespace,
            deployment = %input.workload.deployment,
            current = decision.current_target,
            recommended = decision.recommended_target,
            action = %decision.action,
            confidence = decision.confidence,
            reason = %decision.reason,
            "HPA decision"
        );

        self.last_decisions.insert(key, decision.clone());
        decision
    }

    fn decide(&self, key: &str, input: &DecisionInput<'_>, now: DateTime<Utc>) -> HpaDecision {
        let current = input.current_target;
        let adjusted_base = adjusted_base_target(input.base_target, input.cpu_request_millicores);

        if let Some(last) = self.last_adjustments.get(key) {
            let elapsed = now - *last;
            let cooldown = Duration::seconds(self.config.cooldown_secs);
            if elapsed < cooldown {
                let pressure = input.node_metrics.value().pressure_level;
                return HpaDecision::maintain(
                    current,
                    pressure,
                    1.0,
                    format!(
                        "cooldown: {}s until next adjustment",
                        (cooldown - elapsed).num_seconds()
                    ),
                    now,
                );
            }
        }

        let node = match input.node_metrics {
            Telemetry::Live(node) => node,
            Telemetry::Degraded { reason, .. } => {
                return HpaDecision::maintain(
                    current,
                    PressureLevel::Safe,
                    0.0,
                    format!("no node signal: {}", reason),
                    now,
                );
            }
        };

        let mut confidence = 1.0;
        let spike = match input.pod_usage {
            Telemetry::Live(usage) => usage.has_pod_younger_than(self.config.spike_pod_age_secs),
            Telemetry::Degraded { .. } => false,
        };
        if spike {
            confidence *= 0.5;
        }
        if !input.pod_usage.is_live() {
            confidence *= 0.5;
        }

        let step = self.config.step;
        let (raw, reason) = match node.pressure_level {
            PressureLevel::Critical => {
                let cut = if spike { step } else { self.config.critical_step };
                (
                    current - cut,
                    format!(
                        "critical node pressure ({:.1}% used), lowering target by {}",
                        node.utilization_percent, cut
                    ),
                )
            }
            PressureLevel::Warning => {
                if current < adjusted_base {
                    (
                        (current + step).min(adjusted_base),
                        format!("warning pressure, moving up toward base {}", adjusted_base),
                    )
                } else if current > adjusted_base {
                    (
                        (current - step).max(adjusted_base),
                        format!("warning pressure, moving down toward base {}", adjusted_base),
                    )
                } else {
                    (current, "warning pressure, already at base target".to_string())
                }
            }
            PressureLevel::Safe => {
                let headroom = node.headroom_percent();
                if headroom > self.config.safe_increase_headroom_percent {
                    (
                        current + step,
                        format!("safe pressure with {:.1}% headroom, raising target", headroom),
                    )
                } else {
                    (
                        current,
                        format!("safe pressure but only {:.1}% headroom, holding", headroom),
                    )
                }
            }
        };

        let (min_target, max_target) = target_band(&self.config, input.cpu_request_millicores);
        let mut recommended = raw.clamp(min_target, max_target);
        if node.pressure_level == PressureLevel::Critical {
            // Never raise the target under critical pressure, even to reach the band
            recommended = recommended.min(current);
        }

        HpaDecision {
            current_target: current,
            recommended_target: recommended,
            reason,
            node_pressure: node.pressure_level,
            action: Action::between(current, recommended),
            confidence,
            scheduling_spike_detected: spike,
            decided_at: now,
        }
    }

    pub async fn apply_hpa_target(&self, workload: &WorkloadRef, decision: &HpaDecision) -> ApplyOutcome {
        self.apply_hpa_target_at(workload, decision, Utc::now()).await
    }

    /// Patch the HPA if the decision is a change and passes the confidence gate
    ///
    /// Only a successful patch starts the cooldown; gated and failed decisions
    /// leave the next tick free to act.
    pub async fn apply_hpa_target_at(
        &self,
        workload: &WorkloadRef,
        decision: &HpaDecision,
        now: DateTime<Utc>,
    ) -> ApplyOutcome {
        if !decision.is_change() {
            return ApplyOutcome::Unchanged;
        }

        if decision.confidence < self.config.min_confidence {
            self.metrics.inc_decisions_gated();
            self.logger.log_decision_gated(
                workload,
                decision.current_target,
                decision.recommended_target,
                decision.confidence,
                self.config.min_confidence,
            );
            return ApplyOutcome::Gated;
        }

        let behavior =
            synthesize_behavior(decision.node_pressure, decision.scheduling_spike_detected);

        match self
            .cluster
            .patch_hpa_target(
                &workload.namespace,
                &workload.hpa_name,
                decision.recommended_target,
                &behavior,
            )
            .await
        {
            Ok(()) => {
                self.last_adjustments.insert(workload.key(), now);
                self.metrics.inc_target_changes();
                self.logger.log_target_change(
                    workload,
                    decision.current_target,
                    decision.recommended_target,
                    decision.node_pressure.as_str(),
                    &decision.reason,
                );
                ApplyOutcome::Applied
            }
            Err(e) => {
                let error = e.to_string();
                self.metrics.inc_patch_failures("target");
                self.logger.log_patch_failure(workload, "target", &error);
                ApplyOutcome::Failed(error)
            }
        }
    }
}
