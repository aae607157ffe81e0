//! Observability for the tuner
//!
//! Provides:
//! - Prometheus metrics (decisions, applied target changes, pre-scale episodes,
//!   circuit breaker and rate limiter activity, tick latency)
//! - Structured JSON event logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::WorkloadRef;
use crate::priority::Priority;

/// Histogram buckets for control-loop tick duration (in seconds)
const TICK_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

static GLOBAL_METRICS: OnceLock<TunerMetricsInner> = OnceLock::new();

struct TunerMetricsInner {
    decisions: IntCounterVec,
    target_changes: IntCounter,
    decisions_gated: IntCounter,
    patch_failures: IntCounterVec,
    recommended_target: GaugeVec,
    node_utilization: GaugeVec,
    prescale_started: IntCounter,
    prescale_rollbacks: IntCounterVec,
    prescale_active: IntGauge,
    circuit_opened: IntCounterVec,
    rate_limiter_waits: IntCounterVec,
    tick_duration_seconds: Histogram,
}

impl TunerMetricsInner {
    fn new() -> Self {
        Self {
            decisions: register_int_counter_vec!(
                "hpa_tuner_decisions_total",
                "HPA target decisions computed, by action",
                &["action"]
            )
            .expect("Failed to register decisions"),

            target_changes: register_int_counter!(
                "hpa_tuner_target_changes_total",
                "HPA target changes applied to the cluster"
            )
            .expect("Failed to register target_changes"),

            decisions_gated: register_int_counter!(
                "hpa_tuner_decisions_gated_total",
                "Target changes computed but not applied due to low confidence"
            )
            .expect("Failed to register decisions_gated"),

            patch_failures: register_int_counter_vec!(
                "hpa_tuner_patch_failures_total",
                "Failed HPA patches, by patched field",
                &["field"]
            )
            .expect("Failed to register patch_failures"),

            recommended_target: register_gauge_vec!(
                "hpa_tuner_recommended_target_percent",
                "Last recommended HPA CPU target per deployment",
                &["namespace", "deployment"]
            )
            .expect("Failed to register recommended_target"),

            node_utilization: register_gauge_vec!(
                "hpa_tuner_node_utilization_percent",
                "Blended CPU utilization of the nodes backing a deployment",
                &["namespace", "deployment"]
            )
            .expect("Failed to register node_utilization"),

            prescale_started: register_int_counter!(
                "hpa_tuner_prescale_started_total",
                "Pre-scale episodes started"
            )
            .expect("Failed to register prescale_started"),

            prescale_rollbacks: register_int_counter_vec!(
                "hpa_tuner_prescale_rollbacks_total",
                "Pre-scale rollbacks, by trigger",
                &["reason"]
            )
            .expect("Failed to register prescale_rollbacks"),

            prescale_active: register_int_gauge!(
                "hpa_tuner_prescale_active",
                "Deployments currently held at a raised minReplicas"
            )
            .expect("Failed to register prescale_active"),

            circuit_opened: register_int_counter_vec!(
                "hpa_tuner_circuit_opened_total",
                "Circuit breaker open transitions, by circuit",
                &["circuit"]
            )
            .expect("Failed to register circuit_opened"),

            rate_limiter_waits: register_int_counter_vec!(
                "hpa_tuner_rate_limiter_waits_total",
                "Times a caller was held back by a rate limiter",
                &["limiter"]
            )
            .expect("Failed to register rate_limiter_waits"),

            tick_duration_seconds: register_histogram!(
                "hpa_tuner_tick_duration_seconds",
                "Time spent evaluating all watched deployments in one tick",
                TICK_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_duration_seconds"),
        }
    }
}

/// Handle to the process-wide tuner metrics
///
/// Clones share the same underlying Prometheus collectors.
#[derive(Clone)]
pub struct TunerMetrics {
    _private: (),
}

impl Default for TunerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TunerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TunerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TunerMetricsInner {
        GLOBAL_METRICS.get_or_init(TunerMetricsInner::new)
    }

    pub fn record_decision(&self, action: &str) {
        self.inner().decisions.with_label_values(&[action]).inc();
    }

    pub fn inc_target_changes(&self) {
        self.inner().target_changes.inc();
    }

    pub fn inc_decisions_gated(&self) {
        self.inner().decisions_gated.inc();
    }

    pub fn inc_patch_failures(&self, field: &str) {
        self.inner().patch_failures.with_label_values(&[field]).inc();
    }

    pub fn set_recommended_target(&self, workload: &WorkloadRef, target: i32) {
        self.inner()
            .recommended_target
            .with_label_values(&[&workload.namespace, &workload.deployment])
            .set(target as f64);
    }

    pub fn set_node_utilization(&self, workload: &WorkloadRef, percent: f64) {
        self.inner()
            .node_utilization
            .with_label_values(&[&workload.namespace, &workload.deployment])
            .set(percent);
    }

    pub fn inc_prescale_started(&self) {
        self.inner().prescale_started.inc();
    }

    pub fn inc_prescale_rollback(&self, reason: &str) {
        self.inner()
            .prescale_rollbacks
            .with_label_values(&[reason])
            .inc();
    }

    pub fn set_prescale_active(&self, count: i64) {
        self.inner().prescale_active.set(count);
    }

    pub fn inc_circuit_opened(&self, circuit: &str) {
        self.inner()
            .circuit_opened
            .with_label_values(&[circuit])
            .inc();
    }

    pub fn inc_rate_limiter_wait(&self, limiter: &str) {
        self.inner()
            .rate_limiter_waits
            .with_label_values(&[limiter])
            .inc();
    }

    pub fn observe_tick_duration(&self, duration_secs: f64) {
        self.inner().tick_duration_seconds.observe(duration_secs);
    }
}

/// Structured event logger
///
/// Each significant controller transition is logged once under a stable
/// `event` name so log pipelines can key on it.
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn log_target_change(
        &self,
        workload: &WorkloadRef,
        current_target: i32,
        recommended_target: i32,
        pressure: &str,
        reason: &str,
    ) {
        info!(
            event = "hpa_target_changed",
            component = %self.component,
            namespace = %workload.namespace,
            deployment = %workload.deployment,
            hpa = %workload.hpa_name,
            current_target,
            recommended_target,
            pressure = %pressure,
            reason = %reason,
            "Applied new HPA CPU target"
        );
    }

    pub fn log_decision_gated(
        &self,
        workload: &WorkloadRef,
        current_target: i32,
        recommended_target: i32,
        confidence: f64,
        min_confidence: f64,
    ) {
        info!(
            event = "hpa_decision_gated",
            component = %self.component,
            namespace = %workload.namespace,
            deployment = %workload.deployment,
            current_target,
            recommended_target,
            confidence,
            min_confidence,
            "Target change withheld, confidence below gate"
        );
    }

    pub fn log_patch_failure(&self, workload: &WorkloadRef, field: &str, error: &str) {
        warn!(
            event = "hpa_patch_failed",
            component = %self.component,
            namespace = %workload.namespace,
            deployment = %workload.deployment,
            hpa = %workload.hpa_name,
            field = %field,
            error = %error,
            "HPA patch failed, leaving it for the next tick"
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_prescale_started(
        &self,
        workload: &WorkloadRef,
        original_min_replicas: i32,
        new_min_replicas: i32,
        predicted_cpu: f64,
        confidence: f64,
        window: &str,
        rollback_at: &str,
    ) {
        info!(
            event = "prescale_started",
            component = %self.component,
            namespace = %workload.namespace,
            deployment = %workload.deployment,
            original_min_replicas,
            new_min_replicas,
            predicted_cpu,
            confidence,
            window = %window,
            rollback_at = %rollback_at,
            "Raised minReplicas ahead of predicted load"
        );
    }

    pub fn log_prescale_rolled_back(
        &self,
        workload: &WorkloadRef,
        restored_min_replicas: i32,
        reason: &str,
        current_cpu: Option<f64>,
    ) {
        info!(
            event = "prescale_rolled_back",
            component = %self.component,
            namespace = %workload.namespace,
            deployment = %workload.deployment,
            restored_min_replicas,
            reason = %reason,
            current_cpu = ?current_cpu,
            "Restored original minReplicas"
        );
    }

    pub fn log_preemption(
        &self,
        requester: &str,
        target: &str,
        requester_priority: Priority,
        target_priority: Priority,
        cluster_pressure: f64,
    ) {
        warn!(
            event = "preemption_granted",
            component = %self.component,
            requester = %requester,
            target = %target,
            requester_priority = %requester_priority,
            target_priority = %target_priority,
            cluster_pressure,
            "Granted headroom preemption"
        );
    }

    pub fn log_startup(&self, version: &str, deployments: usize, prescale_enabled: bool) {
        info!(
            event = "controller_started",
            component = %self.component,
            version = %version,
            deployments,
            prescale_enabled,
            "HPA tuner started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            component = %self.component,
            reason = %reason,
            "HPA tuner shutting down"
        );
    }
}
