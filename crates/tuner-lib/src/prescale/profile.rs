//! Per-deployment pre-scale state

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::forecast::ForecastWindow;
use crate::models::WorkloadRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreScaleState {
    Normal,
    PreScaling,
    /// Held only while the rollback patch is in flight
    RollingBack,
}

impl PreScaleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreScaleState::Normal => "NORMAL",
            PreScaleState::PreScaling => "PRE_SCALING",
            PreScaleState::RollingBack => "ROLLING_BACK",
        }
    }
}

impl std::fmt::Display for PreScaleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pre-scale episode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    /// `rollback_at` reached
    Timeout,
    /// Load never arrived within the failure window
    PredictionFailed,
    /// Predictions and current load are both back below the low-water mark
    PeakPassed,
    Manual,
}

impl RollbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackReason::Timeout => "timeout",
            RollbackReason::PredictionFailed => "prediction_failed",
            RollbackReason::PeakPassed => "peak_passed",
            RollbackReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prediction that triggered the active episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub predicted_cpu: f64,
    pub confidence: f64,
    pub window: ForecastWindow,
    pub model: String,
}

/// Pre-scale state of one deployment
///
/// `original_min_replicas` and `original_max_replicas` are captured at
/// registration and never re-read from the cluster. While `state` is
/// `Normal`, `current_min_replicas` equals `original_min_replicas`.
#[derive(Debug, Clone)]
pub struct PreScaleProfile {
    pub workload: WorkloadRef,
    pub original_min_replicas: i32,
    pub original_max_replicas: i32,
    pub state: PreScaleState,
    pub current_min_replicas: i32,
    pub pre_scale_started: Option<DateTime<Utc>>,
    pub rollback_at: Option<DateTime<Utc>>,
    /// Last pre-scale or rollback, for the per-deployment cooldown
    pub last_action_at: Option<DateTime<Utc>>,
    pub prediction: Option<PredictionRecord>,
    pub successful_predictions: u32,
    pub failed_predictions: u32,
}

impl PreScaleProfile {
    pub fn new(workload: WorkloadRef, min_replicas: i32, max_replicas: i32) -> Self {
        Self {
            workload,
            original_min_replicas: min_replicas,
            original_max_replicas: max_replicas,
            state: PreScaleState::Normal,
            current_min_replicas: min_replicas,
            pre_scale_started: None,
            rollback_at: None,
            last_action_at: None,
            prediction: None,
            successful_predictions: 0,
            failed_predictions: 0,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>, cooldown: Duration) -> bool {
        self.last_action_at
            .map(|at| now - at < cooldown)
            .unwrap_or(false)
    }

    pub(crate) fn start(
        &mut self,
        min_replicas: i32,
        prediction: Option<PredictionRecord>,
        now: DateTime<Utc>,
        auto_rollback: Duration,
    ) {
        self.state = PreScaleState::PreScaling;
        self.current_min_replicas = min_replicas;
        self.pre_scale_started = Some(now);
        self.rollback_at = Some(now + auto_rollback);
        self.last_action_at = Some(now);
        self.prediction = prediction;
    }

    pub(crate) fn finish_rollback(&mut self, now: DateTime<Utc>) {
        self.state = PreScaleState::Normal;
        self.current_min_replicas = self.original_min_replicas;
        self.pre_scale_started = None;
        self.rollback_at = None;
        self.last_action_at = Some(now);
        self.prediction = None;
    }

    pub fn snapshot(&self) -> PreScaleSnapshot {
        PreScaleSnapshot {
            namespace: self.workload.namespace.clone(),
            deployment: self.workload.deployment.clone(),
            hpa_name: self.workload.hpa_name.clone(),
            state: self.state,
            original_min_replicas: self.original_min_replicas,
            original_max_replicas: self.original_max_replicas,
            current_min_replicas: self.current_min_replicas,
            pre_scale_started: self.pre_scale_started,
            rollback_at: self.rollback_at,
            predicted_cpu: self.prediction.as_ref().map(|p| p.predicted_cpu),
            prediction_confidence: self.prediction.as_ref().map(|p| p.confidence),
            prediction_window: self.prediction.as_ref().map(|p| p.window),
            successful_predictions: self.successful_predictions,
            failed_predictions: self.failed_predictions,
        }
    }
}

/// Read-only view of a profile for dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreScaleSnapshot {
    pub namespace: String,
    pub deployment: String,
    pub hpa_name: String,
    pub state: PreScaleState,
    pub original_min_replicas: i32,
    pub original_max_replicas: i32,
    pub current_min_replicas: i32,
    pub pre_scale_started: Option<DateTime<Utc>>,
    pub rollback_at: Option<DateTime<Utc>>,
    pub predicted_cpu: Option<f64>,
    pub prediction_confidence: Option<f64>,
    pub prediction_window: Option<ForecastWindow>,
    pub successful_predictions: u32,
    pub failed_predictions: u32,
}

/// Aggregate pre-scale counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreScaleStats {
    pub registered: usize,
    pub active: usize,
    pub successful_predictions: u32,
    pub failed_predictions: u32,
    pub deployments: Vec<PreScaleSnapshot>,
}
