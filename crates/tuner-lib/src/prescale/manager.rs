//! Predictive pre-scaling
//!
//! Raises an HPA's `minReplicas` ahead of a forecast load spike and puts it
//! back once the episode is over. Each profile sits behind its own async
//! mutex; every state transition, including the patch it performs, runs
//! under that lock so the rollback worker and the control loop never
//! interleave on one deployment.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::forecast::{ForecastWindow, Forecaster, Prediction};
use super::profile::{
    PreScaleProfile, PreScaleSnapshot, PreScaleState, PreScaleStats, PredictionRecord,
    RollbackReason,
};
use crate::cluster::{ClusterApi, ClusterError};
use crate::models::WorkloadRef;
use crate::observability::{StructuredLogger, TunerMetrics};
use crate::telemetry::UtilizationSource;

#[derive(Debug, Error)]
pub enum PreScaleError {
    #[error("pre-scaling is disabled")]
    Disabled,
    #[error("deployment {0} is not registered for pre-scaling")]
    Unregistered(String),
    #[error("requested minReplicas {requested} is not above the original {original_min}")]
    BelowOriginalMin { requested: i32, original_min: i32 },
    #[error("patching minReplicas failed: {0}")]
    Patch(#[source] ClusterError),
    #[error("reading HPA failed: {0}")]
    Cluster(#[from] ClusterError),
}

/// Pre-scaling tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreScaleConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Predicted CPU percent that counts as a spike
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_auto_rollback_minutes")]
    pub auto_rollback_minutes: i64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    /// Time after which load still below the low-water mark fails the prediction
    #[serde(default = "default_failure_window_minutes")]
    pub failure_window_minutes: i64,
    /// Low-water mark as a fraction of the threshold
    #[serde(default = "default_peak_passed_ratio")]
    pub peak_passed_ratio: f64,
    /// Load at this fraction of the threshold confirms the prediction
    #[serde(default = "default_success_ratio")]
    pub success_ratio: f64,
    #[serde(default = "default_min_scale_factor")]
    pub min_scale_factor: f64,
    #[serde(default = "default_max_scale_factor")]
    pub max_scale_factor: f64,
    /// CPU target assumed for an HPA without one
    #[serde(default = "default_target_cpu")]
    pub default_target_cpu: i32,
}

fn default_enabled() -> bool {
    true
}

fn default_scale_up_threshold() -> f64 {
    75.0
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_auto_rollback_minutes() -> i64 {
    60
}

fn default_cooldown_minutes() -> i64 {
    15
}

fn default_failure_window_minutes() -> i64 {
    30
}

fn default_peak_passed_ratio() -> f64 {
    0.7
}

fn default_success_ratio() -> f64 {
    0.9
}

fn default_min_scale_factor() -> f64 {
    0.5
}

fn default_max_scale_factor() -> f64 {
    3.0
}

fn default_target_cpu() -> i32 {
    70
}

impl Default for PreScaleConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            scale_up_threshold: default_scale_up_threshold(),
            min_confidence: default_min_confidence(),
            auto_rollback_minutes: default_auto_rollback_minutes(),
            cooldown_minutes: default_cooldown_minutes(),
            failure_window_minutes: default_failure_window_minutes(),
            peak_passed_ratio: default_peak_passed_ratio(),
            success_ratio: default_success_ratio(),
            min_scale_factor: default_min_scale_factor(),
            max_scale_factor: default_max_scale_factor(),
            default_target_cpu: default_target_cpu(),
        }
    }
}

impl PreScaleConfig {
    fn low_water_mark(&self) -> f64 {
        self.scale_up_threshold * self.peak_passed_ratio
    }
}

/// Replicas needed to absorb `predicted_cpu` at `target_cpu`, within bounds
pub fn required_replicas(
    current_replicas: i32,
    predicted_cpu: f64,
    target_cpu: f64,
    min_replicas: i32,
    max_replicas: i32,
    config: &PreScaleConfig,
) -> i32 {
    let factor = if target_cpu > 0.0 {
        (predicted_cpu / target_cpu).clamp(config.min_scale_factor, config.max_scale_factor)
    } else {
        config.max_scale_factor
    };
    let raw = (current_replicas.max(1) as f64 * factor).ceil() as i32;
    raw.clamp(min_replicas, max_replicas.max(min_replicas))
}

/// What one `check_and_prescale` call did
#[derive(Debug, Clone, PartialEq)]
pub enum PreScaleOutcome {
    Disabled,
    Unregistered,
    CoolingDown,
    /// An episode is active and no rollback trigger fired
    StillPreScaling,
    RolledBack(RollbackReason),
    NoSpikePredicted,
    /// Cluster state needed for the decision could not be read
    TelemetryDegraded,
    /// The prediction does not call for more than the original floor
    BelowOriginalMin,
    PreScaled { min_replicas: i32 },
    PatchFailed(String),
}

pub struct PreScaleManager {
    cluster: Arc<dyn ClusterApi>,
    forecaster: Arc<dyn Forecaster>,
    utilization: Arc<dyn UtilizationSource>,
    config: PreScaleConfig,
    profiles: DashMap<String, Arc<Mutex<PreScaleProfile>>>,
    active: AtomicI64,
    logger: StructuredLogger,
    metrics: TunerMetrics,
}

impl PreScaleManager {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        forecaster: Arc<dyn Forecaster>,
        utilization: Arc<dyn UtilizationSource>,
        config: PreScaleConfig,
    ) -> Self {
        Self {
            cluster,
            forecaster,
            utilization,
            config,
            profiles: DashMap::new(),
            active: AtomicI64::new(0),
            logger: StructuredLogger::new("prescale_manager"),
            metrics: TunerMetrics::new(),
        }
    }

    pub fn config(&self) -> &PreScaleConfig {
        &self.config
    }

    pub fn is_registered(&self, workload: &WorkloadRef) -> bool {
        self.profiles.contains_key(&workload.key())
    }

    /// Register a deployment, capturing the HPA's current replica bounds
    ///
    /// Idempotent: a registered deployment keeps its original bounds.
    pub async fn register_deployment(&self, workload: &WorkloadRef) -> Result<(), PreScaleError> {
        if self.is_registered(workload) {
            return Ok(());
        }
        let hpa = self
            .cluster
            .get_hpa(&workload.namespace, &workload.hpa_name)
            .await?;
        self.register_with_bounds(workload, hpa.min_replicas, hpa.max_replicas);
        Ok(())
    }

    /// Register with explicit bounds; no-op if already registered
    pub fn register_with_bounds(&self, workload: &WorkloadRef, min_replicas: i32, max_replicas: i32) {
        self.profiles.entry(workload.key()).or_insert_with(|| {
            info!(
                namespace = %workload.namespace,
                deployment = %workload.deployment,
                min_replicas,
                max_replicas,
                "Registered deployment for pre-scaling"
            );
            Arc::new(Mutex::new(PreScaleProfile::new(
                workload.clone(),
                min_replicas,
                max_replicas,
            )))
        });
    }

    fn profile(&self, workload: &WorkloadRef) -> Option<Arc<Mutex<PreScaleProfile>>> {
        self.profiles.get(&workload.key()).map(|p| Arc::clone(&p))
    }

    fn all_profiles(&self) -> Vec<Arc<Mutex<PreScaleProfile>>> {
        self.profiles.iter().map(|p| Arc::clone(p.value())).collect()
    }

    pub async fn check_and_prescale(&self, workload: &WorkloadRef) -> PreScaleOutcome {
        self.check_and_prescale_at(workload, Utc::now()).await
    }

    /// Evaluate one deployment as of `now`
    pub async fn check_and_prescale_at(
        &self,
        workload: &WorkloadRef,
        now: DateTime<Utc>,
    ) -> PreScaleOutcome {
        if !self.config.enabled {
            return PreScaleOutcome::Disabled;
        }
        let Some(profile) = self.profile(workload) else {
            return PreScaleOutcome::Unregistered;
        };
        let mut profile = profile.lock().await;

        if profile.in_cooldown(now, Duration::minutes(self.config.cooldown_minutes)) {
            return PreScaleOutcome::CoolingDown;
        }

        if profile.state == PreScaleState::PreScaling {
            return self.check_rollback(&mut profile, now).await;
        }

        let key = workload.key();
        let (predictions, _) = self.collect_predictions(&key).await;
        let Some((window, prediction)) = self.select_spike(&predictions) else {
            return PreScaleOutcome::NoSpikePredicted;
        };

        let hpa = match self
            .cluster
            .get_hpa(&workload.namespace, &workload.hpa_name)
            .await
        {
            Ok(hpa) => hpa,
            Err(e) => {
                warn!(deployment = %key, error = %e, "Cannot read HPA for pre-scale decision");
                return PreScaleOutcome::TelemetryDegraded;
            }
        };
        let target_cpu = hpa
            .target_utilization
            .unwrap_or(self.config.default_target_cpu) as f64;

        let required = required_replicas(
            hpa.current_replicas,
            prediction.predicted_value,
            target_cpu,
            profile.original_min_replicas,
            profile.original_max_replicas,
            &self.config,
        );
        if required <= profile.original_min_replicas {
            debug!(
                deployment = %key,
                required,
                original_min = profile.original_min_replicas,
                "Predicted load fits the original floor"
            );
            return PreScaleOutcome::BelowOriginalMin;
        }

        let record = PredictionRecord {
            predicted_cpu: prediction.predicted_value,
            confidence: prediction.confidence,
            window,
            model: prediction.model_used.clone(),
        };
        match self.start_episode(&mut profile, required, Some(record), now).await {
            Ok(()) => PreScaleOutcome::PreScaled {
                min_replicas: required,
            },
            Err(e) => PreScaleOutcome::PatchFailed(e.to_string()),
        }
    }

    /// Highest-confidence prediction over the threshold and confidence gate
    fn select_spike<'a>(
        &self,
        predictions: &'a [(ForecastWindow, Prediction)],
    ) -> Option<(ForecastWindow, &'a Prediction)> {
        predictions
            .iter()
            .filter(|(_, p)| {
                p.predicted_value > self.config.scale_up_threshold
                    && p.confidence > self.config.min_confidence
            })
            .max_by(|a, b| a.1.confidence.total_cmp(&b.1.confidence))
            .map(|(w, p)| (*w, p))
    }

    /// Predictions for every window, plus the number of windows that failed
    async fn collect_predictions(&self, key: &str) -> (Vec<(ForecastWindow, Prediction)>, usize) {
        let mut predictions = Vec::with_capacity(ForecastWindow::ALL.len());
        let mut failures = 0;
        for window in ForecastWindow::ALL {
            match self.forecaster.predict(key, window).await {
                Ok(Some(p)) => predictions.push((window, p)),
                Ok(None) => {}
                Err(e) => {
                    failures += 1;
                    debug!(deployment = %key, window = %window, error = %e, "Forecast unavailable");
                }
            }
        }
        (predictions, failures)
    }

    async fn start_episode(
        &self,
        profile: &mut PreScaleProfile,
        min_replicas: i32,
        prediction: Option<PredictionRecord>,
        now: DateTime<Utc>,
    ) -> Result<(), PreScaleError> {
        let workload = profile.workload.clone();
        if let Err(e) = self
            .cluster
            .patch_hpa_min_replicas(&workload.namespace, &workload.hpa_name, min_replicas)
            .await
        {
            self.metrics.inc_patch_failures("min_replicas");
            self.logger
                .log_patch_failure(&workload, "min_replicas", &e.to_string());
            return Err(PreScaleError::Patch(e));
        }

        let was_normal = profile.state == PreScaleState::Normal;
        profile.start(
            min_replicas,
            prediction,
            now,
            Duration::minutes(self.config.auto_rollback_minutes),
        );
        if was_normal {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.metrics.set_prescale_active(active);
        }
        self.metrics.inc_prescale_started();

        let (predicted_cpu, confidence, window) = profile
            .prediction
            .as_ref()
            .map(|p| (p.predicted_cpu, p.confidence, p.window.as_str()))
            .unwrap_or((0.0, 0.0, "forced"));
        let rollback_at = profile
            .rollback_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default();
        self.logger.log_prescale_started(
            &workload,
            profile.original_min_replicas,
            min_replicas,
            predicted_cpu,
            confidence,
            window,
            &rollback_at,
        );
        Ok(())
    }

    /// Evaluate the rollback triggers of an active episode and act on them
    async fn check_rollback(
        &self,
        profile: &mut PreScaleProfile,
        now: DateTime<Utc>,
    ) -> PreScaleOutcome {
        let threshold = self.config.scale_up_threshold;
        let low_water = self.config.low_water_mark();

        let utilization = self.utilization.workload_utilization(&profile.workload).await;
        let current_cpu = utilization.live().map(|u| u.cpu_percent);

        if let Some(cpu) = current_cpu {
            if cpu >= threshold * self.config.success_ratio {
                profile.successful_predictions += 1;
            }
        }

        let below_low_water = current_cpu.map(|cpu| cpu < low_water).unwrap_or(false);
        let failure_window_elapsed = profile
            .pre_scale_started
            .map(|started| now - started >= Duration::minutes(self.config.failure_window_minutes))
            .unwrap_or(false);

        let reason = if profile.rollback_at.map(|at| now >= at).unwrap_or(false) {
            Some(RollbackReason::Timeout)
        } else if failure_window_elapsed && below_low_water {
            Some(RollbackReason::PredictionFailed)
        } else if below_low_water && self.peak_passed(&profile.workload.key()).await {
            Some(RollbackReason::PeakPassed)
        } else {
            None
        };

        match reason {
            Some(reason) => match self.roll_back(profile, reason, current_cpu, now).await {
                Ok(()) => PreScaleOutcome::RolledBack(reason),
                Err(e) => PreScaleOutcome::PatchFailed(e.to_string()),
            },
            None => PreScaleOutcome::StillPreScaling,
        }
    }

    /// Every confident prediction is below the low-water mark
    ///
    /// With no confident predictions this holds vacuously, but any failed
    /// forecast query keeps the episode running.
    async fn peak_passed(&self, key: &str) -> bool {
        let (predictions, failures) = self.collect_predictions(key).await;
        if failures > 0 {
            return false;
        }
        let low_water = self.config.low_water_mark();
        predictions
            .iter()
            .filter(|(_, p)| p.confidence > self.config.min_confidence)
            .all(|(_, p)| p.predicted_value < low_water)
    }

    async fn roll_back(
        &self,
        profile: &mut PreScaleProfile,
        reason: RollbackReason,
        current_cpu: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<(), PreScaleError> {
        let workload = profile.workload.clone();
        profile.state = PreScaleState::RollingBack;

        if let Err(e) = self
            .cluster
            .patch_hpa_min_replicas(
                &workload.namespace,
                &workload.hpa_name,
                profile.original_min_replicas,
            )
            .await
        {
            profile.state = PreScaleState::PreScaling;
            self.metrics.inc_patch_failures("min_replicas");
            self.logger
                .log_patch_failure(&workload, "min_replicas", &e.to_string());
            return Err(PreScaleError::Patch(e));
        }

        if reason == RollbackReason::PredictionFailed {
            profile.failed_predictions += 1;
        }
        let prediction = profile.prediction.take();
        profile.finish_rollback(now);

        let active = (self.active.fetch_sub(1, Ordering::SeqCst) - 1).max(0);
        self.metrics.set_prescale_active(active);
        self.metrics.inc_prescale_rollback(reason.as_str());
        self.logger.log_prescale_rolled_back(
            &workload,
            profile.original_min_replicas,
            reason.as_str(),
            current_cpu,
        );

        if let (Some(prediction), Some(actual)) = (prediction, current_cpu) {
            if let Err(e) = self
                .forecaster
                .validate_prediction(
                    &workload.key(),
                    prediction.predicted_cpu,
                    actual,
                    &prediction.model,
                )
                .await
            {
                debug!(deployment = %workload, error = %e, "Prediction validation not delivered");
            }
        }
        Ok(())
    }

    pub async fn check_all_rollbacks(&self) -> Vec<(String, RollbackReason)> {
        self.check_all_rollbacks_at(Utc::now()).await
    }

    /// Run rollback evaluation for every active episode
    pub async fn check_all_rollbacks_at(&self, now: DateTime<Utc>) -> Vec<(String, RollbackReason)> {
        let mut rolled_back = Vec::new();
        for profile in self.all_profiles() {
            let mut profile = profile.lock().await;
            if profile.state != PreScaleState::PreScaling {
                continue;
            }
            if let PreScaleOutcome::RolledBack(reason) = self.check_rollback(&mut profile, now).await {
                rolled_back.push((profile.workload.key(), reason));
            }
        }
        rolled_back
    }

    /// Pre-scale to `min_replicas` without consulting the forecaster
    ///
    /// The value is capped at the original maximum. Returns the floor applied.
    pub async fn force_prescale(
        &self,
        workload: &WorkloadRef,
        min_replicas: i32,
    ) -> Result<i32, PreScaleError> {
        if !self.config.enabled {
            return Err(PreScaleError::Disabled);
        }
        let profile = self
            .profile(workload)
            .ok_or_else(|| PreScaleError::Unregistered(workload.key()))?;
        let mut profile = profile.lock().await;

        let applied = min_replicas.min(profile.original_max_replicas);
        if applied <= profile.original_min_replicas {
            return Err(PreScaleError::BelowOriginalMin {
                requested: min_replicas,
                original_min: profile.original_min_replicas,
            });
        }

        self.start_episode(&mut profile, applied, None, Utc::now())
            .await?;
        Ok(applied)
    }

    /// End an active episode now; `false` when none was active
    pub async fn force_rollback(&self, workload: &WorkloadRef) -> Result<bool, PreScaleError> {
        let profile = self
            .profile(workload)
            .ok_or_else(|| PreScaleError::Unregistered(workload.key()))?;
        let mut profile = profile.lock().await;

        if profile.state != PreScaleState::PreScaling {
            return Ok(false);
        }
        let current_cpu = self
            .utilization
            .workload_utilization(workload)
            .await
            .live()
            .map(|u| u.cpu_percent);
        self.roll_back(&mut profile, RollbackReason::Manual, current_cpu, Utc::now())
            .await?;
        Ok(true)
    }

    /// Snapshots of every profile, ordered by deployment key
    pub async fn snapshot(&self) -> Vec<PreScaleSnapshot> {
        let mut snapshots = Vec::new();
        for profile in self.all_profiles() {
            snapshots.push(profile.lock().await.snapshot());
        }
        snapshots.sort_by(|a, b| {
            (&a.namespace, &a.deployment).cmp(&(&b.namespace, &b.deployment))
        });
        snapshots
    }

    pub async fn stats(&self) -> PreScaleStats {
        let deployments = self.snapshot().await;
        PreScaleStats {
            registered: deployments.len(),
            active: deployments
                .iter()
                .filter(|s| s.state == PreScaleState::PreScaling)
                .count(),
            successful_predictions: deployments.iter().map(|s| s.successful_predictions).sum(),
            failed_predictions: deployments.iter().map(|s| s.failed_predictions).sum(),
            deployments,
        }
    }
}

/// Re-check every active episode on a fixed interval, independent of the
/// control loop
pub fn spawn_rollback_worker(
    manager: Arc<PreScaleManager>,
    every: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = every.as_secs(), "Starting pre-scale rollback worker");
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let rolled_back = manager.check_all_rollbacks().await;
                    if !rolled_back.is_empty() {
                        debug!(count = rolled_back.len(), "Rollback sweep restored deployments");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down pre-scale rollback worker");
                    break;
                }
            }
        }
    })
}
