//! Main control loop
//!
//! One tick walks the watched deployments in order. For each it senses node
//! and pod load, lets the priority table adjust the base target, decides and
//! applies a new HPA target, then gives the pre-scaler its turn. Read failures
//! skip the deployment for this tick; the next tick re-evaluates from scratch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, ClusterError};
use crate::decision::{ApplyOutcome, DecisionInput, HpaDecisionEngine};
use crate::health::{components, HealthRegistry};
use crate::models::{WatchedDeployment, WorkloadRef};
use crate::observability::TunerMetrics;
use crate::prescale::{PreScaleManager, PreScaleOutcome};
use crate::priority::PriorityManager;
use crate::resilience::CallGuard;
use crate::telemetry::{NodeCapacityAnalyzer, PressureLevel, Telemetry};

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub check_interval: Duration,
    /// Pause between deployments within one tick
    pub inter_deployment_delay: Duration,
    pub startup_window_minutes: i64,
    /// Target before priority and request-size adjustments
    pub base_target: i32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            inter_deployment_delay: Duration::from_millis(500),
            startup_window_minutes: 2,
            base_target: 70,
        }
    }
}

/// What happened to one deployment during a tick
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentReport {
    pub key: String,
    pub apply: ApplyOutcome,
    pub prescale: Option<PreScaleOutcome>,
    /// Lower-priority deployment whose headroom this one was granted
    pub preempted: Option<String>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub deployments: Vec<DeploymentReport>,
    /// Deployments skipped because their cluster objects could not be read
    pub skipped: Vec<(String, String)>,
}

impl TickReport {
    pub fn applied(&self) -> usize {
        self.deployments
            .iter()
            .filter(|d| d.apply == ApplyOutcome::Applied)
            .count()
    }
}

pub struct ControlLoop {
    deployments: Vec<WatchedDeployment>,
    cluster: Arc<dyn ClusterApi>,
    analyzer: Arc<NodeCapacityAnalyzer>,
    engine: Arc<HpaDecisionEngine>,
    priorities: Arc<PriorityManager>,
    prescale: Option<Arc<PreScaleManager>>,
    health: HealthRegistry,
    guards: Vec<Arc<CallGuard>>,
    config: LoopConfig,
    metrics: TunerMetrics,
}

impl ControlLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        deployments: Vec<WatchedDeployment>,
        cluster: Arc<dyn ClusterApi>,
        analyzer: Arc<NodeCapacityAnalyzer>,
        engine: Arc<HpaDecisionEngine>,
        priorities: Arc<PriorityManager>,
        prescale: Option<Arc<PreScaleManager>>,
        health: HealthRegistry,
        config: LoopConfig,
    ) -> Self {
        Self {
            deployments,
            cluster,
            analyzer,
            engine,
            priorities,
            prescale,
            health,
            guards: Vec::new(),
            config,
            metrics: TunerMetrics::new(),
        }
    }

    /// Guards whose circuit state is mirrored into health after each tick
    pub fn with_guards(mut self, guards: Vec<Arc<CallGuard>>) -> Self {
        self.guards = guards;
        self
    }

    /// Run ticks until a shutdown signal arrives
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            deployments = self.deployments.len(),
            interval_secs = self.config.check_interval.as_secs(),
            prescale = self.prescale.is_some(),
            "Starting control loop"
        );
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let report = self.run_tick().await;
                    let elapsed = start.elapsed();
                    self.metrics.observe_tick_duration(elapsed.as_secs_f64());
                    debug!(
                        evaluated = report.deployments.len(),
                        applied = report.applied(),
                        skipped = report.skipped.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Control tick complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down control loop");
                    break;
                }
            }
        }
    }

    /// Evaluate every watched deployment once
    pub async fn run_tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let cluster_reading = self.analyzer.get_node_metrics(&BTreeMap::new()).await;
        let cluster_pressure = cluster_reading.live().map(|m| m.utilization_percent);
        let mut telemetry_degraded = cluster_reading.degraded_reason().map(str::to_string);

        for (i, watched) in self.deployments.iter().enumerate() {
            if i > 0 && !self.config.inter_deployment_delay.is_zero() {
                tokio::time::sleep(self.config.inter_deployment_delay).await;
            }

            match self
                .evaluate_deployment(watched, cluster_pressure, &mut telemetry_degraded)
                .await
            {
                Ok(deployment) => report.deployments.push(deployment),
                Err(e) => {
                    let key = watched.workload().key();
                    warn!(deployment = %key, error = %e, "Skipping deployment this tick");
                    report.skipped.push((key, e.to_string()));
                }
            }
        }

        self.update_health(telemetry_degraded, &report).await;
        report
    }

    async fn evaluate_deployment(
        &self,
        watched: &WatchedDeployment,
        cluster_pressure: Option<f64>,
        telemetry_degraded: &mut Option<String>,
    ) -> Result<DeploymentReport, ClusterError> {
        let workload = watched.workload();
        let key = workload.key();

        let spec = self
            .cluster
            .get_deployment(&workload.namespace, &workload.deployment)
            .await?;
        let hpa = self
            .cluster
            .get_hpa(&workload.namespace, &workload.hpa_name)
            .await?;

        let selector = watched
            .node_selector
            .clone()
            .unwrap_or_else(|| spec.node_selector.clone());
        let node_metrics = self.analyzer.get_node_metrics(&selector).await;
        let pod_usage = self
            .analyzer
            .get_pod_cpu_usage(
                &workload.namespace,
                &workload.deployment,
                self.config.startup_window_minutes,
            )
            .await;

        for reason in [node_metrics.degraded_reason(), pod_usage.degraded_reason()]
            .into_iter()
            .flatten()
        {
            telemetry_degraded.get_or_insert_with(|| reason.to_string());
        }

        // Degraded readings would feed zeros into the pressure history
        let base_target = match &node_metrics {
            Telemetry::Live(node) => {
                self.metrics
                    .set_node_utilization(&workload, node.utilization_percent);
                self.priorities.calculate_target_adjustment(
                    self.priorities.get_priority(&key),
                    self.config.base_target,
                    node.utilization_percent,
                    cluster_pressure.unwrap_or(node.utilization_percent),
                )
            }
            Telemetry::Degraded { .. } => self.config.base_target,
        };

        let current_target = hpa
            .target_utilization
            .unwrap_or(self.engine.config().fallback_target);
        let decision = self.engine.calculate_hpa_target(&DecisionInput {
            workload: &workload,
            current_target,
            base_target,
            cpu_request_millicores: spec.cpu_request_millicores,
            node_metrics: &node_metrics,
            pod_usage: &pod_usage,
        });
        let apply = self.engine.apply_hpa_target(&workload, &decision).await;

        let preempted = match (&node_metrics, cluster_pressure) {
            (Telemetry::Live(node), Some(pressure))
                if node.pressure_level == PressureLevel::Critical =>
            {
                self.grant_preemption(&key, pressure)
            }
            _ => None,
        };

        let prescale = match &self.prescale {
            Some(manager) => Some(self.prescale_step(manager, &workload).await),
            None => None,
        };

        Ok(DeploymentReport {
            key,
            apply,
            prescale,
            preempted,
        })
    }

    /// Register the deployment if an earlier attempt failed, then evaluate it
    async fn prescale_step(
        &self,
        manager: &PreScaleManager,
        workload: &WorkloadRef,
    ) -> PreScaleOutcome {
        if manager.config().enabled && !manager.is_registered(workload) {
            if let Err(e) = manager.register_deployment(workload).await {
                warn!(deployment = %workload.key(), error = %e, "Pre-scale registration failed");
                return PreScaleOutcome::Unregistered;
            }
        }
        manager.check_and_prescale(workload).await
    }

    /// Grant the first eligible preemption for a deployment under critical pressure
    fn grant_preemption(&self, requester: &str, cluster_pressure: f64) -> Option<String> {
        self.priorities
            .preemption_candidates(requester, cluster_pressure)
            .into_iter()
            .find(|target| {
                self.priorities
                    .should_preempt(requester, target, cluster_pressure)
            })
    }

    async fn update_health(&self, telemetry_degraded: Option<String>, report: &TickReport) {
        for guard in &self.guards {
            self.health.observe_guard(guard).await;
        }
        if let Some(reason) = telemetry_degraded {
            self.health
                .set_degraded(components::METRICS_BACKEND, reason)
                .await;
        }

        if !report.skipped.is_empty() && report.deployments.is_empty() {
            self.health
                .set_degraded(
                    components::CONTROL_LOOP,
                    format!("all {} deployments skipped", report.skipped.len()),
                )
                .await;
        } else {
            self.health.set_healthy(components::CONTROL_LOOP).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::NodeInfo;
    use crate::decision::EngineConfig;
    use crate::health::ComponentStatus;
    use crate::models::{DeploymentSpec, HpaSpec};
    use crate::prescale::{ForecastWindow, PreScaleConfig};
    use crate::priority::Priority;
    use crate::telemetry::{AnalyzerConfig, Sample};
    use crate::testing::{MockBackend, MockCluster, PatchRecord, StaticForecaster, StaticUtilization};
    use std::collections::HashMap;

    struct Fixture {
        cluster: Arc<MockCluster>,
        backend: Arc<MockBackend>,
        forecaster: Arc<StaticForecaster>,
        priorities: Arc<PriorityManager>,
        health: HealthRegistry,
        prescale: Arc<PreScaleManager>,
    }

    fn fixture() -> Fixture {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![NodeInfo {
            name: "node-a".to_string(),
            labels: BTreeMap::new(),
            ready: true,
            unschedulable: false,
            capacity_millicores: 10_000,
            allocatable_millicores: 10_000,
        }]);
        cluster.set_requested_millicores(9_500);
        for name in ["web", "worker"] {
            cluster.set_deployment(
                "shop",
                name,
                DeploymentSpec {
                    cpu_request_millicores: Some(500),
                    node_selector: BTreeMap::new(),
                    replicas: 3,
                },
            );
            cluster.set_hpa(
                "shop",
                &format!("{}-hpa", name),
                HpaSpec {
                    target_utilization: Some(70),
                    min_replicas: 2,
                    max_replicas: 10,
                    current_replicas: 3,
                },
            );
        }

        let backend = Arc::new(MockBackend::new());
        // 90% of allocatable in use: critical
        backend.respond(
            "sum(rate(container_cpu_usage_seconds_total",
            vec![Sample {
                labels: HashMap::new(),
                value: 9.0,
            }],
        );
        backend.respond(
            "sum by (pod)",
            vec![Sample {
                labels: HashMap::from([("pod".to_string(), "web-1".to_string())]),
                value: 0.3,
            }],
        );

        let forecaster = Arc::new(StaticForecaster::new());
        let prescale = Arc::new(PreScaleManager::new(
            cluster.clone(),
            forecaster.clone(),
            Arc::new(StaticUtilization::new(60.0, 3)),
            PreScaleConfig::default(),
        ));

        Fixture {
            cluster,
            backend,
            forecaster,
            priorities: Arc::new(PriorityManager::default()),
            health: HealthRegistry::new(),
            prescale,
        }
    }

    fn control_loop(f: &Fixture, deployments: Vec<WatchedDeployment>) -> ControlLoop {
        let analyzer = Arc::new(NodeCapacityAnalyzer::new(
            f.backend.clone(),
            f.cluster.clone(),
            AnalyzerConfig::default(),
        ));
        let engine = Arc::new(HpaDecisionEngine::new(
            f.cluster.clone(),
            EngineConfig::default(),
        ));
        ControlLoop::new(
            deployments,
            f.cluster.clone(),
            analyzer,
            engine,
            f.priorities.clone(),
            Some(f.prescale.clone()),
            f.health.clone(),
            LoopConfig {
                inter_deployment_delay: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn watched(name: &str) -> WatchedDeployment {
        WatchedDeployment {
            namespace: "shop".to_string(),
            name: name.to_string(),
            hpa_name: None,
            priority: Priority::Medium,
            node_selector: None,
        }
    }

    #[tokio::test]
    async fn test_tick_applies_targets_and_prescales() {
        let f = fixture();
        f.prescale
            .register_with_bounds(&watched("web").workload(), 2, 10);
        f.forecaster.set(ForecastWindow::Minutes30, 85.0, 0.8);

        let report = control_loop(&f, vec![watched("web"), watched("worker")])
            .run_tick()
            .await;

        assert_eq!(report.deployments.len(), 2);
        assert_eq!(report.applied(), 2);
        // Sized against the target the same tick just lowered to 60
        assert_eq!(
            report.deployments[0].prescale,
            Some(PreScaleOutcome::PreScaled { min_replicas: 5 })
        );
        // Registered on its first tick
        assert_eq!(
            report.deployments[1].prescale,
            Some(PreScaleOutcome::PreScaled { min_replicas: 5 })
        );

        // Critical pressure lowers both targets
        let targets: Vec<i32> = f
            .cluster
            .patches()
            .iter()
            .filter_map(|p| match p {
                PatchRecord::Target { target, .. } => Some(*target),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec![60, 60]);
        assert_eq!(
            f.health.health().await.components[components::CONTROL_LOOP].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_critical_pressure_grants_preemption_once() {
        let f = fixture();
        f.priorities.set_priority("shop/web", Priority::Critical);
        f.priorities.set_priority("shop/worker", Priority::Low);
        let tuner = control_loop(&f, vec![watched("web"), watched("worker")]);

        let first = tuner.run_tick().await;
        assert_eq!(first.deployments[0].preempted.as_deref(), Some("shop/worker"));
        assert_eq!(first.deployments[1].preempted, None);

        // Pair is cooling down
        let second = tuner.run_tick().await;
        assert_eq!(second.deployments[0].preempted, None);
    }

    #[tokio::test]
    async fn test_failed_registration_is_retried_once_hpa_exists() {
        let f = fixture();
        f.forecaster.set(ForecastWindow::Minutes30, 85.0, 0.8);
        let late = WatchedDeployment {
            hpa_name: Some("web-late-hpa".to_string()),
            ..watched("web")
        };
        assert!(f.prescale.register_deployment(&late.workload()).await.is_err());

        let tuner = control_loop(&f, vec![late.clone()]);
        let missing = tuner.run_tick().await;
        assert_eq!(missing.skipped.len(), 1);
        assert!(!f.prescale.is_registered(&late.workload()));

        f.cluster.set_hpa(
            "shop",
            "web-late-hpa",
            HpaSpec {
                target_utilization: Some(70),
                min_replicas: 2,
                max_replicas: 10,
                current_replicas: 3,
            },
        );
        let report = tuner.run_tick().await;

        assert!(f.prescale.is_registered(&late.workload()));
        assert_eq!(
            report.deployments[0].prescale,
            Some(PreScaleOutcome::PreScaled { min_replicas: 5 })
        );
        assert_eq!(f.cluster.hpa("shop", "web-late-hpa").unwrap().min_replicas, 5);
    }

    #[tokio::test]
    async fn test_missing_hpa_skips_only_that_deployment() {
        let f = fixture();
        let report = control_loop(&f, vec![watched("web"), watched("ghost")])
            .run_tick()
            .await;

        assert_eq!(report.deployments.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "shop/ghost");
    }

    #[tokio::test]
    async fn test_backend_outage_makes_no_changes() {
        let f = fixture();
        f.backend.fail_all("connection refused");

        let report = control_loop(&f, vec![watched("web")]).run_tick().await;

        assert_eq!(report.deployments[0].apply, ApplyOutcome::Unchanged);
        assert!(f.cluster.patches().is_empty());
        let health = f.health.health().await;
        assert_eq!(
            health.components[components::METRICS_BACKEND].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_loop_exits_on_shutdown() {
        let f = fixture();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(control_loop(&f, vec![watched("web")]).run(rx));

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop stopped")
            .unwrap();
    }
}
