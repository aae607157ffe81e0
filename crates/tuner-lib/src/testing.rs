//! In-memory collaborators for unit tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::cluster::{ClusterApi, ClusterError, NodeInfo};
use crate::models::{DeploymentSpec, HpaSpec, ScalingBehavior, WorkloadRef};
use crate::prescale::{ForecastError, ForecastWindow, Forecaster, Prediction};
use crate::telemetry::{
    MetricsBackend, Sample, Telemetry, TelemetryError, UtilizationSource, WorkloadUtilization,
};

/// A patch the mock cluster received
#[derive(Debug, Clone, PartialEq)]
pub enum PatchRecord {
    Target {
        namespace: String,
        name: String,
        target: i32,
        behavior: ScalingBehavior,
    },
    MinReplicas {
        namespace: String,
        name: String,
        min_replicas: i32,
    },
}

#[derive(Default)]
pub struct MockCluster {
    deployments: Mutex<HashMap<String, DeploymentSpec>>,
    hpas: Mutex<HashMap<String, HpaSpec>>,
    nodes: Mutex<Vec<NodeInfo>>,
    requested_millicores: Mutex<u64>,
    patches: Mutex<Vec<PatchRecord>>,
    fail_patches: AtomicBool,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_deployment(&self, namespace: &str, name: &str, spec: DeploymentSpec) {
        self.deployments
            .lock()
            .unwrap()
            .insert(format!("{}/{}", namespace, name), spec);
    }

    pub fn set_hpa(&self, namespace: &str, name: &str, spec: HpaSpec) {
        self.hpas
            .lock()
            .unwrap()
            .insert(format!("{}/{}", namespace, name), spec);
    }

    pub fn hpa(&self, namespace: &str, name: &str) -> Option<HpaSpec> {
        self.hpas
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        *self.nodes.lock().unwrap() = nodes;
    }

    pub fn set_requested_millicores(&self, millicores: u64) {
        *self.requested_millicores.lock().unwrap() = millicores;
    }

    pub fn fail_patches(&self, fail: bool) {
        self.fail_patches.store(fail, Ordering::SeqCst);
    }

    pub fn patches(&self) -> Vec<PatchRecord> {
        self.patches.lock().unwrap().clone()
    }

    fn patch_error(&self, name: &str) -> Option<ClusterError> {
        self.fail_patches
            .load(Ordering::SeqCst)
            .then(|| ClusterError::Malformed {
                kind: "HorizontalPodAutoscaler",
                reason: format!("simulated patch failure for {}", name),
            })
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentSpec, ClusterError> {
        self.deployments
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Deployment",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn get_hpa(&self, namespace: &str, name: &str) -> Result<HpaSpec, ClusterError> {
        self.hpa(namespace, name).ok_or_else(|| ClusterError::NotFound {
            kind: "HorizontalPodAutoscaler",
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    async fn patch_hpa_target(
        &self,
        namespace: &str,
        name: &str,
        target_utilization: i32,
        behavior: &ScalingBehavior,
    ) -> Result<(), ClusterError> {
        if let Some(e) = self.patch_error(name) {
            return Err(e);
        }
        if let Some(hpa) = self
            .hpas
            .lock()
            .unwrap()
            .get_mut(&format!("{}/{}", namespace, name))
        {
            hpa.target_utilization = Some(target_utilization);
        }
        self.patches.lock().unwrap().push(PatchRecord::Target {
            namespace: namespace.to_string(),
            name: name.to_string(),
            target: target_utilization,
            behavior: behavior.clone(),
        });
        Ok(())
    }

    async fn patch_hpa_min_replicas(
        &self,
        namespace: &str,
        name: &str,
        min_replicas: i32,
    ) -> Result<(), ClusterError> {
        if let Some(e) = self.patch_error(name) {
            return Err(e);
        }
        if let Some(hpa) = self
            .hpas
            .lock()
            .unwrap()
            .get_mut(&format!("{}/{}", namespace, name))
        {
            hpa.min_replicas = min_replicas;
        }
        self.patches.lock().unwrap().push(PatchRecord::MinReplicas {
            namespace: namespace.to_string(),
            name: name.to_string(),
            min_replicas,
        });
        Ok(())
    }

    async fn list_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NodeInfo>, ClusterError> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| selector.iter().all(|(k, v)| n.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn requested_millicores_on(&self, _node_names: &[String]) -> Result<u64, ClusterError> {
        Ok(*self.requested_millicores.lock().unwrap())
    }
}

/// Metrics backend answering queries by substring match
#[derive(Default)]
pub struct MockBackend {
    responses: Mutex<Vec<(String, Vec<Sample>)>>,
    failure: Mutex<Option<String>>,
    queries: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries containing `pattern`; earlier patterns win
    pub fn respond(&self, pattern: &str, samples: Vec<Sample>) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), samples));
    }

    pub fn fail_all(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetricsBackend for MockBackend {
    async fn query(&self, promql: &str) -> Result<Vec<Sample>, TelemetryError> {
        self.queries.lock().unwrap().push(promql.to_string());
        if let Some(reason) = self.failure.lock().unwrap().clone() {
            return Err(TelemetryError::Query {
                query: promql.to_string(),
                reason,
            });
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| promql.contains(pattern.as_str()))
            .map(|(_, samples)| samples.clone())
            .unwrap_or_default())
    }
}

/// Forecaster returning fixed predictions per window
#[derive(Default)]
pub struct StaticForecaster {
    predictions: Mutex<HashMap<ForecastWindow, Prediction>>,
    failing: AtomicBool,
    calls: AtomicUsize,
    validations: Mutex<Vec<(String, f64, f64, String)>>,
}

impl StaticForecaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, window: ForecastWindow, predicted_value: f64, confidence: f64) {
        self.predictions.lock().unwrap().insert(
            window,
            Prediction {
                predicted_value,
                confidence,
                lower_bound: predicted_value * 0.9,
                upper_bound: predicted_value * 1.1,
                model_used: "static".to_string(),
            },
        );
    }

    pub fn clear(&self) {
        self.predictions.lock().unwrap().clear();
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn validations(&self) -> Vec<(String, f64, f64, String)> {
        self.validations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Forecaster for StaticForecaster {
    async fn predict(
        &self,
        _deployment: &str,
        window: ForecastWindow,
    ) -> Result<Option<Prediction>, ForecastError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ForecastError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(self.predictions.lock().unwrap().get(&window).cloned())
    }

    async fn validate_prediction(
        &self,
        deployment: &str,
        predicted: f64,
        actual: f64,
        model: &str,
    ) -> Result<(), ForecastError> {
        self.validations.lock().unwrap().push((
            deployment.to_string(),
            predicted,
            actual,
            model.to_string(),
        ));
        Ok(())
    }
}

/// Utilization source with a settable reading
pub struct StaticUtilization {
    reading: Mutex<Telemetry<WorkloadUtilization>>,
}

impl StaticUtilization {
    pub fn new(cpu_percent: f64, replicas: u32) -> Self {
        Self {
            reading: Mutex::new(Telemetry::Live(WorkloadUtilization {
                cpu_percent,
                replicas,
            })),
        }
    }

    pub fn set_cpu(&self, cpu_percent: f64) {
        let mut reading = self.reading.lock().unwrap();
        let replicas = reading.value().replicas;
        *reading = Telemetry::Live(WorkloadUtilization {
            cpu_percent,
            replicas,
        });
    }

    pub fn set_degraded(&self, reason: &str) {
        *self.reading.lock().unwrap() = Telemetry::degraded(
            WorkloadUtilization {
                cpu_percent: 0.0,
                replicas: 1,
            },
            reason,
        );
    }
}

#[async_trait]
impl UtilizationSource for StaticUtilization {
    async fn workload_utilization(&self, _workload: &WorkloadRef) -> Telemetry<WorkloadUtilization> {
        self.reading.lock().unwrap().clone()
    }
}
