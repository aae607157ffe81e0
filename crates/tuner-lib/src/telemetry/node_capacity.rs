//! Node capacity and pod CPU analysis
//!
//! Node usage is a blend of a long-window and a short-window CPU rate: the
//! long window damps single-sample scheduling spikes, the short window keeps
//! the reading responsive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{MetricsBackend, Telemetry};
use crate::cluster::{ClusterApi, NodeInfo};
use crate::models::WorkloadRef;

/// Tunables for node pressure sensing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_long_window")]
    pub long_window: String,
    #[serde(default = "default_short_window")]
    pub short_window: String,
    /// Weight of the long-window rate; the short window gets the rest
    #[serde(default = "default_long_window_weight")]
    pub long_window_weight: f64,
    #[serde(default = "default_safe_utilization")]
    pub safe_utilization_percent: f64,
    #[serde(default = "default_safe_headroom")]
    pub safe_headroom_percent: f64,
    #[serde(default = "default_warning_utilization")]
    pub warning_utilization_percent: f64,
    #[serde(default = "default_warning_headroom")]
    pub warning_headroom_percent: f64,
    /// Pods younger than this are left out of the CPU average
    #[serde(default = "default_startup_window_minutes")]
    pub startup_window_minutes: i64,
}

fn default_long_window() -> String {
    "10m".to_string()
}

fn default_short_window() -> String {
    "5m".to_string()
}

fn default_long_window_weight() -> f64 {
    0.7
}

fn default_safe_utilization() -> f64 {
    65.0
}

fn default_safe_headroom() -> f64 {
    30.0
}

fn default_warning_utilization() -> f64 {
    80.0
}

fn default_warning_headroom() -> f64 {
    15.0
}

fn default_startup_window_minutes() -> i64 {
    2
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            long_window: default_long_window(),
            short_window: default_short_window(),
            long_window_weight: default_long_window_weight(),
            safe_utilization_percent: default_safe_utilization(),
            safe_headroom_percent: default_safe_headroom(),
            warning_utilization_percent: default_warning_utilization(),
            warning_headroom_percent: default_warning_headroom(),
            startup_window_minutes: default_startup_window_minutes(),
        }
    }
}

/// Node CPU pressure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Safe,
    Warning,
    Critical,
}

impl PressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Safe => "safe",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify node pressure from utilization and schedulable headroom (both percent)
pub fn classify_pressure(
    utilization_percent: f64,
    headroom_percent: f64,
    config: &AnalyzerConfig,
) -> PressureLevel {
    if utilization_percent < config.safe_utilization_percent
        && headroom_percent > config.safe_headroom_percent
    {
        PressureLevel::Safe
    } else if utilization_percent < config.warning_utilization_percent
        && headroom_percent > config.warning_headroom_percent
    {
        PressureLevel::Warning
    } else {
        PressureLevel::Critical
    }
}

/// Aggregate CPU picture of the nodes a deployment can schedule onto
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub total_capacity_cores: f64,
    pub total_allocatable_cores: f64,
    /// Blended long/short window usage
    pub total_used_cores: f64,
    pub total_requested_cores: f64,
    /// Allocatable minus requested, never negative
    pub schedulable_capacity: f64,
    pub utilization_percent: f64,
    pub pressure_level: PressureLevel,
    pub tracked_nodes: Vec<String>,
    pub node_selector: BTreeMap<String, String>,
}

impl NodeMetrics {
    /// All-zero reading used as the degraded fallback
    pub fn zeroed(node_selector: &BTreeMap<String, String>) -> Self {
        Self {
            total_capacity_cores: 0.0,
            total_allocatable_cores: 0.0,
            total_used_cores: 0.0,
            total_requested_cores: 0.0,
            schedulable_capacity: 0.0,
            utilization_percent: 0.0,
            pressure_level: PressureLevel::Safe,
            tracked_nodes: Vec::new(),
            node_selector: node_selector.clone(),
        }
    }

    /// Build a reading from schedulable nodes, their pod requests and the two usage rates
    pub fn from_parts(
        nodes: &[NodeInfo],
        requested_millicores: u64,
        long_rate_cores: f64,
        short_rate_cores: f64,
        node_selector: &BTreeMap<String, String>,
        config: &AnalyzerConfig,
    ) -> Self {
        let total_capacity_cores =
            nodes.iter().map(|n| n.capacity_millicores).sum::<u64>() as f64 / 1000.0;
        let total_allocatable_cores =
            nodes.iter().map(|n| n.allocatable_millicores).sum::<u64>() as f64 / 1000.0;
        let total_requested_cores = requested_millicores as f64 / 1000.0;

        let weight = config.long_window_weight.clamp(0.0, 1.0);
        let total_used_cores = weight * long_rate_cores + (1.0 - weight) * short_rate_cores;

        let schedulable_capacity = (total_allocatable_cores - total_requested_cores).max(0.0);
        let utilization_percent = if total_allocatable_cores > 0.0 {
            total_used_cores / total_allocatable_cores * 100.0
        } else {
            0.0
        };

        let mut metrics = Self {
            total_capacity_cores,
            total_allocatable_cores,
            total_used_cores,
            total_requested_cores,
            schedulable_capacity,
            utilization_percent,
            pressure_level: PressureLevel::Safe,
            tracked_nodes: nodes.iter().map(|n| n.name.clone()).collect(),
            node_selector: node_selector.clone(),
        };
        metrics.pressure_level =
            classify_pressure(utilization_percent, metrics.headroom_percent(), config);
        metrics
    }

    /// Schedulable capacity as a percentage of allocatable
    pub fn headroom_percent(&self) -> f64 {
        if self.total_allocatable_cores > 0.0 {
            self.schedulable_capacity / self.total_allocatable_cores * 100.0
        } else {
            0.0
        }
    }
}

/// Per-pod CPU usage of one deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodCpuUsage {
    pub avg_cpu_cores: f64,
    pub replica_count: u32,
    /// Age of the youngest running pod
    pub youngest_pod_age_secs: Option<i64>,
    /// True when the average excludes cold-starting pods
    pub cold_start_filtered: bool,
}

impl PodCpuUsage {
    /// Zero usage on one replica
    pub fn fallback() -> Self {
        Self {
            avg_cpu_cores: 0.0,
            replica_count: 1,
            youngest_pod_age_secs: None,
            cold_start_filtered: false,
        }
    }

    /// A pod younger than `max_age_secs` is running
    pub fn has_pod_younger_than(&self, max_age_secs: i64) -> bool {
        self.youngest_pod_age_secs
            .map(|age| age < max_age_secs)
            .unwrap_or(false)
    }
}

/// Average per-pod usage, leaving out pods younger than the startup window
///
/// Pods without a known start time count as settled. When every pod is still
/// inside the window the unfiltered average is used instead.
pub fn summarize_pod_usage(
    usage_by_pod: &HashMap<String, f64>,
    start_time_by_pod: &HashMap<String, f64>,
    startup_window_minutes: i64,
    replica_count: Option<u32>,
    now: DateTime<Utc>,
) -> Option<PodCpuUsage> {
    if usage_by_pod.is_empty() {
        return None;
    }

    let now_secs = now.timestamp() as f64;
    let window_secs = (startup_window_minutes * 60) as f64;
    let age_of = |pod: &str| start_time_by_pod.get(pod).map(|start| now_secs - start);

    let settled: Vec<f64> = usage_by_pod
        .iter()
        .filter(|(pod, _)| age_of(pod.as_str()).map(|age| age >= window_secs).unwrap_or(true))
        .map(|(_, cores)| *cores)
        .collect();

    let cold_start_filtered = !settled.is_empty() && settled.len() < usage_by_pod.len();
    let counted: Vec<f64> = if settled.is_empty() {
        usage_by_pod.values().copied().collect()
    } else {
        settled
    };
    let avg_cpu_cores = counted.iter().sum::<f64>() / counted.len() as f64;

    let youngest_pod_age_secs = usage_by_pod
        .keys()
        .filter_map(|pod| age_of(pod.as_str()))
        .map(|age| age.max(0.0) as i64)
        .min();

    Some(PodCpuUsage {
        avg_cpu_cores,
        replica_count: replica_count.unwrap_or(usage_by_pod.len() as u32).max(1),
        youngest_pod_age_secs,
        cold_start_filtered,
    })
}

/// Current CPU utilization of a deployment relative to its request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkloadUtilization {
    pub cpu_percent: f64,
    pub replicas: u32,
}

/// Source of per-deployment CPU utilization
#[async_trait]
pub trait UtilizationSource: Send + Sync {
    async fn workload_utilization(&self, workload: &WorkloadRef) -> Telemetry<WorkloadUtilization>;
}

/// Turns node and pod telemetry into per-deployment readings
pub struct NodeCapacityAnalyzer {
    backend: Arc<dyn MetricsBackend>,
    cluster: Arc<dyn ClusterApi>,
    config: AnalyzerConfig,
}

impl NodeCapacityAnalyzer {
    pub fn new(
        backend: Arc<dyn MetricsBackend>,
        cluster: Arc<dyn ClusterApi>,
        config: AnalyzerConfig,
    ) -> Self {
        Self {
            backend,
            cluster,
            config,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Node reading for the schedulable nodes matching `selector`
    ///
    /// An empty selector tracks every schedulable node in the cluster.
    pub async fn get_node_metrics(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Telemetry<NodeMetrics> {
        let degraded = |reason: String| {
            warn!(selector = ?selector, reason = %reason, "Node telemetry degraded");
            Telemetry::degraded(NodeMetrics::zeroed(selector), reason)
        };

        let nodes: Vec<NodeInfo> = match self.cluster.list_nodes(selector).await {
            Ok(nodes) => nodes.into_iter().filter(NodeInfo::is_schedulable).collect(),
            Err(e) => return degraded(format!("listing nodes failed: {}", e)),
        };
        if nodes.is_empty() {
            return degraded("no schedulable nodes match the selector".to_string());
        }

        let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let requested = match self.cluster.requested_millicores_on(&names).await {
            Ok(m) => m,
            Err(e) => return degraded(format!("reading pod requests failed: {}", e)),
        };

        let long_query = node_usage_query(&names, &self.config.long_window);
        let short_query = node_usage_query(&names, &self.config.short_window);
        let long_rate = match self.backend.query_scalar(&long_query).await {
            Ok(v) => v,
            Err(e) => return degraded(format!("long-window usage query failed: {}", e)),
        };
        let short_rate = match self.backend.query_scalar(&short_query).await {
            Ok(v) => v,
            Err(e) => return degraded(format!("short-window usage query failed: {}", e)),
        };

        let metrics =
            NodeMetrics::from_parts(&nodes, requested, long_rate, short_rate, selector, &self.config);
        debug!(
            nodes = metrics.tracked_nodes.len(),
            utilization = metrics.utilization_percent,
            pressure = %metrics.pressure_level,
            "Computed node metrics"
        );
        Telemetry::Live(metrics)
    }

    pub async fn get_pod_cpu_usage(
        &self,
        namespace: &str,
        deployment: &str,
        startup_window_minutes: i64,
    ) -> Telemetry<PodCpuUsage> {
        self.get_pod_cpu_usage_at(namespace, deployment, startup_window_minutes, Utc::now())
            .await
    }

    /// Average CPU cores per pod with cold-start filtering, as of `now`
    pub async fn get_pod_cpu_usage_at(
        &self,
        namespace: &str,
        deployment: &str,
        startup_window_minutes: i64,
        now: DateTime<Utc>,
    ) -> Telemetry<PodCpuUsage> {
        let pod_pattern = deployment_pod_pattern(deployment);
        let usage_query = format!(
            "sum by (pod) (rate(container_cpu_usage_seconds_total{{namespace=\"{}\",pod=~\"{}\",container!=\"\",container!=\"POD\"}}[{}]))",
            namespace, pod_pattern, self.config.short_window
        );
        let start_query = format!(
            "kube_pod_start_time{{namespace=\"{}\",pod=~\"{}\"}}",
            namespace, pod_pattern
        );
        let replica_query = format!(
            "kube_deployment_status_replicas{{namespace=\"{}\",deployment=\"{}\"}}",
            namespace, deployment
        );

        let usage = match self.backend.query(&usage_query).await {
            Ok(samples) => by_pod(samples),
            Err(e) => {
                warn!(namespace, deployment, error = %e, "Pod CPU query failed");
                return Telemetry::degraded(PodCpuUsage::fallback(), e.to_string());
            }
        };

        // Start times and replica count only refine the reading
        let start_times = match self.backend.query(&start_query).await {
            Ok(samples) => by_pod(samples),
            Err(e) => {
                debug!(namespace, deployment, error = %e, "Pod start times unavailable");
                HashMap::new()
            }
        };
        let replicas = self
            .backend
            .query_scalar(&replica_query)
            .await
            .ok()
            .map(|v| v.max(0.0) as u32);

        match summarize_pod_usage(&usage, &start_times, startup_window_minutes, replicas, now) {
            Some(summary) => Telemetry::Live(summary),
            None => Telemetry::degraded(PodCpuUsage::fallback(), "no running pods reported usage"),
        }
    }
}

#[async_trait]
impl UtilizationSource for NodeCapacityAnalyzer {
    async fn workload_utilization(&self, workload: &WorkloadRef) -> Telemetry<WorkloadUtilization> {
        let fallback = WorkloadUtilization {
            cpu_percent: 0.0,
            replicas: 1,
        };

        let request_m = match self
            .cluster
            .get_deployment(&workload.namespace, &workload.deployment)
            .await
        {
            Ok(spec) => match spec.cpu_request_millicores {
                Some(m) if m > 0 => m,
                _ => return Telemetry::degraded(fallback, "deployment has no CPU request"),
            },
            Err(e) => return Telemetry::degraded(fallback, e.to_string()),
        };

        let usage = self
            .get_pod_cpu_usage(
                &workload.namespace,
                &workload.deployment,
                self.config.startup_window_minutes,
            )
            .await;
        usage.map(|u| WorkloadUtilization {
            cpu_percent: u.avg_cpu_cores * 1000.0 / request_m as f64 * 100.0,
            replicas: u.replica_count,
        })
    }
}

fn by_pod(samples: Vec<super::Sample>) -> HashMap<String, f64> {
    samples
        .into_iter()
        .filter_map(|s| s.label("pod").map(|pod| (pod.to_string(), s.value)))
        .collect()
}

/// Pods named `<deployment>-<replicaset hash>-<pod hash>`
///
/// PromQL matchers are fully anchored, so `web` does not pick up `web-api-*` pods.
fn deployment_pod_pattern(deployment: &str) -> String {
    format!("{}-[a-z0-9]+-[a-z0-9]+", deployment.replace('.', "\\\\."))
}

fn node_usage_query(node_names: &[String], window: &str) -> String {
    let alternation = node_names
        .iter()
        .map(|n| n.replace('.', "\\\\."))
        .collect::<Vec<_>>()
        .join("|");
    format!(
        "sum(rate(container_cpu_usage_seconds_total{{container!=\"\",container!=\"POD\",node=~\"^({})$\"}}[{}]))",
        alternation, window
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeploymentSpec;
    use crate::telemetry::Sample;
    use crate::testing::{MockBackend, MockCluster};
    use chrono::TimeZone;

    fn node(name: &str, allocatable_m: u64) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            labels: BTreeMap::from([("pool".to_string(), "general".to_string())]),
            ready: true,
            unschedulable: false,
            capacity_millicores: allocatable_m + 100,
            allocatable_millicores: allocatable_m,
        }
    }

    fn sample(pod: &str, value: f64) -> Sample {
        Sample {
            labels: HashMap::from([("pod".to_string(), pod.to_string())]),
            value,
        }
    }

    #[test]
    fn test_classify_pressure_bands() {
        let cfg = AnalyzerConfig::default();
        assert_eq!(classify_pressure(50.0, 40.0, &cfg), PressureLevel::Safe);
        // Low usage but little room to schedule
        assert_eq!(classify_pressure(50.0, 20.0, &cfg), PressureLevel::Warning);
        assert_eq!(classify_pressure(70.0, 40.0, &cfg), PressureLevel::Warning);
        assert_eq!(classify_pressure(85.0, 40.0, &cfg), PressureLevel::Critical);
        assert_eq!(classify_pressure(50.0, 10.0, &cfg), PressureLevel::Critical);
    }

    #[test]
    fn test_from_parts_blends_windows() {
        let nodes = vec![node("a", 4000), node("b", 4000)];
        let metrics = NodeMetrics::from_parts(
            &nodes,
            2000,
            4.0,
            2.0,
            &BTreeMap::new(),
            &AnalyzerConfig::default(),
        );

        assert!((metrics.total_used_cores - 3.4).abs() < 1e-9);
        assert_eq!(metrics.total_allocatable_cores, 8.0);
        assert_eq!(metrics.schedulable_capacity, 6.0);
        assert!((metrics.utilization_percent - 42.5).abs() < 1e-9);
        assert_eq!(metrics.pressure_level, PressureLevel::Safe);
        assert_eq!(metrics.tracked_nodes, vec!["a", "b"]);
    }

    #[test]
    fn test_schedulable_capacity_never_negative() {
        let metrics = NodeMetrics::from_parts(
            &[node("a", 1000)],
            1500,
            0.2,
            0.2,
            &BTreeMap::new(),
            &AnalyzerConfig::default(),
        );
        assert_eq!(metrics.schedulable_capacity, 0.0);
        assert_eq!(metrics.pressure_level, PressureLevel::Critical);
    }

    #[test]
    fn test_summarize_filters_cold_starts() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let t = now.timestamp() as f64;
        let usage = HashMap::from([
            ("web-1".to_string(), 0.2),
            ("web-2".to_string(), 0.4),
            ("web-3".to_string(), 1.5),
        ]);
        let starts = HashMap::from([
            ("web-1".to_string(), t - 3600.0),
            ("web-2".to_string(), t - 600.0),
            ("web-3".to_string(), t - 30.0),
        ]);

        let summary = summarize_pod_usage(&usage, &starts, 2, Some(3), now).unwrap();
        assert!((summary.avg_cpu_cores - 0.3).abs() < 1e-9);
        assert!(summary.cold_start_filtered);
        assert_eq!(summary.replica_count, 3);
        assert_eq!(summary.youngest_pod_age_secs, Some(30));
        assert!(summary.has_pod_younger_than(180));
    }

    #[test]
    fn test_summarize_falls_back_when_all_pods_are_new() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let t = now.timestamp() as f64;
        let usage = HashMap::from([("web-1".to_string(), 0.5), ("web-2".to_string(), 1.5)]);
        let starts = HashMap::from([("web-1".to_string(), t - 10.0), ("web-2".to_string(), t - 20.0)]);

        let summary = summarize_pod_usage(&usage, &starts, 2, None, now).unwrap();
        assert!((summary.avg_cpu_cores - 1.0).abs() < 1e-9);
        assert!(!summary.cold_start_filtered);
        assert_eq!(summary.replica_count, 2);
    }

    #[test]
    fn test_summarize_empty_is_none() {
        assert!(summarize_pod_usage(&HashMap::new(), &HashMap::new(), 2, None, Utc::now()).is_none());
    }

    #[test]
    fn test_node_usage_query_escapes_dots() {
        let q = node_usage_query(&["ip-10-0-0-1.ec2.internal".to_string()], "10m");
        assert!(q.contains("ip-10-0-0-1\\\\.ec2\\\\.internal"));
        assert!(q.ends_with("[10m]))"));
    }

    #[test]
    fn test_pod_pattern_excludes_sibling_deployments() {
        assert_eq!(deployment_pod_pattern("web"), "web-[a-z0-9]+-[a-z0-9]+");
        assert_eq!(
            deployment_pod_pattern("api.v2"),
            "api\\\\.v2-[a-z0-9]+-[a-z0-9]+"
        );
    }

    #[tokio::test]
    async fn test_get_node_metrics_live() {
        let cluster = Arc::new(MockCluster::new());
        let mut tainted = node("c", 4000);
        tainted.unschedulable = true;
        cluster.set_nodes(vec![node("a", 4000), node("b", 4000), tainted]);
        cluster.set_requested_millicores(2000);

        let backend = Arc::new(MockBackend::new());
        backend.respond("[10m]", vec![sample("", 4.0)]);
        backend.respond("[5m]", vec![sample("", 2.0)]);

        let analyzer = NodeCapacityAnalyzer::new(backend, cluster, AnalyzerConfig::default());
        let reading = analyzer.get_node_metrics(&BTreeMap::new()).await;

        let metrics = reading.live().expect("live reading");
        assert_eq!(metrics.tracked_nodes, vec!["a", "b"]);
        assert!((metrics.total_used_cores - 3.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_get_node_metrics_degrades_on_backend_failure() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![node("a", 4000)]);
        let backend = Arc::new(MockBackend::new());
        backend.fail_all("connection refused");

        let analyzer = NodeCapacityAnalyzer::new(backend, cluster, AnalyzerConfig::default());
        let reading = analyzer.get_node_metrics(&BTreeMap::new()).await;

        assert!(!reading.is_live());
        assert_eq!(reading.value().total_allocatable_cores, 0.0);
        assert!(reading.degraded_reason().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_get_node_metrics_degrades_without_nodes() {
        let analyzer = NodeCapacityAnalyzer::new(
            Arc::new(MockBackend::new()),
            Arc::new(MockCluster::new()),
            AnalyzerConfig::default(),
        );
        let reading = analyzer.get_node_metrics(&BTreeMap::new()).await;
        assert!(!reading.is_live());
    }

    #[tokio::test]
    async fn test_pod_usage_degrades_to_single_idle_replica() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_all("timeout");
        let analyzer = NodeCapacityAnalyzer::new(
            backend,
            Arc::new(MockCluster::new()),
            AnalyzerConfig::default(),
        );

        let reading = analyzer.get_pod_cpu_usage("shop", "web", 2).await;
        assert!(!reading.is_live());
        assert_eq!(reading.value().avg_cpu_cores, 0.0);
        assert_eq!(reading.value().replica_count, 1);
    }

    #[tokio::test]
    async fn test_workload_utilization_relative_to_request() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_deployment(
            "shop",
            "web",
            DeploymentSpec {
                cpu_request_millicores: Some(200),
                node_selector: BTreeMap::new(),
                replicas: 2,
            },
        );
        let backend = Arc::new(MockBackend::new());
        backend.respond(
            "container_cpu_usage_seconds_total",
            vec![sample("web-1", 0.1), sample("web-2", 0.2)],
        );

        let analyzer = NodeCapacityAnalyzer::new(backend, cluster, AnalyzerConfig::default());
        let reading = analyzer
            .workload_utilization(&WorkloadRef::new("shop", "web"))
            .await;

        let util = reading.live().expect("live reading");
        assert!((util.cpu_percent - 75.0).abs() < 1e-9);
        assert_eq!(util.replicas, 2);
    }
}
