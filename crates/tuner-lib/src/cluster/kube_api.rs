//! kube-rs implementation of [`ClusterApi`]
//!
//! Reads go through the cluster-API [`CallGuard`] with retry; patches go
//! through it with a single attempt.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::{
    HPAScalingPolicy, HPAScalingRules, HorizontalPodAutoscaler, HorizontalPodAutoscalerBehavior,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{Container, Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::{parse_cpu_millicores, ClusterApi, ClusterError, NodeInfo};
use crate::models::{DeploymentSpec, HpaSpec, ScalingBehavior, ScalingRules};
use crate::resilience::{CallError, CallGuard};

/// Field manager recorded on every patch
const FIELD_MANAGER: &str = "hpa-tuner";

/// Cluster access through the Kubernetes API server
pub struct KubeClusterApi {
    client: Client,
    guard: Arc<CallGuard>,
}

impl KubeClusterApi {
    pub fn new(client: Client, guard: Arc<CallGuard>) -> Self {
        Self { client, guard }
    }

    /// Connect using in-cluster config or the local kubeconfig
    pub async fn try_default(guard: Arc<CallGuard>) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        info!("Kubernetes client initialized");
        Ok(Self::new(client, guard))
    }

    async fn fetch_hpa(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HorizontalPodAutoscaler, ClusterError> {
        let hpas: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let hpas = &hpas;
        self.guard
            .call(move || hpas.get(name))
            .await
            .map_err(|e| from_call("HorizontalPodAutoscaler", namespace, name, e))
    }
}

fn from_call(
    kind: &'static str,
    namespace: &str,
    name: &str,
    err: CallError<kube::Error>,
) -> ClusterError {
    match err {
        CallError::CircuitOpen(circuit) => {
            ClusterError::CircuitOpen(format!("circuit '{}' is open", circuit))
        }
        CallError::Failed(kube::Error::Api(resp)) if resp.code == 404 => ClusterError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        CallError::Failed(e) => ClusterError::Api(e),
    }
}

/// Sum of container CPU requests, `None` if no container sets one
fn container_cpu_requests(containers: &[Container]) -> Option<u64> {
    let requests: Vec<u64> = containers
        .iter()
        .filter_map(|c| c.resources.as_ref())
        .filter_map(|r| r.requests.as_ref())
        .filter_map(|req| req.get("cpu"))
        .filter_map(|q| parse_cpu_millicores(&q.0))
        .collect();

    if requests.is_empty() {
        None
    } else {
        Some(requests.iter().sum())
    }
}

fn cpu_target_utilization(hpa: &HorizontalPodAutoscaler) -> Option<i32> {
    let metrics = hpa.spec.as_ref()?.metrics.as_ref()?;
    metrics
        .iter()
        .filter_map(|m| m.resource.as_ref())
        .find(|r| r.name == "cpu")
        .or_else(|| metrics.first().and_then(|m| m.resource.as_ref()))
        .and_then(|r| r.target.average_utilization)
}

/// Metrics list with the CPU utilization target replaced (or added)
fn with_cpu_target(metrics: Vec<MetricSpec>, target: i32) -> Vec<MetricSpec> {
    let mut metrics = metrics;
    let cpu_idx = metrics
        .iter()
        .position(|m| m.resource.as_ref().map(|r| r.name == "cpu").unwrap_or(false))
        .or_else(|| (!metrics.is_empty() && metrics[0].resource.is_some()).then_some(0));

    match cpu_idx {
        Some(idx) => {
            if let Some(resource) = metrics[idx].resource.as_mut() {
                resource.target.type_ = "Utilization".to_string();
                resource.target.average_utilization = Some(target);
                resource.target.average_value = None;
                resource.target.value = None;
            }
        }
        None => metrics.insert(
            0,
            MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(target),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            },
        ),
    }

    metrics
}

fn to_k8s_rules(rules: &ScalingRules) -> HPAScalingRules {
    HPAScalingRules {
        stabilization_window_seconds: Some(rules.stabilization_window_seconds),
        select_policy: Some("Max".to_string()),
        policies: Some(
            rules
                .policies
                .iter()
                .map(|p| HPAScalingPolicy {
                    type_: "Percent".to_string(),
                    value: p.percent,
                    period_seconds: p.period_seconds,
                })
                .collect(),
        ),
    }
}

fn to_k8s_behavior(behavior: &ScalingBehavior) -> HorizontalPodAutoscalerBehavior {
    HorizontalPodAutoscalerBehavior {
        scale_up: Some(to_k8s_rules(&behavior.scale_up)),
        scale_down: Some(to_k8s_rules(&behavior.scale_down)),
    }
}

fn node_info(node: &Node) -> Option<NodeInfo> {
    let name = node.metadata.name.clone()?;
    let status = node.status.as_ref();

    let cpu_of = |map: Option<&BTreeMap<String, Quantity>>| {
        map.and_then(|m| m.get("cpu"))
            .and_then(|q| parse_cpu_millicores(&q.0))
            .unwrap_or(0)
    };

    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    let spec = node.spec.as_ref();
    let cordoned = spec.and_then(|s| s.unschedulable).unwrap_or(false);
    let tainted = spec
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .any(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
        })
        .unwrap_or(false);

    Some(NodeInfo {
        name,
        labels: node.metadata.labels.clone().unwrap_or_default(),
        ready,
        unschedulable: cordoned || tainted,
        capacity_millicores: cpu_of(status.and_then(|s| s.capacity.as_ref())),
        allocatable_millicores: cpu_of(status.and_then(|s| s.allocatable.as_ref())),
    })
}

fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentSpec, ClusterError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployments = &deployments;
        let deployment = self
            .guard
            .call(move || deployments.get(name))
            .await
            .map_err(|e| from_call("Deployment", namespace, name, e))?;

        let spec = deployment.spec.ok_or_else(|| ClusterError::Malformed {
            kind: "Deployment",
            reason: format!("{}/{} has no spec", namespace, name),
        })?;
        let pod_spec = spec.template.spec.unwrap_or_default();

        Ok(DeploymentSpec {
            cpu_request_millicores: container_cpu_requests(&pod_spec.containers)
                .map(|m| m.min(u32::MAX as u64) as u32),
            node_selector: pod_spec.node_selector.unwrap_or_default(),
            replicas: spec.replicas.unwrap_or(1),
        })
    }

    async fn get_hpa(&self, namespace: &str, name: &str) -> Result<HpaSpec, ClusterError> {
        let hpa = self.fetch_hpa(namespace, name).await?;
        let target_utilization = cpu_target_utilization(&hpa);

        let spec = hpa.spec.ok_or_else(|| ClusterError::Malformed {
            kind: "HorizontalPodAutoscaler",
            reason: format!("{}/{} has no spec", namespace, name),
        })?;
        let status = hpa.status.unwrap_or_default();

        Ok(HpaSpec {
            target_utilization,
            min_replicas: spec.min_replicas.unwrap_or(1),
            max_replicas: spec.max_replicas,
            current_replicas: status.current_replicas.unwrap_or(0),
        })
    }

    async fn patch_hpa_target(
        &self,
        namespace: &str,
        name: &str,
        target_utilization: i32,
        behavior: &ScalingBehavior,
    ) -> Result<(), ClusterError> {
        // Merge patches replace lists wholesale, so send the full metrics list
        let current = self.fetch_hpa(namespace, name).await?;
        let metrics = current.spec.and_then(|s| s.metrics).unwrap_or_default();

        let patch = json!({
            "spec": {
                "metrics": with_cpu_target(metrics, target_utilization),
                "behavior": to_k8s_behavior(behavior),
            }
        });

        let hpas: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let hpas = &hpas;
        let patch = &Patch::Merge(patch);
        let params = &PatchParams::apply(FIELD_MANAGER);

        self.guard
            .mutate(move || hpas.patch(name, params, patch))
            .await
            .map_err(|e| from_call("HorizontalPodAutoscaler", namespace, name, e))?;

        debug!(
            namespace = %namespace,
            hpa = %name,
            target_utilization,
            "Patched HPA target"
        );
        Ok(())
    }

    async fn patch_hpa_min_replicas(
        &self,
        namespace: &str,
        name: &str,
        min_replicas: i32,
    ) -> Result<(), ClusterError> {
        let hpas: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        let hpas = &hpas;
        let patch = &Patch::Merge(json!({ "spec": { "minReplicas": min_replicas } }));
        let params = &PatchParams::apply(FIELD_MANAGER);

        self.guard
            .mutate(move || hpas.patch(name, params, patch))
            .await
            .map_err(|e| from_call("HorizontalPodAutoscaler", namespace, name, e))?;

        debug!(namespace = %namespace, hpa = %name, min_replicas, "Patched HPA minReplicas");
        Ok(())
    }

    async fn list_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NodeInfo>, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let nodes = &nodes;
        let params = &ListParams::default().labels(&label_selector(selector));

        let list = self
            .guard
            .call(move || nodes.list(params))
            .await
            .map_err(|e| from_call("Node", "", "*", e))?;

        Ok(list.items.iter().filter_map(node_info).collect())
    }

    async fn requested_millicores_on(&self, node_names: &[String]) -> Result<u64, ClusterError> {
        if node_names.is_empty() {
            return Ok(0);
        }

        let pods: Api<Pod> = Api::all(self.client.clone());
        let pods = &pods;
        let params =
            &ListParams::default().fields("status.phase!=Succeeded,status.phase!=Failed");

        let list = self
            .guard
            .call(move || pods.list(params))
            .await
            .map_err(|e| from_call("Pod", "", "*", e))?;

        let wanted: HashSet<&str> = node_names.iter().map(String::as_str).collect();
        let total = list
            .items
            .iter()
            .filter_map(|pod| pod.spec.as_ref())
            .filter(|spec| {
                spec.node_name
                    .as_deref()
                    .map(|n| wanted.contains(n))
                    .unwrap_or(false)
            })
            .filter_map(|spec| container_cpu_requests(&spec.containers))
            .sum();

        Ok(total)
    }
}
