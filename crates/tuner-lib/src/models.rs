//! Core data models shared by the tuner components

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::priority::Priority;

/// A watched deployment and the HPA that scales it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub deployment: String,
    pub hpa_name: String,
}

impl WorkloadRef {
    /// Reference with the conventional `<deployment>-hpa` HPA name
    pub fn new(namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        let deployment = deployment.into();
        Self {
            namespace: namespace.into(),
            hpa_name: format!("{}-hpa", deployment),
            deployment,
        }
    }

    pub fn with_hpa_name(mut self, hpa_name: impl Into<String>) -> Self {
        self.hpa_name = hpa_name.into();
        self
    }

    /// `namespace/deployment`, the key for all per-deployment state
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.deployment)
    }
}

impl std::fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.deployment)
    }
}

/// Deployment entry as it appears in the controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedDeployment {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub hpa_name: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Overrides the deployment's own nodeSelector for capacity analysis
    #[serde(default)]
    pub node_selector: Option<BTreeMap<String, String>>,
}

impl WatchedDeployment {
    pub fn workload(&self) -> WorkloadRef {
        let workload = WorkloadRef::new(&self.namespace, &self.name);
        match &self.hpa_name {
            Some(hpa) => workload.with_hpa_name(hpa),
            None => workload,
        }
    }
}

/// Deployment fields read from the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Sum of container CPU requests of the pod template
    pub cpu_request_millicores: Option<u32>,
    pub node_selector: BTreeMap<String, String>,
    pub replicas: i32,
}

/// HorizontalPodAutoscaler fields read from the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpaSpec {
    /// `spec.metrics[cpu].resource.target.averageUtilization`
    pub target_utilization: Option<i32>,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub current_replicas: i32,
}

/// One HPA scaling policy (percent of current replicas per period)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub percent: i32,
    pub period_seconds: i32,
}

/// Rules for one scaling direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingRules {
    pub stabilization_window_seconds: i32,
    pub policies: Vec<ScalingPolicy>,
}

/// `spec.behavior` of an HPA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingBehavior {
    pub scale_up: ScalingRules,
    pub scale_down: ScalingRules,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_defaults_hpa_name() {
        let workload = WorkloadRef::new("shop", "checkout");
        assert_eq!(workload.hpa_name, "checkout-hpa");
        assert_eq!(workload.key(), "shop/checkout");
    }

    #[test]
    fn test_watched_deployment_overrides_hpa_name() {
        let watched: WatchedDeployment = serde_json::from_str(
            r#"{"namespace": "shop", "name": "checkout", "hpa_name": "checkout-autoscaler", "priority": "critical"}"#,
        )
        .unwrap();

        let workload = watched.workload();
        assert_eq!(workload.hpa_name, "checkout-autoscaler");
        assert_eq!(watched.priority, Priority::Critical);
        assert!(watched.node_selector.is_none());
    }
}
