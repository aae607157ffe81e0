//! Cluster API access
//!
//! The tuner reads Deployments, HPAs, Nodes and Pods and patches HPAs. All of
//! it goes through the [`ClusterApi`] trait so the control logic can be
//! exercised against in-memory clusters.

mod kube_api;
mod quantity;

pub use kube_api::KubeClusterApi;
pub use quantity::parse_cpu_millicores;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::{DeploymentSpec, HpaSpec, ScalingBehavior};

/// Errors from cluster API calls
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("kubernetes API error: {0}")]
    Api(#[from] kube::Error),
    #[error("{0}")]
    CircuitOpen(String),
}

/// Node fields relevant to capacity analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub ready: bool,
    /// Carries a NoSchedule or NoExecute taint, or is cordoned
    pub unschedulable: bool,
    pub capacity_millicores: u64,
    pub allocatable_millicores: u64,
}

impl NodeInfo {
    /// Ready and accepting new pods
    pub fn is_schedulable(&self) -> bool {
        self.ready && !self.unschedulable
    }
}

/// Read/patch access to the Kubernetes objects the tuner works with
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<DeploymentSpec, ClusterError>;

    async fn get_hpa(&self, namespace: &str, name: &str) -> Result<HpaSpec, ClusterError>;

    /// Set the CPU averageUtilization target and the scaling behavior
    async fn patch_hpa_target(
        &self,
        namespace: &str,
        name: &str,
        target_utilization: i32,
        behavior: &ScalingBehavior,
    ) -> Result<(), ClusterError>;

    async fn patch_hpa_min_replicas(
        &self,
        namespace: &str,
        name: &str,
        min_replicas: i32,
    ) -> Result<(), ClusterError>;

    /// Nodes whose labels match every entry of `selector`
    async fn list_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NodeInfo>, ClusterError>;

    /// Sum of CPU requests of non-terminated pods bound to `node_names`
    async fn requested_millicores_on(&self, node_names: &[String]) -> Result<u64, ClusterError>;
}
