//! Closed-loop HPA tuning
//!
//! This crate provides the core functionality for:
//! - Node pressure sensing with spike-damped CPU usage
//! - HPA CPU target decisions and behavior synthesis
//! - Priority-weighted target arbitration between workloads
//! - Predictive pre-scaling of HPA replica floors with automatic rollback
//! - Circuit breaking, rate limiting and retry for every external call
//! - Health checks and observability

pub mod cluster;
pub mod controller;
pub mod decision;
pub mod health;
pub mod models;
pub mod observability;
pub mod prescale;
pub mod priority;
pub mod resilience;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{ControlLoop, LoopConfig, TickReport};
pub use decision::{Action, HpaDecision, HpaDecisionEngine};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, TunerMetrics};
pub use prescale::{PreScaleManager, PreScaleSnapshot, PreScaleStats};
pub use priority::{Priority, PriorityManager};
