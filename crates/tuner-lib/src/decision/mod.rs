//! HPA target decisions

mod behavior;
mod engine;

pub use behavior::synthesize_behavior;
pub use engine::{
    adjusted_base_target, target_band, ApplyOutcome, DecisionInput, EngineConfig,
    HpaDecisionEngine,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::telemetry::PressureLevel;

/// Direction of a target change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Maintain,
    Increase,
    Decrease,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Maintain => "maintain",
            Action::Increase => "increase",
            Action::Decrease => "decrease",
        }
    }

    fn between(current: i32, recommended: i32) -> Self {
        match recommended.cmp(&current) {
            std::cmp::Ordering::Greater => Action::Increase,
            std::cmp::Ordering::Less => Action::Decrease,
            std::cmp::Ordering::Equal => Action::Maintain,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tick's recommendation for a deployment's HPA CPU target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpaDecision {
    pub current_target: i32,
    pub recommended_target: i32,
    pub reason: String,
    pub node_pressure: PressureLevel,
    pub action: Action,
    /// In `[0, 1]`; decisions below the engine's gate are never applied
    pub confidence: f64,
    pub scheduling_spike_detected: bool,
    pub decided_at: DateTime<Utc>,
}

impl HpaDecision {
    fn maintain(
        current_target: i32,
        node_pressure: PressureLevel,
        confidence: f64,
        reason: impl Into<String>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            current_target,
            recommended_target: current_target,
            reason: reason.into(),
            node_pressure,
            action: Action::Maintain,
            confidence,
            scheduling_spike_detected: false,
            decided_at,
        }
    }

    pub fn is_change(&self) -> bool {
        self.recommended_target != self.current_target
    }
}
