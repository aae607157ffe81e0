//! HPA `spec.behavior` synthesis

use crate::models::{ScalingBehavior, ScalingPolicy, ScalingRules};
use crate::telemetry::PressureLevel;

fn rules(stabilization_window_seconds: i32, percent: i32) -> ScalingRules {
    ScalingRules {
        stabilization_window_seconds,
        policies: vec![ScalingPolicy {
            percent,
            period_seconds: 60,
        }],
    }
}

/// Scaling behavior to send along with a target change
///
/// Scale-up is aggressive only under critical pressure without a scheduling
/// spike, since a spike already means pods are being added. Scale-down is
/// always slow.
pub fn synthesize_behavior(pressure: PressureLevel, spike_detected: bool) -> ScalingBehavior {
    let scale_up = match (pressure, spike_detected) {
        (PressureLevel::Critical, false) => rules(30, 100),
        (PressureLevel::Warning, _) => rules(60, 50),
        _ => rules(120, 25),
    };

    ScalingBehavior {
        scale_up,
        scale_down: rules(300, 10),
    }
}
