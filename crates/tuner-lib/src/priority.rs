//! Workload priority arbitration
//!
//! Adjusts the HPA target a deployment would otherwise use according to its
//! priority class and recent cluster pressure, and decides whether one
//! workload may take headroom from another.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::debug;

use crate::observability::StructuredLogger;

/// Priority classes, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    BestEffort,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::BestEffort,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::BestEffort => "best_effort",
        }
    }

    /// Static tuning parameters for this class
    pub fn config(&self) -> &'static PriorityConfig {
        match self {
            Priority::Critical => &CRITICAL,
            Priority::High => &HIGH,
            Priority::Medium => &MEDIUM,
            Priority::Low => &LOW,
            Priority::BestEffort => &BEST_EFFORT,
        }
    }

    fn is_protected(&self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }

    fn is_expendable(&self) -> bool {
        matches!(self, Priority::Low | Priority::BestEffort)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            "best_effort" | "besteffort" => Ok(Priority::BestEffort),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Per-class tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorityConfig {
    pub weight: u32,
    /// Added to the base target percentage
    pub target_adjustment: i32,
    pub scale_up_speed: f64,
    pub scale_down_speed: f64,
    /// Minimum CPU headroom percentage this class keeps
    pub min_headroom: i32,
    pub can_preempt: bool,
    pub can_be_preempted: bool,
}

static CRITICAL: PriorityConfig = PriorityConfig {
    weight: 100,
    target_adjustment: -15,
    scale_up_speed: 2.0,
    scale_down_speed: 0.5,
    min_headroom: 30,
    can_preempt: true,
    can_be_preempted: false,
};

static HIGH: PriorityConfig = PriorityConfig {
    weight: 75,
    target_adjustment: -10,
    scale_up_speed: 1.5,
    scale_down_speed: 0.75,
    min_headroom: 25,
    can_preempt: true,
    can_be_preempted: false,
};

static MEDIUM: PriorityConfig = PriorityConfig {
    weight: 50,
    target_adjustment: 0,
    scale_up_speed: 1.0,
    scale_down_speed: 1.0,
    min_headroom: 20,
    can_preempt: false,
    can_be_preempted: true,
};

static LOW: PriorityConfig = PriorityConfig {
    weight: 25,
    target_adjustment: 10,
    scale_up_speed: 0.75,
    scale_down_speed: 1.5,
    min_headroom: 15,
    can_preempt: false,
    can_be_preempted: true,
};

static BEST_EFFORT: PriorityConfig = PriorityConfig {
    weight: 10,
    target_adjustment: 15,
    scale_up_speed: 0.5,
    scale_down_speed: 2.0,
    min_headroom: 10,
    can_preempt: false,
    can_be_preempted: true,
};

/// Tunables for the priority manager
#[derive(Debug, Clone, Deserialize)]
pub struct PriorityManagerConfig {
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_min_target")]
    pub min_target: i32,
    #[serde(default = "default_max_target")]
    pub max_target: i32,
    /// Cluster pressure at or above which preemption is considered
    #[serde(default = "default_preemption_pressure")]
    pub preemption_pressure: f64,
    #[serde(default = "default_preemption_cooldown_secs")]
    pub preemption_cooldown_secs: i64,
}

fn default_history_size() -> usize {
    10
}

fn default_min_target() -> i32 {
    30
}

fn default_max_target() -> i32 {
    95
}

fn default_preemption_pressure() -> f64 {
    80.0
}

fn default_preemption_cooldown_secs() -> i64 {
    300
}

impl Default for PriorityManagerConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            min_target: default_min_target(),
            max_target: default_max_target(),
            preemption_pressure: default_preemption_pressure(),
            preemption_cooldown_secs: default_preemption_cooldown_secs(),
        }
    }
}

/// Extra adjustment applied on top of a class's static adjustment
fn pressure_bonus(priority: Priority, avg_pressure: f64) -> i32 {
    if avg_pressure > 85.0 {
        if priority.is_protected() {
            -10
        } else if priority.is_expendable() {
            15
        } else {
            0
        }
    } else if avg_pressure > 75.0 {
        if priority.is_protected() {
            -5
        } else if priority.is_expendable() {
            10
        } else {
            0
        }
    } else if avg_pressure < 40.0 && priority.is_expendable() {
        5
    } else {
        0
    }
}

/// Priority table lookups plus the small amount of mutable arbitration state
pub struct PriorityManager {
    config: PriorityManagerConfig,
    assignments: DashMap<String, Priority>,
    pressure_history: Mutex<VecDeque<f64>>,
    /// `"{requester}->{target}"` -> time of last granted preemption
    preemptions: DashMap<String, DateTime<Utc>>,
    logger: StructuredLogger,
}

impl Default for PriorityManager {
    fn default() -> Self {
        Self::new(PriorityManagerConfig::default())
    }
}

impl PriorityManager {
    pub fn new(config: PriorityManagerConfig) -> Self {
        Self {
            pressure_history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            config,
            assignments: DashMap::new(),
            preemptions: DashMap::new(),
            logger: StructuredLogger::new("priority_manager"),
        }
    }

    pub fn set_priority(&self, deployment: impl Into<String>, priority: Priority) {
        self.assignments.insert(deployment.into(), priority);
    }

    /// Registered priority, `medium` when unknown
    pub fn get_priority(&self, deployment: &str) -> Priority {
        self.assignments
            .get(deployment)
            .map(|p| *p)
            .unwrap_or_default()
    }

    /// Rolling average of recorded pressure samples
    pub fn average_pressure(&self) -> Option<f64> {
        let history = self.pressure_history.lock().unwrap_or_else(|e| e.into_inner());
        if history.is_empty() {
            None
        } else {
            Some(history.iter().sum::<f64>() / history.len() as f64)
        }
    }

    fn record_pressure(&self, sample: f64) -> f64 {
        let mut history = self.pressure_history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(sample);
        while history.len() > self.config.history_size.max(1) {
            history.pop_front();
        }
        history.iter().sum::<f64>() / history.len() as f64
    }

    /// Priority-adjusted HPA target for a deployment
    ///
    /// Records `max(node_pressure, cluster_pressure)` into the rolling window
    /// and returns `base_target + adjustment`, clamped to the configured band
    /// and to `100 - min_headroom` for the class.
    pub fn calculate_target_adjustment(
        &self,
        priority: Priority,
        base_target: i32,
        node_pressure: f64,
        cluster_pressure: f64,
    ) -> i32 {
        let avg_pressure = self.record_pressure(node_pressure.max(cluster_pressure));
        let class = priority.config();
        let adjustment = class.target_adjustment + pressure_bonus(priority, avg_pressure);

        let target = (base_target + adjustment)
            .clamp(self.config.min_target, self.config.max_target)
            .min(100 - class.min_headroom);

        debug!(
            priority = %priority,
            base_target,
            avg_pressure,
            adjustment,
            target,
            "Calculated priority target adjustment"
        );

        target
    }

    /// Whether `requester` may preempt headroom from `target` right now
    pub fn should_preempt(&self, requester: &str, target: &str, cluster_pressure: f64) -> bool {
        self.should_preempt_at(requester, target, cluster_pressure, Utc::now())
    }

    /// Clock-explicit form of [`Self::should_preempt`]; a `true` result starts
    /// the cooldown for the ordered pair
    pub fn should_preempt_at(
        &self,
        requester: &str,
        target: &str,
        cluster_pressure: f64,
        now: DateTime<Utc>,
    ) -> bool {
        if cluster_pressure < self.config.preemption_pressure {
            return false;
        }

        let requester_priority = self.get_priority(requester);
        let target_priority = self.get_priority(target);
        let req = requester_priority.config();
        let tgt = target_priority.config();

        if !req.can_preempt || !tgt.can_be_preempted || req.weight <= tgt.weight {
            return false;
        }

        let pair = format!("{}->{}", requester, target);
        if let Some(last) = self.preemptions.get(&pair) {
            if now - *last < Duration::seconds(self.config.preemption_cooldown_secs) {
                debug!(pair = %pair, "Preemption pair still cooling down");
                return false;
            }
        }

        self.preemptions.insert(pair, now);
        self.logger
            .log_preemption(requester, target, requester_priority, target_priority, cluster_pressure);
        true
    }

    /// Registered deployments `requester` could preempt, lowest weight first
    ///
    /// Only evaluates eligibility; no cooldown is started.
    pub fn preemption_candidates(&self, requester: &str, cluster_pressure: f64) -> Vec<String> {
        self.preemption_candidates_at(requester, cluster_pressure, Utc::now())
    }

    pub fn preemption_candidates_at(
        &self,
        requester: &str,
        cluster_pressure: f64,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        if cluster_pressure < self.config.preemption_pressure {
            return Vec::new();
        }
        let req = self.get_priority(requester).config();
        if !req.can_preempt {
            return Vec::new();
        }

        let cooldown = Duration::seconds(self.config.preemption_cooldown_secs);
        let mut candidates: Vec<(u32, String)> = self
            .assignments
            .iter()
            .filter(|entry| entry.key() != requester)
            .filter_map(|entry| {
                let tgt = entry.value().config();
                if !tgt.can_be_preempted || req.weight <= tgt.weight {
                    return None;
                }
                let pair = format!("{}->{}", requester, entry.key());
                let cooling = self
                    .preemptions
                    .get(&pair)
                    .map(|last| now - *last < cooldown)
                    .unwrap_or(false);
                (!cooling).then(|| (tgt.weight, entry.key().clone()))
            })
            .collect();

        candidates.sort();
        candidates.into_iter().map(|(_, name)| name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_under_heavy_pressure() {
        let manager = PriorityManager::default();
        // -15 static, -10 for the >85 tier
        let target = manager.calculate_target_adjustment(Priority::Critical, 70, 90.0, 60.0);
        assert_eq!(target, 45);
    }

    #[test]
    fn test_best_effort_relaxes_under_pressure() {
        let manager = PriorityManager::default();
        // 70 + 15 + 15 = 100, clamped to 95 and then to 100 - 10
        let target = manager.calculate_target_adjustment(Priority::BestEffort, 70, 50.0, 88.0);
        assert_eq!(target, 90);
    }

    #[test]
    fn test_idle_cluster_bonus_for_low_priority() {
        let manager = PriorityManager::default();
        let target = manager.calculate_target_adjustment(Priority::Low, 60, 20.0, 30.0);
        assert_eq!(target, 75);

        let medium = manager.calculate_target_adjustment(Priority::Medium, 60, 20.0, 30.0);
        assert_eq!(medium, 60);
    }

    #[test]
    fn test_rolling_average_uses_bounded_window() {
        let manager = PriorityManager::default();
        for _ in 0..10 {
            manager.calculate_target_adjustment(Priority::High, 70, 95.0, 0.0);
        }
        for _ in 0..10 {
            manager.calculate_target_adjustment(Priority::High, 70, 50.0, 0.0);
        }

        assert_eq!(manager.average_pressure(), Some(50.0));
        // The >85 samples have rolled out, so no pressure bonus applies
        assert_eq!(
            manager.calculate_target_adjustment(Priority::High, 70, 50.0, 0.0),
            60
        );
    }

    #[test]
    fn test_target_never_leaves_band() {
        let manager = PriorityManager::default();
        let target = manager.calculate_target_adjustment(Priority::Critical, 35, 99.0, 99.0);
        assert_eq!(target, 30);
    }

    #[test]
    fn test_should_preempt_requires_all_conditions() {
        let manager = PriorityManager::default();
        manager.set_priority("payments", Priority::Critical);
        manager.set_priority("batch", Priority::BestEffort);
        manager.set_priority("search", Priority::High);

        assert!(!manager.should_preempt("payments", "batch", 70.0));
        assert!(!manager.should_preempt("batch", "payments", 95.0));
        assert!(!manager.should_preempt("payments", "search", 95.0));
        assert!(manager.should_preempt("payments", "batch", 85.0));
    }

    #[test]
    fn test_preemption_pair_cooldown() {
        let manager = PriorityManager::default();
        manager.set_priority("api", Priority::High);
        manager.set_priority("reports", Priority::Low);
        let now = Utc::now();

        assert!(manager.should_preempt_at("api", "reports", 90.0, now));
        assert!(!manager.should_preempt_at("api", "reports", 90.0, now + Duration::minutes(4)));
        assert!(manager.should_preempt_at("api", "reports", 90.0, now + Duration::minutes(6)));
    }

    #[test]
    fn test_preemption_candidates_sorted_by_weight() {
        let manager = PriorityManager::default();
        manager.set_priority("api", Priority::Critical);
        manager.set_priority("web", Priority::Medium);
        manager.set_priority("batch", Priority::BestEffort);
        manager.set_priority("etl", Priority::Low);
        manager.set_priority("search", Priority::High);

        let candidates = manager.preemption_candidates("api", 90.0);
        assert_eq!(candidates, vec!["batch", "etl", "web"]);
        assert!(manager.preemption_candidates("web", 90.0).is_empty());
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("best-effort".parse::<Priority>(), Ok(Priority::BestEffort));
        assert_eq!("CRITICAL".parse::<Priority>(), Ok(Priority::Critical));
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(manager_default_priority(), Priority::Medium);
    }

    fn manager_default_priority() -> Priority {
        PriorityManager::default().get_priority("unregistered")
    }
}
