use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::Repository;

/// Scaling policy attached to a pool. Persisted with the pool row and
/// editable through the HTTP API.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct PoolPolicy {
    pub min_runners: u32,
    pub max_runners: u32,
    /// Runners added per scale-up decision
    pub scale_increment: u32,
    /// Runners removed per scale-down decision
    pub scale_decrement: u32,
    /// Queue depth at which a scale-up fires
    pub queue_threshold: u32,
    /// Utilization at or above which a scale-up fires
    pub scale_up_threshold: f64,
    /// Utilization at or below which a scale-down may fire
    pub scale_down_threshold: f64,
    /// Mean queued wait at which a scale-up fires
    pub wait_threshold_s: u64,
    /// Minimum spacing between scaling decisions for this pool
    pub cooldown_s: u64,
    /// How long to wait for a fresh runner's first heartbeat
    pub startup_timeout_s: u64,
    /// When true, runners created to satisfy an exclusive routing rule get
    /// exactly that rule's label set. When false such jobs fail fast.
    pub dynamic_labels: bool,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            min_runners: 0,
            max_runners: 10,
            scale_increment: 1,
            scale_decrement: 1,
            queue_threshold: 3,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            wait_threshold_s: 30,
            cooldown_s: 300,
            startup_timeout_s: 120,
            dynamic_labels: true,
        }
    }
}

impl PoolPolicy {
    /// `min_runners <= max_runners` and `max_runners >= 1`
    pub fn validate(&self) -> Result<(), String> {
        if self.max_runners < 1 {
            return Err("max_runners must be >= 1".to_string());
        }
        if self.min_runners > self.max_runners {
            return Err(format!(
                "min_runners ({}) must not exceed max_runners ({})",
                self.min_runners, self.max_runners
            ));
        }
        if !(0.0..=1.0).contains(&self.scale_up_threshold)
            || !(0.0..=1.0).contains(&self.scale_down_threshold)
        {
            return Err("scale thresholds must be within [0, 1]".to_string());
        }
        if self.scale_increment == 0 {
            return Err("scale_increment must be >= 1".to_string());
        }
        Ok(())
    }
}

/// One pool per active repository.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct RunnerPool {
    pub repository: Repository,
    pub policy: PoolPolicy,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Live metrics sampled for a pool, used by the auto-scaler and surfaced by
/// the pools API.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, ToSchema)]
pub struct PoolMetrics {
    pub total_runners: u32,
    pub idle_runners: u32,
    pub busy_runners: u32,
    pub queue_depth: u32,
    /// Mean wait of currently queued jobs, in seconds
    pub avg_wait_s: f64,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        self.busy_runners as f64 / (self.total_runners.max(1)) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_validation() {
        assert!(PoolPolicy::default().validate().is_ok());

        let mut p = PoolPolicy::default();
        p.min_runners = 11;
        assert!(p.validate().is_err());

        let mut p = PoolPolicy::default();
        p.max_runners = 0;
        assert!(p.validate().is_err());

        let mut p = PoolPolicy::default();
        p.scale_up_threshold = 1.5;
        assert!(p.validate().is_err());
    }

    #[test]
    fn utilization_guards_empty_pool() {
        let m = PoolMetrics::default();
        assert_eq!(m.utilization(), 0.0);

        let m = PoolMetrics {
            total_runners: 4,
            busy_runners: 3,
            ..Default::default()
        };
        assert_eq!(m.utilization(), 0.75);
    }
}
