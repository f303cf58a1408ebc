use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::Repository;

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
    None,
}

impl ScaleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleDirection::Up => "up",
            ScaleDirection::Down => "down",
            ScaleDirection::None => "none",
        }
    }
}

/// What tripped a scaling decision.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ScalingTrigger {
    QueueDepth,
    Utilization,
    WaitTime,
    BelowMin,
    Idle,
    Predicted,
    Forced,
}

impl ScalingTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingTrigger::QueueDepth => "queue_depth",
            ScalingTrigger::Utilization => "utilization",
            ScalingTrigger::WaitTime => "wait_time",
            ScalingTrigger::BelowMin => "below_min",
            ScalingTrigger::Idle => "idle",
            ScalingTrigger::Predicted => "predicted",
            ScalingTrigger::Forced => "forced",
        }
    }

    /// below-min corrections are allowed to bypass the pool cooldown
    pub fn bypasses_cooldown(&self) -> bool {
        matches!(self, ScalingTrigger::BelowMin)
    }
}

/// Append-only record of one auto-scaler (or forced) decision.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
pub struct ScalingEvent {
    pub repository: Repository,
    pub direction: ScaleDirection,
    pub before: u32,
    pub after: u32,
    pub trigger: ScalingTrigger,
    pub timestamp: DateTime<Utc>,
}
