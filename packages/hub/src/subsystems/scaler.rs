use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::instrument;

use runnerhub_types::{
    Classify, ErrorCode, MonitorEvent, PoolMetrics, Repository, ScaleDirection, ScalingEvent,
    ScalingTrigger,
};
use utils::lock::KeyedMutex;
use utils::telemetry::ScalerMetrics;

use crate::storage::{Store, StoreError};
use crate::subsystems::monitor::MonitorBus;
use crate::subsystems::pool::{PoolError, PoolManager};

#[derive(Error, Debug)]
pub enum ScalerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl Classify for ScalerError {
    fn code(&self) -> ErrorCode {
        match self {
            ScalerError::Store(e) => e.code(),
            ScalerError::Pool(e) => e.code(),
        }
    }
}

pub type ScalerResult<T> = Result<T, ScalerError>;

#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub tick_s: u64,
    pub predictive: bool,
    /// Utilization samples kept per pool for the predictive model
    pub predictive_samples: usize,
    pub predictive_horizon_s: u64,
    pub predictive_confidence: f64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            tick_s: 30,
            predictive: false,
            predictive_samples: 30,
            predictive_horizon_s: 1800,
            predictive_confidence: 0.7,
        }
    }
}

struct PoolHistory {
    /// Previous tick's inputs, for two-tick damping
    previous: Option<PoolMetrics>,
    /// Recent utilization samples for the predictive model
    utilization: VecDeque<f64>,
}

/// The closed-loop control policy over utilization, queue depth, and wait
/// time. One decision ladder per pool per tick; first matching trigger wins.
pub struct AutoScaler {
    store: Store,
    pool: Arc<PoolManager>,
    bus: Arc<MonitorBus>,
    metrics: ScalerMetrics,
    config: ScalerConfig,
    history: DashMap<Repository, PoolHistory>,
    last_scale: DashMap<Repository, DateTime<Utc>>,
    /// Labels an exclusive routing match demands of new capacity, kept until
    /// a scale-up satisfies them so the regular tick covers missed nudges
    demand: DashMap<Repository, BTreeSet<String>>,
    in_flight: KeyedMutex<Repository>,
    nudge_tx: mpsc::UnboundedSender<Repository>,
    nudge_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Repository>>,
}

impl AutoScaler {
    pub fn new(
        store: Store,
        pool: Arc<PoolManager>,
        bus: Arc<MonitorBus>,
        metrics: ScalerMetrics,
        config: ScalerConfig,
    ) -> Self {
        let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
        Self {
            store,
            pool,
            bus,
            metrics,
            config,
            history: DashMap::new(),
            last_scale: DashMap::new(),
            demand: DashMap::new(),
            in_flight: KeyedMutex::new(),
            nudge_tx,
            nudge_rx: tokio::sync::Mutex::new(nudge_rx),
        }
    }

    pub fn config(&self) -> &ScalerConfig {
        &self.config
    }

    /// Advisory wake-up from the dispatcher when a job found no free runner.
    /// An exclusive routing match passes the label set new runners must carry
    /// exactly; the wake-up itself is a hint, the demand survives until a
    /// scale-up satisfies it.
    pub fn nudge(&self, repository: Repository, required_labels: Option<BTreeSet<String>>) {
        if let Some(labels) = required_labels {
            self.demand.insert(repository.clone(), labels);
        }
        let _ = self.nudge_tx.send(repository);
    }

    pub async fn next_nudge(&self) -> Option<Repository> {
        self.nudge_rx.lock().await.recv().await
    }

    pub fn in_cooldown(&self, repository: &Repository, cooldown_s: u64) -> bool {
        self.last_scale
            .get(repository)
            .map(|at| Utc::now() - *at < Duration::seconds(cooldown_s as i64))
            .unwrap_or(false)
    }

    /// One control pass over every active pool.
    #[instrument(level = "debug", skip(self), fields(subsys = "AutoScaler"))]
    pub async fn tick(&self) -> ScalerResult<()> {
        let repositories = self.store.active_repositories().await?;
        for repository in repositories {
            if let Err(err) = self.evaluate_pool(&repository).await {
                // transient trouble skips the tick for this pool only
                tracing::warn!("Scaler tick skipped for {}: {}", repository, err);
            }
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(subsys = "AutoScaler", repo = %repository))]
    pub async fn evaluate_pool(&self, repository: &Repository) -> ScalerResult<()> {
        // at most one scaling operation per pool in flight
        let Some(_guard) = self.in_flight.try_lock(repository.clone()) else {
            return Ok(());
        };

        let pool = self.pool.ensure_pool(repository).await?;
        let policy = &pool.policy;
        let now_metrics = self.pool.metrics(repository).await?;

        // inputs averaged over the last two ticks to damp noise
        let (damped, util) = {
            let mut entry = self.history.entry(repository.clone()).or_insert(PoolHistory {
                previous: None,
                utilization: VecDeque::new(),
            });
            let (damped, util) = match entry.previous {
                Some(prev) => (
                    PoolMetrics {
                        total_runners: now_metrics.total_runners,
                        idle_runners: now_metrics.idle_runners,
                        busy_runners: now_metrics.busy_runners,
                        queue_depth: (prev.queue_depth + now_metrics.queue_depth).div_ceil(2),
                        avg_wait_s: (prev.avg_wait_s + now_metrics.avg_wait_s) / 2.0,
                    },
                    (prev.utilization() + now_metrics.utilization()) / 2.0,
                ),
                None => (now_metrics, now_metrics.utilization()),
            };
            entry.previous = Some(now_metrics);
            entry.utilization.push_back(now_metrics.utilization());
            while entry.utilization.len() > self.config.predictive_samples {
                entry.utilization.pop_front();
            }
            (damped, util)
        };

        let total = now_metrics.total_runners;

        // decision ladder; first match wins
        let decision = if total < policy.min_runners {
            Some((
                ScaleDirection::Up,
                policy.min_runners - total,
                ScalingTrigger::BelowMin,
            ))
        } else if damped.queue_depth >= policy.queue_threshold && policy.queue_threshold > 0 {
            Some((
                ScaleDirection::Up,
                policy.scale_increment,
                ScalingTrigger::QueueDepth,
            ))
        } else if util >= policy.scale_up_threshold && total > 0 {
            Some((
                ScaleDirection::Up,
                policy.scale_increment,
                ScalingTrigger::Utilization,
            ))
        } else if damped.avg_wait_s >= policy.wait_threshold_s as f64 && damped.queue_depth > 0 {
            Some((
                ScaleDirection::Up,
                policy.scale_increment,
                ScalingTrigger::WaitTime,
            ))
        } else if util <= policy.scale_down_threshold
            && damped.queue_depth == 0
            && total > policy.min_runners
        {
            Some((
                ScaleDirection::Down,
                policy.scale_decrement,
                ScalingTrigger::Idle,
            ))
        } else if self.config.predictive {
            self.predictive_decision(repository, policy.scale_up_threshold)
        } else {
            None
        };

        let Some((direction, count, trigger)) = decision else {
            return Ok(());
        };

        if !trigger.bypasses_cooldown() && self.in_cooldown(repository, policy.cooldown_s) {
            self.metrics.skipped_cooldown.add(1, &[]);
            self.record_event(repository, ScaleDirection::None, total, total, trigger)
                .await?;
            return Ok(());
        }

        let before = total;
        let after = match direction {
            ScaleDirection::Up => {
                // a pending exclusive demand decides the labels of the new
                // capacity
                let labels = self.demand.get(repository).map(|entry| entry.value().clone());
                let created = match self
                    .pool
                    .scale_up(repository, count, labels.clone())
                    .await
                {
                    Ok(created) => created,
                    Err(PoolError::AtCapacity { .. }) => 0,
                    Err(err) => return Err(err.into()),
                };
                if created > 0 {
                    self.metrics.scale_ups.add(1, &[]);
                    if labels.is_some() {
                        self.demand.remove(repository);
                    }
                }
                before + created
            }
            ScaleDirection::Down => {
                let destroyed = self.pool.scale_down(repository, count).await?;
                if destroyed > 0 {
                    self.metrics.scale_downs.add(1, &[]);
                }
                before - destroyed
            }
            ScaleDirection::None => before,
        };

        if after == before {
            return Ok(());
        }

        self.last_scale.insert(repository.clone(), Utc::now());
        tracing::info!(
            "Scaling: repo={}, {}->{}, trigger={}",
            repository,
            before,
            after,
            trigger.as_str()
        );
        self.record_event(repository, direction, before, after, trigger)
            .await?;
        Ok(())
    }

    /// Manual override from the HTTP API. Bounded by the policy, ignores
    /// cooldown, and records a `forced` event.
    pub async fn force(
        &self,
        repository: &Repository,
        direction: ScaleDirection,
        count: u32,
    ) -> ScalerResult<ScalingEvent> {
        let _guard = self.in_flight.lock(repository.clone()).await;
        let (before, _, _) = self.store.count_pool_runners(repository).await?;

        let after = match direction {
            ScaleDirection::Up => before + self.pool.scale_up(repository, count, None).await?,
            ScaleDirection::Down => before - self.pool.scale_down(repository, count).await?,
            ScaleDirection::None => before,
        };

        if after != before {
            self.last_scale.insert(repository.clone(), Utc::now());
        }
        let event = ScalingEvent {
            repository: repository.clone(),
            direction,
            before,
            after,
            trigger: ScalingTrigger::Forced,
            timestamp: Utc::now(),
        };
        self.store.insert_scaling_event(&event).await?;
        self.bus.publish(MonitorEvent::Scaling(event.clone()));
        Ok(event)
    }

    fn predictive_decision(
        &self,
        repository: &Repository,
        up_threshold: f64,
    ) -> Option<(ScaleDirection, u32, ScalingTrigger)> {
        let history = self.history.get(repository)?;
        let samples: Vec<f64> = history.utilization.iter().copied().collect();
        drop(history);

        if samples.len() < self.config.predictive_samples {
            return None;
        }
        let (slope, intercept, r2) = linear_regression(&samples);
        let ticks_ahead = self.config.predictive_horizon_s as f64 / self.config.tick_s as f64;
        let predicted = slope * (samples.len() as f64 + ticks_ahead) + intercept;

        if predicted > up_threshold && r2 >= self.config.predictive_confidence {
            Some((ScaleDirection::Up, 1, ScalingTrigger::Predicted))
        } else {
            None
        }
    }

    async fn record_event(
        &self,
        repository: &Repository,
        direction: ScaleDirection,
        before: u32,
        after: u32,
        trigger: ScalingTrigger,
    ) -> ScalerResult<()> {
        let event = ScalingEvent {
            repository: repository.clone(),
            direction,
            before,
            after,
            trigger,
            timestamp: Utc::now(),
        };
        self.store.insert_scaling_event(&event).await?;
        self.bus.publish(MonitorEvent::Scaling(event));
        Ok(())
    }
}

/// Least-squares fit over equally spaced samples. Returns (slope, intercept,
/// r-squared).
fn linear_regression(samples: &[f64]) -> (f64, f64, f64) {
    let n = samples.len() as f64;
    if samples.len() < 2 {
        return (0.0, samples.first().copied().unwrap_or(0.0), 0.0);
    }

    let mean_x = (n - 1.0) / 2.0;
    let mean_y = samples.iter().sum::<f64>() / n;

    let mut ss_xy = 0.0;
    let mut ss_xx = 0.0;
    let mut ss_yy = 0.0;
    for (i, y) in samples.iter().enumerate() {
        let dx = i as f64 - mean_x;
        let dy = y - mean_y;
        ss_xy += dx * dy;
        ss_xx += dx * dx;
        ss_yy += dy * dy;
    }

    let slope = if ss_xx == 0.0 { 0.0 } else { ss_xy / ss_xx };
    let intercept = mean_y - slope * mean_x;
    let r2 = if ss_yy == 0.0 {
        1.0
    } else {
        (ss_xy * ss_xy) / (ss_xx * ss_yy)
    };
    (slope, intercept, r2)
}
