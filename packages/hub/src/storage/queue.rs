use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::instrument;

use runnerhub_types::{Classify, ErrorCode, JobPriority};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("no such message: {0}")]
    NotFound(i64),

    #[error("invalid cron expression `{expression}`: {reason}")]
    Cron { expression: String, reason: String },

    #[error("corrupt message: {0}")]
    Corrupt(String),
}

impl Classify for QueueError {
    fn code(&self) -> ErrorCode {
        match self {
            QueueError::Unavailable(_) => ErrorCode::Unavailable,
            QueueError::NotFound(_) => ErrorCode::NotFound,
            QueueError::Cron { .. } => ErrorCode::Validation,
            QueueError::Corrupt(_) => ErrorCode::Unavailable,
        }
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_attempts: u32,
    /// Base for the exponential nack backoff
    pub backoff_base_s: u64,
    pub backoff_cap_s: u64,
    /// A message older than this is reserved ahead of strict priority
    pub max_starvation_s: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_s: 2,
            backoff_cap_s: 300,
            max_starvation_s: 120,
        }
    }
}

/// A reserved message. Invisible to other workers until acked, nacked, or the
/// visibility timeout lapses.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: i64,
    pub band: JobPriority,
    pub payload: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    pub delay: Option<Duration>,
    pub dedup_key: Option<String>,
    pub max_attempts: Option<u32>,
}

/// Durable at-least-once priority FIFO over the store's database.
///
/// Four bands with strict priority between them, FIFO on enqueue time within
/// a band, and a starvation watchdog that promotes any message older than
/// `max_starvation_s` regardless of band.
#[derive(Clone)]
pub struct Queue {
    pool: SqlitePool,
    config: QueueConfig,
}

impl Queue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub async fn ping(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self, payload), fields(subsys = "Queue"))]
    pub async fn enqueue(
        &self,
        band: JobPriority,
        payload: &str,
        opts: EnqueueOpts,
    ) -> QueueResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        // a pending message with the same dedup key swallows the enqueue
        if let Some(key) = &opts.dedup_key {
            let existing = sqlx::query(
                "SELECT id FROM queue_message WHERE dedup_key = ? AND state IN ('available', 'reserved')",
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            if existing.is_some() {
                tx.commit().await?;
                return Ok(None);
            }
        }

        let now = Utc::now();
        let visible_at = now + opts.delay.unwrap_or_else(Duration::zero);
        let result = sqlx::query(
            "INSERT INTO queue_message (band, payload, dedup_key, state, attempts, max_attempts, \
             enqueued_at, visible_at) VALUES (?, ?, ?, 'available', 0, ?, ?, ?)",
        )
        .bind(band.band())
        .bind(payload)
        .bind(&opts.dedup_key)
        .bind(opts.max_attempts.unwrap_or(self.config.max_attempts))
        .bind(now)
        .bind(visible_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(result.last_insert_rowid()))
    }

    /// Pop the next message and hide it for `visibility_timeout`. Expired
    /// reservations are reclaimed first, then the starvation watchdog gets a
    /// chance, then strict band priority with per-band FIFO.
    #[instrument(level = "debug", skip(self), fields(subsys = "Queue"))]
    pub async fn reserve(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> QueueResult<Option<QueueMessage>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // a lapsed visibility timeout counts as a delivery attempt
        sqlx::query(
            "UPDATE queue_message SET state = 'dead', reserved_by = NULL, reserved_until = NULL, \
             last_error = 'visibility timeout' \
             WHERE state = 'reserved' AND reserved_until < ? AND attempts >= max_attempts",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE queue_message SET state = 'available', reserved_by = NULL, reserved_until = NULL \
             WHERE state = 'reserved' AND reserved_until < ?",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let starvation_cutoff = now - Duration::seconds(self.config.max_starvation_s as i64);
        let starving = sqlx::query(
            "SELECT * FROM queue_message WHERE state = 'available' AND visible_at <= ? \
             AND enqueued_at <= ? ORDER BY enqueued_at ASC, id ASC LIMIT 1",
        )
        .bind(now)
        .bind(starvation_cutoff)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match starving {
            Some(row) => Some(row),
            None => {
                sqlx::query(
                    "SELECT * FROM queue_message WHERE state = 'available' AND visible_at <= ? \
                     ORDER BY band ASC, enqueued_at ASC, id ASC LIMIT 1",
                )
                .bind(now)
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let attempts: i64 = row.try_get("attempts")?;
        sqlx::query(
            "UPDATE queue_message SET state = 'reserved', attempts = attempts + 1, \
             reserved_by = ?, reserved_until = ? WHERE id = ?",
        )
        .bind(worker_id)
        .bind(now + visibility_timeout)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let band: i64 = row.try_get("band")?;
        Ok(Some(QueueMessage {
            id,
            band: JobPriority::from_band(band)
                .ok_or_else(|| QueueError::Corrupt(format!("bad band {band}")))?,
            payload: row.try_get("payload")?,
            attempts: attempts as u32 + 1,
            max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
            enqueued_at: row.try_get("enqueued_at")?,
        }))
    }

    pub async fn ack(&self, id: i64) -> QueueResult<()> {
        let result = sqlx::query("DELETE FROM queue_message WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    /// Return a message to the queue with exponential backoff; dead-letters
    /// once attempts are exhausted.
    #[instrument(level = "debug", skip(self), fields(subsys = "Queue"))]
    pub async fn nack(&self, id: i64, error: Option<&str>) -> QueueResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT attempts, max_attempts FROM queue_message WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(QueueError::NotFound(id))?;
        let attempts: i64 = row.try_get("attempts")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;

        if attempts >= max_attempts {
            sqlx::query(
                "UPDATE queue_message SET state = 'dead', reserved_by = NULL, reserved_until = NULL, \
                 last_error = ? WHERE id = ?",
            )
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        } else {
            let exponent = (attempts - 1).clamp(0, 16) as u32;
            let delay = (self.config.backoff_base_s.saturating_mul(1 << exponent))
                .min(self.config.backoff_cap_s);
            sqlx::query(
                "UPDATE queue_message SET state = 'available', reserved_by = NULL, \
                 reserved_until = NULL, visible_at = ?, last_error = ? WHERE id = ?",
            )
            .bind(Utc::now() + Duration::seconds(delay as i64))
            .bind(error)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Move a message straight to the dead-letter state.
    pub async fn dlq(&self, id: i64, error: Option<&str>) -> QueueResult<()> {
        let result = sqlx::query(
            "UPDATE queue_message SET state = 'dead', reserved_by = NULL, reserved_until = NULL, \
             last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    pub async fn depth(&self, band: Option<JobPriority>) -> QueueResult<u64> {
        let count: i64 = match band {
            Some(band) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM queue_message WHERE state = 'available' AND band = ?",
                )
                .bind(band.band())
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM queue_message WHERE state = 'available'")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count as u64)
    }

    pub async fn dead_count(&self) -> QueueResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_message WHERE state = 'dead'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    // ---- recurring schedules ----

    pub async fn upsert_schedule(
        &self,
        name: &str,
        cron_expr: &str,
        band: JobPriority,
        payload: &str,
    ) -> QueueResult<()> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| QueueError::Cron {
            expression: cron_expr.to_string(),
            reason: e.to_string(),
        })?;
        let next = schedule
            .upcoming(Utc)
            .next()
            .ok_or_else(|| QueueError::Cron {
                expression: cron_expr.to_string(),
                reason: "schedule produces no upcoming fire times".to_string(),
            })?;

        sqlx::query(
            "INSERT INTO queue_schedule (name, cron, band, payload, next_fire_at, enabled) \
             VALUES (?, ?, ?, ?, ?, 1) \
             ON CONFLICT(name) DO UPDATE SET cron = excluded.cron, band = excluded.band, \
             payload = excluded.payload, next_fire_at = excluded.next_fire_at, enabled = 1",
        )
        .bind(name)
        .bind(cron_expr)
        .bind(band.band())
        .bind(payload)
        .bind(next)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Enqueue every due schedule and advance its next fire time. Returns the
    /// number of messages produced.
    #[instrument(level = "debug", skip(self), fields(subsys = "Queue"))]
    pub async fn tick_schedules(&self, now: DateTime<Utc>) -> QueueResult<u32> {
        let rows = sqlx::query(
            "SELECT name, cron, band, payload FROM queue_schedule \
             WHERE enabled = 1 AND next_fire_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut fired = 0u32;
        for row in rows {
            let name: String = row.try_get("name")?;
            let cron_expr: String = row.try_get("cron")?;
            let band: i64 = row.try_get("band")?;
            let payload: String = row.try_get("payload")?;

            let band = JobPriority::from_band(band)
                .ok_or_else(|| QueueError::Corrupt(format!("bad band {band}")))?;
            self.enqueue(band, &payload, EnqueueOpts::default()).await?;

            let schedule = Schedule::from_str(&cron_expr).map_err(|e| QueueError::Cron {
                expression: cron_expr.clone(),
                reason: e.to_string(),
            })?;
            let next = schedule.after(&now).next().unwrap_or(now + Duration::days(365));
            sqlx::query("UPDATE queue_schedule SET next_fire_at = ? WHERE name = ?")
                .bind(next)
                .bind(&name)
                .execute(&self.pool)
                .await?;
            fired += 1;
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::store::temp_store;

    async fn temp_queue() -> (Queue, tempfile::TempDir) {
        let (store, dir) = temp_store().await;
        (Queue::new(store.pool().clone(), QueueConfig::default()), dir)
    }

    #[tokio::test]
    async fn strict_priority_across_bands() {
        let (queue, _dir) = temp_queue().await;

        queue
            .enqueue(JobPriority::Low, "low", EnqueueOpts::default())
            .await
            .unwrap();
        queue
            .enqueue(JobPriority::Normal, "normal", EnqueueOpts::default())
            .await
            .unwrap();
        queue
            .enqueue(JobPriority::Critical, "critical", EnqueueOpts::default())
            .await
            .unwrap();

        let timeout = Duration::seconds(30);
        let order: Vec<String> = [
            queue.reserve("w", timeout).await.unwrap().unwrap(),
            queue.reserve("w", timeout).await.unwrap().unwrap(),
            queue.reserve("w", timeout).await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|m| m.payload)
        .collect();

        assert_eq!(order, vec!["critical", "normal", "low"]);
        assert!(queue.reserve("w", timeout).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_within_band() {
        let (queue, _dir) = temp_queue().await;
        for i in 0..3 {
            queue
                .enqueue(JobPriority::Normal, &format!("m{i}"), EnqueueOpts::default())
                .await
                .unwrap();
        }
        let timeout = Duration::seconds(30);
        for i in 0..3 {
            let msg = queue.reserve("w", timeout).await.unwrap().unwrap();
            assert_eq!(msg.payload, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn ack_deletes_nack_backs_off() {
        let (queue, _dir) = temp_queue().await;
        queue
            .enqueue(JobPriority::Normal, "work", EnqueueOpts::default())
            .await
            .unwrap();

        let timeout = Duration::seconds(30);
        let msg = queue.reserve("w", timeout).await.unwrap().unwrap();
        assert_eq!(msg.attempts, 1);

        // reserved messages are invisible
        assert!(queue.reserve("w2", timeout).await.unwrap().is_none());

        queue.nack(msg.id, Some("busy")).await.unwrap();
        // backoff pushed visibility into the future
        assert!(queue.reserve("w", timeout).await.unwrap().is_none());
        assert_eq!(queue.depth(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter() {
        let (queue, _dir) = temp_queue().await;
        queue
            .enqueue(
                JobPriority::Normal,
                "poison",
                EnqueueOpts {
                    max_attempts: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let msg = queue
            .reserve("w", Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        queue.nack(msg.id, Some("boom")).await.unwrap();

        assert_eq!(queue.depth(None).await.unwrap(), 0);
        assert_eq!(queue.dead_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dedup_key_swallows_pending_duplicates() {
        let (queue, _dir) = temp_queue().await;
        let opts = EnqueueOpts {
            dedup_key: Some("k1".to_string()),
            ..Default::default()
        };
        assert!(queue
            .enqueue(JobPriority::Normal, "a", opts.clone())
            .await
            .unwrap()
            .is_some());
        assert!(queue
            .enqueue(JobPriority::Normal, "b", opts.clone())
            .await
            .unwrap()
            .is_none());
        assert_eq!(queue.depth(None).await.unwrap(), 1);

        // once consumed, the key is free again
        let msg = queue
            .reserve("w", Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        queue.ack(msg.id).await.unwrap();
        assert!(queue
            .enqueue(JobPriority::Normal, "c", opts)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn delayed_messages_invisible_until_due() {
        let (queue, _dir) = temp_queue().await;
        queue
            .enqueue(
                JobPriority::Critical,
                "later",
                EnqueueOpts {
                    delay: Some(Duration::seconds(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(queue
            .reserve("w", Duration::seconds(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn starving_low_message_beats_fresh_critical() {
        let (store, _dir) = temp_store().await;
        let queue = Queue::new(
            store.pool().clone(),
            QueueConfig {
                max_starvation_s: 0,
                ..Default::default()
            },
        );

        queue
            .enqueue(JobPriority::Low, "starving", EnqueueOpts::default())
            .await
            .unwrap();
        queue
            .enqueue(JobPriority::Critical, "fresh", EnqueueOpts::default())
            .await
            .unwrap();

        // with the watchdog window at zero, the older message wins regardless
        // of band
        let msg = queue
            .reserve("w", Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, "starving");
    }

    #[tokio::test]
    async fn schedules_fire_and_advance() {
        let (queue, _dir) = temp_queue().await;
        queue
            .upsert_schedule("cleanup", "0 * * * * *", JobPriority::Low, "tick")
            .await
            .unwrap();

        // nothing due yet
        assert_eq!(queue.tick_schedules(Utc::now()).await.unwrap(), 0);

        // jump past the next fire time
        let fired = queue
            .tick_schedules(Utc::now() + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(fired, 1);
        assert_eq!(queue.depth(Some(JobPriority::Low)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bad_cron_rejected() {
        let (queue, _dir) = temp_queue().await;
        let err = queue
            .upsert_schedule("bad", "not-a-cron", JobPriority::Low, "x")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Cron { .. }));
    }
}
