use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;
use tracing::instrument;

use runnerhub_types::{
    Classify, DispatchPayload, ErrorCode, Repository, UpstreamEvent, WebhookEvent,
    WorkflowJobAction, WorkflowJobFacts,
};
use utils::telemetry::IngressMetrics;

use crate::storage::{EnqueueOpts, Queue, QueueError, Store, StoreError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum IngressError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("signature verification failed")]
    BadSignature,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl Classify for IngressError {
    fn code(&self) -> ErrorCode {
        match self {
            IngressError::MissingHeader(_) => ErrorCode::Validation,
            IngressError::BadSignature => ErrorCode::Unauthorized,
            IngressError::MalformedPayload(_) => ErrorCode::Validation,
            IngressError::Store(e) => e.code(),
            IngressError::Queue(e) => e.code(),
        }
    }
}

pub type IngressResult<T> = Result<T, IngressError>;

/// The raw material of one delivery, extracted from the HTTP request by the
/// webhook handler.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub event_type: String,
    pub delivery_id: String,
    /// Value of the `X-Hub-Signature-256` header
    pub signature: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Verified, persisted, and (for work-producing events) enqueued
    Accepted { delivery_id: String, enqueued: bool },
    /// Same composite key seen within the dedup TTL
    Duplicate { delivery_id: String },
}

#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub secret: String,
    pub dedup_ttl_s: u64,
    /// Cap on how many failed events one retry_failed() call re-enqueues
    pub retry_cap: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            dedup_ttl_s: 60,
            retry_cap: 50,
        }
    }
}

/// Signed-webhook ingestion: header validation, HMAC verification, dedup,
/// persistence, and enqueue onto the dispatch queue.
pub struct Ingress {
    store: Store,
    queue: Queue,
    config: IngressConfig,
    metrics: IngressMetrics,
    /// composite key -> expiry
    dedup: DashMap<String, DateTime<Utc>>,
}

impl Ingress {
    pub fn new(store: Store, queue: Queue, config: IngressConfig, metrics: IngressMetrics) -> Self {
        Self {
            store,
            queue,
            config,
            metrics,
            dedup: DashMap::new(),
        }
    }

    /// The full processing pipeline for one delivery. Callers respond 202
    /// from the Accepted outcome before any dispatch work happens; the queue
    /// makes the work durable.
    #[instrument(level = "debug", skip(self, delivery), fields(subsys = "Ingress", delivery_id = %delivery.delivery_id))]
    pub async fn process(&self, delivery: RawDelivery) -> IngressResult<IngressOutcome> {
        if delivery.event_type.is_empty() {
            return Err(IngressError::MissingHeader("x-github-event"));
        }
        if delivery.delivery_id.is_empty() {
            return Err(IngressError::MissingHeader("x-github-delivery"));
        }

        if !verify_signature(&self.config.secret, &delivery.body, &delivery.signature) {
            self.metrics.rejected_signature.add(1, &[]);
            return Err(IngressError::BadSignature);
        }

        let payload: serde_json::Value = serde_json::from_slice(&delivery.body)
            .map_err(|e| IngressError::MalformedPayload(e.to_string()))?;
        let event = parse_event(&delivery.event_type, &payload)?;

        let dedup_key = composite_key(&delivery.event_type, &delivery.delivery_id, &event);
        if self.seen_recently(&dedup_key) {
            self.metrics.duplicates.add(1, &[]);
            tracing::debug!("Duplicate delivery dropped: {}", delivery.delivery_id);
            return Ok(IngressOutcome::Duplicate {
                delivery_id: delivery.delivery_id,
            });
        }

        let (action, repository) = match &event {
            UpstreamEvent::WorkflowJob {
                action, repository, ..
            } => (Some(action.as_str().to_string()), Some(repository.clone())),
            UpstreamEvent::Audit {
                action, repository, ..
            } => (action.clone(), repository.clone()),
        };

        let record = WebhookEvent {
            delivery_id: delivery.delivery_id.clone(),
            event_type: delivery.event_type.clone(),
            action,
            repository,
            payload,
            signature_verified: true,
            received_at: Utc::now(),
            processed_at: None,
            attempts: 0,
            last_error: None,
        };
        match self.store.insert_webhook_event(&record).await {
            Ok(()) => {}
            // raced on the primary key: same delivery arrived twice
            Err(StoreError::Conflict(_)) => {
                self.metrics.duplicates.add(1, &[]);
                return Ok(IngressOutcome::Duplicate {
                    delivery_id: delivery.delivery_id,
                });
            }
            Err(err) => return Err(err.into()),
        }
        self.remember(dedup_key);

        // once the event is persisted the delivery is accepted; enqueue
        // trouble is recorded on the event and recovered by retry_failed()
        let enqueued = match self.dispatch_event(&delivery.delivery_id, &event).await {
            Ok(enqueued) => enqueued,
            Err(err) => {
                tracing::error!(
                    "Dispatch of persisted delivery {} failed: {}",
                    delivery.delivery_id,
                    err
                );
                let _ = self
                    .store
                    .mark_webhook_processed(&delivery.delivery_id, Some(&err.to_string()))
                    .await;
                false
            }
        };
        self.metrics.accepted.add(1, &[]);
        Ok(IngressOutcome::Accepted {
            delivery_id: delivery.delivery_id,
            enqueued,
        })
    }

    /// Re-enqueue a persisted delivery, bypassing dedup.
    pub async fn replay(&self, delivery_id: &str) -> IngressResult<bool> {
        let record = self.store.get_webhook_event(delivery_id).await?;
        let event = parse_event(&record.event_type, &record.payload)?;
        let enqueued = self.dispatch_event(delivery_id, &event).await?;
        tracing::info!("Replayed delivery {}: enqueued={}", delivery_id, enqueued);
        Ok(enqueued)
    }

    /// Re-enqueue events whose last processing attempt failed, up to the cap.
    pub async fn retry_failed(&self) -> IngressResult<u32> {
        let failed = self
            .store
            .failed_webhook_events(self.config.retry_cap as i64)
            .await?;
        let mut retried = 0;
        for record in failed {
            match self.replay(&record.delivery_id).await {
                Ok(true) => retried += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!("Retry failed for {}: {}", record.delivery_id, err);
                }
            }
        }
        Ok(retried)
    }

    /// For work-producing events, enqueue a dispatch message; audit events
    /// are persisted only. Returns whether a message was enqueued.
    async fn dispatch_event(
        &self,
        delivery_id: &str,
        event: &UpstreamEvent,
    ) -> IngressResult<bool> {
        let UpstreamEvent::WorkflowJob {
            action,
            repository,
            facts,
        } = event
        else {
            return Ok(false);
        };

        let payload = DispatchPayload {
            delivery_id: delivery_id.to_string(),
            event: "workflow_job".to_string(),
            action: *action,
            repository: repository.clone(),
            facts: facts.clone(),
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| IngressError::MalformedPayload(e.to_string()))?;

        self.queue
            .enqueue(
                payload.priority(),
                &body,
                EnqueueOpts {
                    dedup_key: Some(format!(
                        "dispatch:{}:{}:{}",
                        repository,
                        facts.upstream_job_id,
                        action.as_str()
                    )),
                    ..Default::default()
                },
            )
            .await?;
        Ok(true)
    }

    fn seen_recently(&self, key: &str) -> bool {
        let now = Utc::now();
        // opportunistic pruning keeps the cache bounded
        self.dedup.retain(|_, expiry| *expiry > now);
        self.dedup.get(key).is_some_and(|expiry| *expiry > now)
    }

    fn remember(&self, key: String) {
        self.dedup.insert(
            key,
            Utc::now() + Duration::seconds(self.config.dedup_ttl_s as i64),
        );
    }
}

/// `sha256=<hex>` HMAC over the raw body, compared in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = const_hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    format!("sha256={}", const_hex::encode(mac.finalize().into_bytes()))
}

fn composite_key(event_type: &str, delivery_id: &str, event: &UpstreamEvent) -> String {
    let action = match event {
        UpstreamEvent::WorkflowJob { action, .. } => action.as_str().to_string(),
        UpstreamEvent::Audit { action, .. } => action.clone().unwrap_or_default(),
    };
    let repository = event
        .repository()
        .map(|r| r.to_string())
        .unwrap_or_default();
    format!(
        "{}:{}:{}:{}:{}",
        event_type,
        delivery_id,
        action,
        repository,
        event.primary_entity_id()
    )
}

/// Parse an incoming payload into the typed event model. Only the fields the
/// router needs are extracted; the payload itself stays opaque.
pub fn parse_event(
    event_type: &str,
    payload: &serde_json::Value,
) -> IngressResult<UpstreamEvent> {
    let repository = payload
        .pointer("/repository/full_name")
        .and_then(|v| v.as_str())
        .map(Repository::new)
        .transpose()
        .map_err(|e| IngressError::MalformedPayload(e.to_string()))?;
    let action_str = payload.get("action").and_then(|v| v.as_str());

    if event_type != "workflow_job" {
        return Ok(UpstreamEvent::Audit {
            event_type: event_type.to_string(),
            action: action_str.map(str::to_string),
            repository,
        });
    }

    let action = action_str
        .ok_or_else(|| IngressError::MalformedPayload("workflow_job without action".to_string()))
        .and_then(|s| {
            WorkflowJobAction::from_str(s).map_err(IngressError::MalformedPayload)
        })?;
    let repository = repository.ok_or_else(|| {
        IngressError::MalformedPayload("workflow_job without repository".to_string())
    })?;
    let job = payload
        .get("workflow_job")
        .ok_or_else(|| IngressError::MalformedPayload("missing workflow_job object".to_string()))?;

    let labels: BTreeSet<String> = job
        .get("labels")
        .and_then(|v| v.as_array())
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let facts = WorkflowJobFacts {
        upstream_job_id: job
            .get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| IngressError::MalformedPayload("workflow_job.id missing".to_string()))?,
        upstream_run_id: job.get("run_id").and_then(|v| v.as_i64()).unwrap_or(0),
        workflow: job
            .get("workflow_name")
            .and_then(|v| v.as_str())
            .or_else(|| job.get("name").and_then(|v| v.as_str()))
            .unwrap_or("unknown")
            .to_string(),
        labels,
        branch: job
            .get("head_branch")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        conclusion: job
            .get("conclusion")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    };

    Ok(UpstreamEvent::WorkflowJob {
        action,
        repository,
        facts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::QueueConfig;
    use crate::test_utils::store::temp_store;
    use runnerhub_types::JobPriority;
    use serde_json::json;

    const SECRET: &str = "webhook-secret";

    fn workflow_job_body(delivery: &str, action: &str, repo: &str, job_id: i64) -> Vec<u8> {
        let _ = delivery;
        serde_json::to_vec(&json!({
            "action": action,
            "repository": {"full_name": repo},
            "workflow_job": {
                "id": job_id,
                "run_id": 77,
                "workflow_name": "ci",
                "head_branch": "main",
                "labels": ["self-hosted", "linux"],
            },
        }))
        .unwrap()
    }

    async fn test_ingress() -> (Ingress, Queue, tempfile::TempDir) {
        let (store, dir) = temp_store().await;
        let queue = Queue::new(store.pool().clone(), QueueConfig::default());
        let meter = opentelemetry::global::meter("ingress-tests");
        let ingress = Ingress::new(
            store,
            queue.clone(),
            IngressConfig {
                secret: SECRET.to_string(),
                ..Default::default()
            },
            IngressMetrics::init(&meter),
        );
        (ingress, queue, dir)
    }

    fn delivery(id: &str, body: Vec<u8>) -> RawDelivery {
        let signature = sign_body(SECRET, &body);
        RawDelivery {
            event_type: "workflow_job".to_string(),
            delivery_id: id.to_string(),
            signature,
            body,
        }
    }

    #[test]
    fn signature_round_trip_and_tamper() {
        let body = b"payload";
        let signature = sign_body(SECRET, body);
        assert!(verify_signature(SECRET, body, &signature));
        assert!(!verify_signature(SECRET, b"tampered", &signature));
        assert!(!verify_signature("other-secret", body, &signature));
        assert!(!verify_signature(SECRET, body, "sha256=deadbeef"));
        assert!(!verify_signature(SECRET, body, "sha1=whatever"));
    }

    #[tokio::test]
    async fn happy_path_persists_and_enqueues() {
        let (ingress, queue, _dir) = test_ingress().await;
        let body = workflow_job_body("d1", "queued", "org/repo1", 42);

        let outcome = ingress.process(delivery("d1", body)).await.unwrap();
        assert_eq!(
            outcome,
            IngressOutcome::Accepted {
                delivery_id: "d1".to_string(),
                enqueued: true
            }
        );
        assert_eq!(queue.depth(Some(JobPriority::Normal)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bad_signature_rejected_before_persist() {
        let (ingress, queue, _dir) = test_ingress().await;
        let body = workflow_job_body("d1", "queued", "org/repo1", 42);
        let raw = RawDelivery {
            signature: "sha256=0000000000000000000000000000000000000000000000000000000000000000"
                .to_string(),
            ..delivery("d1", body)
        };

        let err = ingress.process(raw).await.unwrap_err();
        assert!(matches!(err, IngressError::BadSignature));
        assert_eq!(queue.depth(None).await.unwrap(), 0);
        // nothing persisted
        assert!(ingress.store.get_webhook_event("d1").await.is_err());
    }

    #[tokio::test]
    async fn duplicate_delivery_within_ttl_is_dropped() {
        let (ingress, queue, _dir) = test_ingress().await;
        let body = workflow_job_body("d2", "queued", "org/repo1", 42);

        let first = ingress.process(delivery("d2", body.clone())).await.unwrap();
        assert!(matches!(first, IngressOutcome::Accepted { .. }));

        let second = ingress.process(delivery("d2", body)).await.unwrap();
        assert_eq!(
            second,
            IngressOutcome::Duplicate {
                delivery_id: "d2".to_string()
            }
        );
        assert_eq!(queue.depth(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_headers_are_validation_errors() {
        let (ingress, _queue, _dir) = test_ingress().await;
        let body = workflow_job_body("d1", "queued", "org/repo1", 42);
        let mut raw = delivery("d1", body);
        raw.event_type = String::new();

        let err = ingress.process(raw).await.unwrap_err();
        assert!(matches!(err, IngressError::MissingHeader(_)));
    }

    #[tokio::test]
    async fn audit_events_persist_without_work() {
        let (ingress, queue, _dir) = test_ingress().await;
        let body = serde_json::to_vec(&json!({
            "action": "opened",
            "repository": {"full_name": "org/repo1"},
        }))
        .unwrap();
        let raw = RawDelivery {
            event_type: "pull_request".to_string(),
            delivery_id: "d3".to_string(),
            signature: sign_body(SECRET, &body),
            body,
        };

        let outcome = ingress.process(raw).await.unwrap();
        assert_eq!(
            outcome,
            IngressOutcome::Accepted {
                delivery_id: "d3".to_string(),
                enqueued: false
            }
        );
        assert_eq!(queue.depth(None).await.unwrap(), 0);
        assert!(ingress.store.get_webhook_event("d3").await.is_ok());
    }

    #[tokio::test]
    async fn replay_bypasses_dedup() {
        let (ingress, queue, _dir) = test_ingress().await;
        let body = workflow_job_body("d4", "queued", "org/repo1", 42);
        ingress.process(delivery("d4", body)).await.unwrap();

        // drain the first message so the dispatch dedup key is free
        let msg = queue
            .reserve("w", chrono::Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        queue.ack(msg.id).await.unwrap();

        assert!(ingress.replay("d4").await.unwrap());
        assert_eq!(queue.depth(None).await.unwrap(), 1);
    }

    #[test]
    fn deploy_workflows_enqueue_critical() {
        let body = workflow_job_body("d5", "queued", "org/repo1", 9);
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let UpstreamEvent::WorkflowJob { facts, .. } =
            parse_event("workflow_job", &payload).unwrap()
        else {
            panic!("expected workflow_job");
        };
        assert_eq!(facts.workflow, "ci");
        assert_eq!(facts.upstream_job_id, 9);
        assert!(facts.labels.contains("self-hosted"));
    }
}
