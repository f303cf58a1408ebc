use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use runnerhub_types::{Repository, UpstreamSnapshot};

use crate::subsystems::upstream::{
    RegistrationToken, UpstreamApi, UpstreamError, UpstreamResult, UpstreamRunner, WorkflowRun,
};

/// Upstream fake: issues synthetic tokens and records removals.
#[derive(Default)]
pub struct MockUpstream {
    tokens_issued: AtomicU64,
    removed: Mutex<Vec<(Repository, i64)>>,
    fail_tokens: Mutex<bool>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens_issued(&self) -> u64 {
        self.tokens_issued.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> Vec<(Repository, i64)> {
        self.removed.lock().unwrap().clone()
    }

    pub fn fail_token_issuance(&self) {
        *self.fail_tokens.lock().unwrap() = true;
    }
}

#[async_trait]
impl UpstreamApi for MockUpstream {
    async fn issue_runner_registration_token(
        &self,
        repository: &Repository,
    ) -> UpstreamResult<RegistrationToken> {
        if *self.fail_tokens.lock().unwrap() {
            return Err(UpstreamError::Upstream5xx { status: 503 });
        }
        let n = self.tokens_issued.fetch_add(1, Ordering::Relaxed);
        Ok(RegistrationToken {
            token: format!("mock-token-{}-{}", repository.normalized(), n),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    async fn remove_runner(&self, repository: &Repository, runner_id: i64) -> UpstreamResult<()> {
        self.removed
            .lock()
            .unwrap()
            .push((repository.clone(), runner_id));
        Ok(())
    }

    async fn list_runners(&self, _repository: &Repository) -> UpstreamResult<Vec<UpstreamRunner>> {
        Ok(Vec::new())
    }

    async fn list_workflow_runs(
        &self,
        _repository: &Repository,
        _status: Option<&str>,
    ) -> UpstreamResult<Vec<WorkflowRun>> {
        Ok(Vec::new())
    }

    fn rate_limit(&self) -> UpstreamSnapshot {
        UpstreamSnapshot {
            remaining: Some(5000),
            reset: Some(Utc::now() + Duration::hours(1)),
        }
    }
}
