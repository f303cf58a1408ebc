use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;
use tracing::instrument;

use runnerhub_types::{
    Classify, ErrorCode, Job, Repository, RoutingDecision, RoutingRule, RuleId, Runner,
    RunnerStatus,
};

use crate::storage::{Store, StoreError};

const RULE_REFRESH_S: i64 = 60;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for RouterError {
    fn code(&self) -> ErrorCode {
        match self {
            RouterError::Store(e) => e.code(),
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;

/// Everything the dispatcher needs from one routing evaluation.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub matched_rule: Option<RoutingRule>,
    /// Runners satisfying the target labels, IDLE first in rank order
    pub candidates: Vec<Runner>,
    pub selected: Option<Runner>,
    pub reason: String,
}

impl RouteOutcome {
    /// Labels a freshly created runner must carry to satisfy this decision.
    pub fn required_labels(&self) -> Option<&BTreeSet<String>> {
        self.matched_rule.as_ref().map(|r| &r.targets.runner_labels)
    }

    pub fn exclusive(&self) -> bool {
        self.matched_rule
            .as_ref()
            .is_some_and(|r| r.targets.exclusive)
    }
}

struct RuleCache {
    /// Enabled rules, priority descending
    rules: Vec<RoutingRule>,
    /// label -> rules requiring that label, for the pre-filter
    label_index: HashMap<String, HashSet<RuleId>>,
    loaded_at: DateTime<Utc>,
}

/// Label- and attribute-based rule engine selecting a target runner for each
/// job. Rules are cached and refreshed from the store periodically and on
/// mutation.
pub struct JobRouter {
    store: Store,
    cache: RwLock<Option<RuleCache>>,
}

impl JobRouter {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    /// Force a cache rebuild; called after rule mutations.
    pub async fn reload(&self) -> RouterResult<()> {
        let rules = self.store.list_rules(true).await?;
        let mut label_index: HashMap<String, HashSet<RuleId>> = HashMap::new();
        for rule in &rules {
            for label in &rule.conditions.labels {
                label_index
                    .entry(label.clone())
                    .or_default()
                    .insert(rule.id.clone());
            }
        }
        *self.cache.write().unwrap() = Some(RuleCache {
            rules,
            label_index,
            loaded_at: Utc::now(),
        });
        Ok(())
    }

    async fn rules_fresh(&self) -> RouterResult<()> {
        let stale = {
            let cache = self.cache.read().unwrap();
            match cache.as_ref() {
                Some(cache) => Utc::now() - cache.loaded_at > Duration::seconds(RULE_REFRESH_S),
                None => true,
            }
        };
        if stale {
            self.reload().await?;
        }
        Ok(())
    }

    /// Evaluate the rules for a job and persist a RoutingDecision.
    #[instrument(level = "debug", skip(self, job), fields(subsys = "Router", job_id = %job.id))]
    pub async fn route(
        &self,
        job: &Job,
        branch: Option<&str>,
        event: &str,
    ) -> RouterResult<RouteOutcome> {
        let outcome = self.evaluate(job, branch, event).await?;

        let decision = RoutingDecision {
            job_id: job.id,
            matched_rule_id: outcome.matched_rule.as_ref().map(|r| r.id.clone()),
            selected_runner_id: outcome.selected.as_ref().map(|r| r.id),
            candidate_count: outcome.candidates.len() as u32,
            reason: outcome.reason.clone(),
            timestamp: Utc::now(),
        };
        self.store.insert_decision(&decision).await?;
        Ok(outcome)
    }

    /// Dry-run evaluation; nothing is persisted.
    pub async fn preview(
        &self,
        job: &Job,
        branch: Option<&str>,
        event: &str,
    ) -> RouterResult<RouteOutcome> {
        self.evaluate(job, branch, event).await
    }

    async fn evaluate(
        &self,
        job: &Job,
        branch: Option<&str>,
        event: &str,
    ) -> RouterResult<RouteOutcome> {
        self.rules_fresh().await?;

        let matched = {
            let cache_guard = self.cache.read().unwrap();
            let cache = cache_guard.as_ref().expect("cache populated by rules_fresh");

            // pre-filter: count per-rule label hits against the index so a
            // rule survives iff conditions.labels is a subset of job.labels
            let mut hits: HashMap<&RuleId, usize> = HashMap::new();
            for label in &job.labels {
                if let Some(rule_ids) = cache.label_index.get(label) {
                    for id in rule_ids {
                        *hits.entry(id).or_default() += 1;
                    }
                }
            }

            cache
                .rules
                .iter()
                .find(|rule| {
                    let wanted = rule.conditions.labels.len();
                    if wanted > 0 && hits.get(&rule.id).copied().unwrap_or(0) != wanted {
                        return false;
                    }
                    rule_conditions_hold(rule, job, branch, event)
                })
                .cloned()
        };

        match matched {
            Some(rule) => {
                let pool_repo = rule
                    .targets
                    .pool_override
                    .clone()
                    .unwrap_or_else(|| job.repository.clone());
                let candidates = self
                    .collect_candidates(
                        &pool_repo,
                        &rule.targets.runner_labels,
                        rule.targets.exclusive,
                    )
                    .await?;
                let selected = pick_best(&candidates);
                let reason = match (&selected, candidates.is_empty()) {
                    (Some(runner), _) => {
                        format!("rule {} matched; selected runner {}", rule.id, runner.name)
                    }
                    (None, true) if rule.targets.exclusive => format!(
                        "rule {} matched (exclusive); no runner with the exact label set",
                        rule.id
                    ),
                    (None, true) => format!("rule {} matched; no candidate runners", rule.id),
                    (None, false) => {
                        format!("rule {} matched; {} busy candidates", rule.id, candidates.len())
                    }
                };
                Ok(RouteOutcome {
                    matched_rule: Some(rule),
                    candidates,
                    selected,
                    reason,
                })
            }
            None => {
                // default policy: any IDLE runner for the repo carrying a
                // superset of the job's labels
                let candidates = self
                    .collect_candidates(&job.repository, &job.labels, false)
                    .await?;
                let selected = pick_best(&candidates);
                let reason = match &selected {
                    Some(runner) => {
                        format!("no rule matched; default policy selected {}", runner.name)
                    }
                    None => "no rule matched; default policy found no idle runner".to_string(),
                };
                Ok(RouteOutcome {
                    matched_rule: None,
                    candidates,
                    selected,
                    reason,
                })
            }
        }
    }

    async fn collect_candidates(
        &self,
        repository: &Repository,
        runner_labels: &BTreeSet<String>,
        exclusive: bool,
    ) -> RouterResult<Vec<Runner>> {
        let runners = self.store.list_runners(Some(repository), None, None).await?;
        let mut candidates: Vec<Runner> = runners
            .into_iter()
            .filter(|runner| {
                matches!(runner.status, RunnerStatus::Idle | RunnerStatus::Busy)
                    && if exclusive {
                        runner.labels == *runner_labels
                    } else {
                        runner.labels.is_superset(runner_labels)
                    }
            })
            .collect();
        candidates.sort_by(candidate_rank);
        Ok(candidates)
    }
}

fn rule_conditions_hold(
    rule: &RoutingRule,
    job: &Job,
    branch: Option<&str>,
    event: &str,
) -> bool {
    let conditions = &rule.conditions;
    if let Some(pattern) = &conditions.repository_pattern {
        if !glob_match(pattern, job.repository.as_ref()) {
            return false;
        }
    }
    if let Some(pattern) = &conditions.workflow_pattern {
        if !glob_match(pattern, &job.workflow) {
            return false;
        }
    }
    if let Some(pattern) = &conditions.branch_pattern {
        match branch {
            Some(branch) if glob_match(pattern, branch) => {}
            _ => return false,
        }
    }
    if let Some(wanted_event) = &conditions.event {
        if wanted_event != event {
            return false;
        }
    }
    true
}

/// IDLE before BUSY; among IDLE, longest idle first, then fewest lifetime
/// jobs served.
fn candidate_rank(a: &Runner, b: &Runner) -> std::cmp::Ordering {
    let status_rank = |r: &Runner| match r.status {
        RunnerStatus::Idle => 0u8,
        _ => 1,
    };
    status_rank(a)
        .cmp(&status_rank(b))
        .then_with(|| {
            let epoch = DateTime::<Utc>::MIN_UTC;
            let a_seen = a.last_heartbeat.unwrap_or(epoch);
            let b_seen = b.last_heartbeat.unwrap_or(epoch);
            a_seen.cmp(&b_seen)
        })
        .then_with(|| a.jobs_served.cmp(&b.jobs_served))
}

fn pick_best(candidates: &[Runner]) -> Option<Runner> {
    candidates
        .first()
        .filter(|runner| runner.status == RunnerStatus::Idle)
        .cloned()
}

/// Glob with `*` matching any run of non-`/` characters. `**` is not
/// supported; matching is case-sensitive.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    // iterative wildcard matching with backtracking to the last star
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == text[t]) && pattern[p] != '*' {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // expand the star by one more char, unless that char is '/'
            if text[star_t] == '/' {
                return false;
            }
            star = Some((star_p, star_t + 1));
            p = star_p + 1;
            t = star_t + 1;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::{queued_job, rule, runner_with};
    use crate::test_utils::store::temp_store;
    use runnerhub_types::{RuleTargets, RunnerStatus};

    #[test]
    fn glob_star_does_not_cross_slash() {
        assert!(glob_match("org/*", "org/repo1"));
        assert!(!glob_match("*", "org/repo1"));
        assert!(glob_match("*/*", "org/repo1"));
        assert!(!glob_match("org/*", "org/a/b"));
        assert!(glob_match("org/repo*", "org/repo-api"));
        assert!(glob_match("deploy-*", "deploy-prod"));
        assert!(!glob_match("deploy-*", "Deploy-prod"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "axxbyyc"));
    }

    #[tokio::test]
    async fn first_matching_rule_by_priority_wins() {
        let (store, _dir) = temp_store().await;
        let router = JobRouter::new(store.clone());

        let low = rule("general", 10, &["self-hosted"], &["self-hosted"], false);
        let mut high = rule("gpu", 100, &["gpu"], &["gpu", "cuda"], false);
        high.conditions.repository_pattern = Some("org/*".to_string());
        store.insert_rule(&low).await.unwrap();
        store.insert_rule(&high).await.unwrap();

        let job = queued_job("org/repo1", &["self-hosted", "gpu"]);
        let outcome = router.route(&job, Some("main"), "workflow_job").await.unwrap();
        assert_eq!(
            outcome.matched_rule.unwrap().id.to_string(),
            "gpu".to_string()
        );
    }

    #[tokio::test]
    async fn label_prefilter_eliminates_non_subset_rules() {
        let (store, _dir) = temp_store().await;
        let router = JobRouter::new(store.clone());

        store
            .insert_rule(&rule("gpu", 100, &["gpu", "cuda-12"], &["gpu"], false))
            .await
            .unwrap();

        // job carries only one of the two required labels
        let job = queued_job("org/repo1", &["self-hosted", "gpu"]);
        let outcome = router.route(&job, None, "workflow_job").await.unwrap();
        assert!(outcome.matched_rule.is_none());
    }

    #[tokio::test]
    async fn exclusive_requires_exact_label_set() {
        let (store, _dir) = temp_store().await;
        let router = JobRouter::new(store.clone());

        store
            .insert_rule(&rule(
                "gpu-exclusive",
                100,
                &["gpu"],
                &["gpu", "cuda-12"],
                true,
            ))
            .await
            .unwrap();

        // superset labels: not a candidate under an exclusive rule
        let superset = runner_with("org/repo1", &["gpu", "cuda-12", "linux"], RunnerStatus::Idle);
        store.insert_runner(&superset).await.unwrap();

        let job = queued_job("org/repo1", &["gpu"]);
        let outcome = router.route(&job, None, "workflow_job").await.unwrap();
        assert!(outcome.matched_rule.is_some());
        assert!(outcome.candidates.is_empty());
        assert!(outcome.selected.is_none());

        // exact labels: candidate
        let exact = runner_with("org/repo1", &["gpu", "cuda-12"], RunnerStatus::Idle);
        store.insert_runner(&exact).await.unwrap();
        let outcome = router.route(&job, None, "workflow_job").await.unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.selected.unwrap().id, exact.id);
    }

    #[tokio::test]
    async fn default_policy_picks_idle_superset_runner() {
        let (store, _dir) = temp_store().await;
        let router = JobRouter::new(store.clone());

        let busy = runner_with("org/repo1", &["self-hosted", "linux"], RunnerStatus::Busy);
        let idle = runner_with("org/repo1", &["self-hosted", "linux"], RunnerStatus::Idle);
        store.insert_runner(&busy).await.unwrap();
        store.insert_runner(&idle).await.unwrap();

        let job = queued_job("org/repo1", &["self-hosted"]);
        let outcome = router.route(&job, None, "workflow_job").await.unwrap();
        assert!(outcome.matched_rule.is_none());
        assert_eq!(outcome.selected.unwrap().id, idle.id);
    }

    #[tokio::test]
    async fn ties_break_by_longest_idle_then_fewest_jobs() {
        let (store, _dir) = temp_store().await;
        let router = JobRouter::new(store.clone());

        let mut older = runner_with("org/repo1", &["self-hosted"], RunnerStatus::Idle);
        older.last_heartbeat = Some(Utc::now() - Duration::minutes(30));
        let mut newer = runner_with("org/repo1", &["self-hosted"], RunnerStatus::Idle);
        newer.last_heartbeat = Some(Utc::now());
        store.insert_runner(&older).await.unwrap();
        store.insert_runner(&newer).await.unwrap();

        let job = queued_job("org/repo1", &["self-hosted"]);
        let outcome = router.route(&job, None, "workflow_job").await.unwrap();
        assert_eq!(outcome.selected.unwrap().id, older.id);
    }

    #[tokio::test]
    async fn pool_override_redirects_candidate_search() {
        let (store, _dir) = temp_store().await;
        let router = JobRouter::new(store.clone());

        let mut shared = rule("shared", 50, &[], &["self-hosted"], false);
        shared.targets = RuleTargets {
            runner_labels: ["self-hosted".to_string()].into(),
            pool_override: Some(Repository::new("org/shared-pool").unwrap()),
            exclusive: false,
        };
        store.insert_rule(&shared).await.unwrap();

        let pooled = runner_with("org/shared-pool", &["self-hosted"], RunnerStatus::Idle);
        store.insert_runner(&pooled).await.unwrap();

        let job = queued_job("org/repo1", &["self-hosted"]);
        let outcome = router.route(&job, None, "workflow_job").await.unwrap();
        assert_eq!(outcome.selected.unwrap().id, pooled.id);
    }

    #[tokio::test]
    async fn every_route_writes_a_decision() {
        let (store, _dir) = temp_store().await;
        let router = JobRouter::new(store.clone());

        let job = queued_job("org/repo1", &["self-hosted"]);
        router.route(&job, None, "workflow_job").await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM routing_decision")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        // preview is a dry run
        router.preview(&job, None, "workflow_job").await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM routing_decision")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
