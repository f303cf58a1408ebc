//! End-to-end scenarios over the mock runtime and mock upstream, driving the
//! system through the same entry points production uses: the HTTP router for
//! webhook deliveries and the dispatcher workers for queue drainage.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::json;
use std::collections::BTreeSet;
use tower::util::ServiceExt;

use runnerhub_types::{
    JobPriority, JobStatus, PoolPolicy, Repository, RunnerStatus, ScaleDirection, ScalingTrigger,
};
use utils::telemetry::HttpMetrics;

use crate::config::Config;
use crate::http::server::make_router;
use crate::runtime::ContainerRuntime;
use crate::subsystems::ingress::sign_body;
use crate::test_utils::app::{test_context, TestApp, TEST_WEBHOOK_SECRET};
use crate::test_utils::fixtures;

fn workflow_job_body(action: &str, repo: &str, job_id: i64, labels: &[&str]) -> Vec<u8> {
    let mut job = json!({
        "id": job_id,
        "run_id": job_id + 1000,
        "workflow_name": "ci",
        "head_branch": "main",
        "labels": labels,
    });
    if action == "completed" {
        job["conclusion"] = json!("success");
    }
    serde_json::to_vec(&json!({
        "action": action,
        "repository": {"full_name": repo},
        "workflow_job": job,
    }))
    .unwrap()
}

fn webhook_request(delivery_id: &str, body: Vec<u8>) -> Request<Body> {
    let signature = sign_body(TEST_WEBHOOK_SECRET, &body);
    Request::builder()
        .method("POST")
        .uri("/webhooks/github")
        .header(header::USER_AGENT, "GitHub-Hookshot/abc123")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-github-event", "workflow_job")
        .header("x-github-delivery", delivery_id)
        .header("x-hub-signature-256", signature)
        .body(Body::from(body))
        .unwrap()
}

fn test_router(app: &TestApp) -> axum::Router {
    let meter = opentelemetry::global::meter("scenario-tests");
    make_router(
        Config::default(),
        app.dispatcher.clone(),
        test_context(),
        HttpMetrics::init(&meter),
    )
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// S1: queued webhook -> 202 -> QUEUED job -> assignment to an idle runner ->
// completed webhook -> COMPLETED job, runner released and destroyed.
#[tokio::test]
async fn s1_happy_path() {
    crate::init_tracing_tests();
    let app = TestApp::new().await;
    let router = test_router(&app);
    let repo = Repository::new("org/repo1").unwrap();

    // pool exists with one warm runner
    app.pool.scale_up(&repo, 1, None).await.unwrap();

    let response = router
        .clone()
        .oneshot(webhook_request(
            "d1",
            workflow_job_body("queued", "org/repo1", 42, &["self-hosted", "linux"]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["delivery_id"], "d1");

    assert_eq!(app.queue.depth(Some(JobPriority::Normal)).await.unwrap(), 1);

    app.drain_queue(10).await;

    let job = app
        .store
        .find_job_by_upstream(&repo, 42)
        .await
        .unwrap()
        .expect("job created by dispatch");
    assert_eq!(job.status, JobStatus::Assigned);
    let runner_id = job.assigned_runner_id.expect("runner assigned");
    assert_eq!(
        app.store.get_runner(runner_id).await.unwrap().status,
        RunnerStatus::Busy
    );

    // upstream reports completion
    let response = router
        .oneshot(webhook_request(
            "d1-done",
            workflow_job_body("completed", "org/repo1", 42, &["self-hosted", "linux"]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    app.drain_queue(10).await;

    let job = app.store.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());

    // the ephemeral runner went OFFLINE and its container is gone
    let runner = app.store.get_runner(runner_id).await.unwrap();
    assert_eq!(runner.status, RunnerStatus::Offline);
    assert!(app
        .store
        .list_containers(None, None)
        .await
        .unwrap()
        .is_empty());
}

// S2: four simultaneous jobs against one runner; queue depth trips the
// scaler, which adds scale_increment runners; all four end up assigned.
#[tokio::test]
async fn s2_scale_up_on_queue_depth() {
    crate::init_tracing_tests();
    let app = TestApp::with_policy(PoolPolicy {
        min_runners: 1,
        max_runners: 10,
        scale_increment: 3,
        queue_threshold: 3,
        cooldown_s: 0,
        startup_timeout_s: 5,
        ..PoolPolicy::default()
    })
    .await;
    let repo = Repository::new("org/repo2").unwrap();
    app.pool.scale_up(&repo, 1, None).await.unwrap();

    for job_id in 1..=4 {
        let delivery = format!("s2-{job_id}");
        let body = workflow_job_body("queued", "org/repo2", job_id, &["self-hosted"]);
        let outcome = app
            .ingress
            .process(crate::subsystems::ingress::RawDelivery {
                event_type: "workflow_job".to_string(),
                delivery_id: delivery.clone(),
                signature: sign_body(TEST_WEBHOOK_SECRET, &body),
                body,
            })
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            crate::subsystems::ingress::IngressOutcome::Accepted { .. }
        ));
    }

    // one pass per message: the first grabs the warm runner, the rest go
    // back on the queue waiting for capacity
    for _ in 0..4 {
        app.dispatcher.work_once("s2-worker").await;
    }
    let (depth, _) = app.store.queued_stats(&repo).await.unwrap();
    assert!(depth >= 3, "three jobs should still be queued, got {depth}");

    app.scaler.evaluate_pool(&repo).await.unwrap();

    let events = app.store.list_scaling_events(&repo, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].direction, ScaleDirection::Up);
    assert_eq!(events[0].trigger, ScalingTrigger::QueueDepth);
    assert_eq!(events[0].after - events[0].before, 3);

    // nacked messages become visible again after the backoff; force them due
    sqlx::query("UPDATE queue_message SET visible_at = enqueued_at WHERE state = 'available'")
        .execute(app.store.pool())
        .await
        .unwrap();
    app.drain_queue(30).await;

    for job_id in 1..=4 {
        let job = app
            .store
            .find_job_by_upstream(&repo, job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Assigned, "job {job_id}");
    }
}

// S3: a valid body with a wrong HMAC is rejected with 401 and leaves no
// trace in the store or queue.
#[tokio::test]
async fn s3_signature_rejection() {
    let app = TestApp::new().await;
    let router = test_router(&app);

    let body = workflow_job_body("queued", "org/repo1", 7, &["self-hosted"]);
    let mut request = webhook_request("d-bad", body);
    request.headers_mut().insert(
        "x-hub-signature-256",
        "sha256=0000000000000000000000000000000000000000000000000000000000000000"
            .parse()
            .unwrap(),
    );

    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(app.store.get_webhook_event("d-bad").await.is_err());
    assert_eq!(app.queue.depth(None).await.unwrap(), 0);
}

// S4: two POSTs with the same delivery id inside the dedup TTL: first 202,
// second 200, one persisted event, one queued message.
#[tokio::test]
async fn s4_dedup() {
    let app = TestApp::new().await;
    let router = test_router(&app);
    let body = workflow_job_body("queued", "org/repo1", 9, &["self-hosted"]);

    let first = router
        .clone()
        .oneshot(webhook_request("d2", body.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = router.oneshot(webhook_request("d2", body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let body = body_json(second).await;
    assert_eq!(body["status"], "duplicate");

    assert!(app.store.get_webhook_event("d2").await.is_ok());
    assert_eq!(app.queue.depth(None).await.unwrap(), 1);
}

// S5: an exclusive rule matches but the only runner carries a superset of
// the required labels. Preview shows the match with zero candidates; with
// dynamic labels the pool creates an exactly-labeled runner, without them the
// job fails unrecoverably.
#[tokio::test]
async fn s5_exclusive_routing() {
    crate::init_tracing_tests();
    let app = TestApp::new().await;
    let router = test_router(&app);
    let repo = Repository::new("org/repo1").unwrap();

    app.store
        .insert_rule(&fixtures::rule(
            "gpu-exclusive",
            100,
            &["gpu"],
            &["gpu", "cuda-12"],
            true,
        ))
        .await
        .unwrap();
    app.store
        .insert_runner(&fixtures::runner_with(
            "org/repo1",
            &["gpu", "cuda-12", "linux"],
            RunnerStatus::Idle,
        ))
        .await
        .unwrap();

    let preview = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/routing/preview")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({
                        "repository": "org/repo1",
                        "workflow": "train",
                        "labels": ["gpu"],
                    }))
                    .unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(preview.status(), StatusCode::OK);
    let body = body_json(preview).await;
    assert_eq!(body["data"]["matches"], true);
    assert_eq!(body["data"]["exclusive"], true);
    assert_eq!(body["data"]["candidates"], json!([]));

    // dynamic labels (default): the dispatcher's pending allocation hands the
    // rule's label set to the scaler, which creates exactly-labeled capacity
    let dynamic = TestApp::with_policy(PoolPolicy {
        min_runners: 0,
        max_runners: 10,
        queue_threshold: 1,
        cooldown_s: 0,
        startup_timeout_s: 5,
        ..PoolPolicy::default()
    })
    .await;
    dynamic
        .store
        .insert_rule(&fixtures::rule(
            "gpu-exclusive",
            100,
            &["gpu"],
            &["gpu", "cuda-12"],
            true,
        ))
        .await
        .unwrap();

    let body = workflow_job_body("queued", "org/repo1", 56, &["gpu"]);
    dynamic
        .ingress
        .process(crate::subsystems::ingress::RawDelivery {
            event_type: "workflow_job".to_string(),
            delivery_id: "s5-dynamic".to_string(),
            signature: sign_body(TEST_WEBHOOK_SECRET, &body),
            body,
        })
        .await
        .unwrap();

    // the first pass finds no exact-label runner and leaves the label demand
    // with the scaler
    dynamic.dispatcher.work_once("s5-worker").await;
    dynamic.scaler.evaluate_pool(&repo).await.unwrap();

    let exact: BTreeSet<String> = ["gpu".to_string(), "cuda-12".to_string()].into();
    let runners = dynamic
        .store
        .list_runners(Some(&repo), Some(RunnerStatus::Idle), None)
        .await
        .unwrap();
    assert_eq!(runners.len(), 1);
    assert_eq!(runners[0].labels, exact);

    // redelivery routes onto the exactly-labeled runner
    sqlx::query("UPDATE queue_message SET visible_at = enqueued_at WHERE state = 'available'")
        .execute(dynamic.store.pool())
        .await
        .unwrap();
    dynamic.drain_queue(10).await;

    let job = dynamic
        .store
        .find_job_by_upstream(&repo, 56)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Assigned);
    let assigned = dynamic
        .store
        .get_runner(job.assigned_runner_id.unwrap())
        .await
        .unwrap();
    assert_eq!(assigned.labels, exact);

    // with dynamic labels forbidden, allocation is impossible
    let strict = TestApp::with_policy(PoolPolicy {
        dynamic_labels: false,
        ..PoolPolicy::default()
    })
    .await;
    strict
        .store
        .insert_rule(&fixtures::rule(
            "gpu-exclusive",
            100,
            &["gpu"],
            &["gpu", "cuda-12"],
            true,
        ))
        .await
        .unwrap();
    let body = workflow_job_body("queued", "org/repo1", 55, &["gpu"]);
    strict
        .ingress
        .process(crate::subsystems::ingress::RawDelivery {
            event_type: "workflow_job".to_string(),
            delivery_id: "s5-strict".to_string(),
            signature: sign_body(TEST_WEBHOOK_SECRET, &body),
            body,
        })
        .await
        .unwrap();
    strict.dispatcher.work_once("s5-worker").await;

    let job = strict
        .store
        .find_job_by_upstream(&Repository::new("org/repo1").unwrap(), 55)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("dynamic label"));
    assert_eq!(strict.queue.dead_count().await.unwrap(), 1);
}

// S6: containers for two repositories land on disjoint /24s inside the /16,
// each attached only to its own runnerhub network.
#[tokio::test]
async fn s6_network_isolation() {
    let app = TestApp::new().await;
    let repo_a = Repository::new("org/a").unwrap();
    let repo_b = Repository::new("org/b").unwrap();

    app.pool.scale_up(&repo_a, 1, None).await.unwrap();
    app.pool.scale_up(&repo_b, 1, None).await.unwrap();

    let net_a = app
        .store
        .active_network_for_repo(&repo_a)
        .await
        .unwrap()
        .unwrap();
    let net_b = app
        .store
        .active_network_for_repo(&repo_b)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(net_a.name, "runnerhub-net-org-a");
    assert_eq!(net_b.name, "runnerhub-net-org-b");
    let octet_a = net_a.subnet.network().octets()[2];
    let octet_b = net_b.subnet.network().octets()[2];
    assert_ne!(octet_a, octet_b);
    assert!(net_a.subnet.to_string().starts_with("10.100."));
    assert!(net_a.internal && net_b.internal);

    for repo in [&repo_a, &repo_b] {
        let runner = app
            .store
            .list_runners(Some(repo), None, None)
            .await
            .unwrap()
            .remove(0);
        let container = runner.container_id.unwrap();
        assert!(app.network.verify(&container).await.unwrap());

        let info = app.runtime.inspect(&container).await.unwrap();
        assert_eq!(info.networks.len(), 1);
        assert_eq!(info.networks[0], format!("runnerhub-net-{}", repo.normalized()));
    }
}

// explicit cancellation wins the race against dispatch
#[tokio::test]
async fn cancelled_job_is_never_assigned() {
    let app = TestApp::new().await;
    let repo = Repository::new("org/repo1").unwrap();
    app.pool.scale_up(&repo, 1, None).await.unwrap();

    let body = workflow_job_body("queued", "org/repo1", 70, &["self-hosted"]);
    app.ingress
        .process(crate::subsystems::ingress::RawDelivery {
            event_type: "workflow_job".to_string(),
            delivery_id: "cancel-1".to_string(),
            signature: sign_body(TEST_WEBHOOK_SECRET, &body),
            body,
        })
        .await
        .unwrap();

    // the job row only exists once a worker picks the message up, so seed it
    // the same way the dispatcher would and cancel before draining
    let job = fixtures::queued_job("org/repo1", &["self-hosted"]);
    let job = runnerhub_types::Job {
        upstream_job_id: 70,
        ..job
    };
    app.store.insert_job(&job).await.unwrap();
    app.dispatcher.cancel_job(job.id, 0).await.unwrap();

    app.drain_queue(10).await;

    let job = app.store.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.assigned_runner_id.is_none());
    // the warm runner is still free
    let (_, idle, _) = app.store.count_pool_runners(&repo).await.unwrap();
    assert_eq!(idle, 1);
}

// bearer token gates mutating routes when configured
#[tokio::test]
async fn bearer_token_protects_mutations() {
    let app = TestApp::new().await;
    let meter = opentelemetry::global::meter("scenario-tests");
    let router = make_router(
        Config {
            bearer_token: Some("hub-secret".to_string()),
            ..Config::default()
        },
        app.dispatcher.clone(),
        test_context(),
        HttpMetrics::init(&meter),
    );

    let unauthenticated = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/networks/cleanup")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    let authenticated = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/networks/cleanup")
                .header(header::AUTHORIZATION, "Bearer hub-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(authenticated.status(), StatusCode::OK);

    // read routes stay open
    let health = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
}

// the pools API round-trips policy updates and rejects invalid ones
#[tokio::test]
async fn pool_policy_api_round_trip() {
    let app = TestApp::new().await;
    let router = test_router(&app);
    let repo = Repository::new("org/repo1").unwrap();
    app.pool.ensure_pool(&repo).await.unwrap();

    let put = |policy: serde_json::Value| {
        Request::builder()
            .method("PUT")
            .uri("/runners/pools/org/repo1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&policy).unwrap()))
            .unwrap()
    };

    let mut policy = serde_json::to_value(PoolPolicy::default()).unwrap();
    policy["max_runners"] = json!(25);
    let response = router.clone().oneshot(put(policy)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = app.store.get_pool(&repo).await.unwrap().unwrap();
    assert_eq!(stored.policy.max_runners, 25);

    let mut bad = serde_json::to_value(PoolPolicy::default()).unwrap();
    bad["min_runners"] = json!(99);
    let response = router.oneshot(put(bad)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn queue_depth_visible_in_health() {
    let app = TestApp::new().await;
    let router = test_router(&app);

    app.queue
        .enqueue(JobPriority::Low, "{}", Default::default())
        .await
        .unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["queue_depth"], 1);
    assert_eq!(body["data"]["status"], "ok");
}
