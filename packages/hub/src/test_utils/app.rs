use std::sync::{Arc, LazyLock};
use std::time::Duration;

use runnerhub_types::PoolPolicy;
use utils::context::AppContext;
use utils::telemetry::HubMetrics;

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::storage::{Queue, QueueConfig, Store};
use crate::subsystems::ingress::{Ingress, IngressConfig};
use crate::subsystems::lifecycle::{CleanupConfig, LifecycleConfig, LifecycleManager, SamplerConfig};
use crate::subsystems::monitor::MonitorBus;
use crate::subsystems::network::NetworkIsolator;
use crate::subsystems::pool::{PoolManager, PoolManagerConfig};
use crate::subsystems::router::JobRouter;
use crate::subsystems::scaler::{AutoScaler, ScalerConfig};
use crate::test_utils::runtime::MockRuntime;
use crate::test_utils::store::temp_store;
use crate::test_utils::upstream::MockUpstream;

pub const TEST_WEBHOOK_SECRET: &str = "test-webhook-secret";

// shared across tests: an owned runtime must never be dropped inside an
// async context, so the context lives for the whole test process
static TEST_CONTEXT: LazyLock<AppContext> = LazyLock::new(AppContext::new);

pub fn test_context() -> AppContext {
    TEST_CONTEXT.clone()
}

/// A fully wired orchestrator over the mock runtime and mock upstream,
/// backed by a scratch database. Mirrors the production wiring in
/// `lib.rs::build_dispatcher`.
pub struct TestApp {
    pub store: Store,
    pub queue: Queue,
    pub bus: Arc<MonitorBus>,
    pub runtime: Arc<MockRuntime>,
    pub upstream: Arc<MockUpstream>,
    pub network: Arc<NetworkIsolator>,
    pub lifecycle: Arc<LifecycleManager>,
    pub router: Arc<JobRouter>,
    pub pool: Arc<PoolManager>,
    pub scaler: Arc<AutoScaler>,
    pub ingress: Arc<Ingress>,
    pub dispatcher: Arc<Dispatcher>,
    _dir: tempfile::TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_policy(PoolPolicy {
            min_runners: 0,
            max_runners: 10,
            cooldown_s: 0,
            startup_timeout_s: 5,
            ..PoolPolicy::default()
        })
        .await
    }

    pub async fn with_policy(default_policy: PoolPolicy) -> Self {
        let (store, dir) = temp_store().await;
        let queue = Queue::new(store.pool().clone(), QueueConfig::default());
        let bus = Arc::new(MonitorBus::new());
        let runtime = Arc::new(MockRuntime::new());
        let upstream = Arc::new(MockUpstream::new());

        let meter = opentelemetry::global::meter("hub-tests");
        let metrics = HubMetrics::init(&meter);

        let network = Arc::new(
            NetworkIsolator::new(
                runtime.clone(),
                store.clone(),
                bus.clone(),
                "10.100.0.0/16".parse().unwrap(),
                3600,
            )
            .unwrap(),
        );
        let lifecycle = Arc::new(LifecycleManager::new(
            runtime.clone(),
            store.clone(),
            network.clone(),
            bus.clone(),
            metrics.lifecycle.clone(),
            LifecycleConfig {
                sampler: SamplerConfig::default(),
                cleanup: CleanupConfig::default(),
                archive_dir: dir.path().join("archive"),
                default_stop_grace_s: 10,
            },
        ));
        let router = Arc::new(JobRouter::new(store.clone()));
        let pool = Arc::new(PoolManager::new(
            store.clone(),
            lifecycle.clone(),
            upstream.clone(),
            bus.clone(),
            PoolManagerConfig {
                default_policy,
                startup_poll_interval: Duration::from_millis(10),
                ..PoolManagerConfig::default()
            },
        ));
        let scaler = Arc::new(AutoScaler::new(
            store.clone(),
            pool.clone(),
            bus.clone(),
            metrics.scaler.clone(),
            ScalerConfig::default(),
        ));
        let ingress = Arc::new(Ingress::new(
            store.clone(),
            queue.clone(),
            IngressConfig {
                secret: TEST_WEBHOOK_SECRET.to_string(),
                ..Default::default()
            },
            metrics.ingress.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            ingress.clone(),
            router.clone(),
            pool.clone(),
            scaler.clone(),
            lifecycle.clone(),
            network.clone(),
            upstream.clone(),
            bus.clone(),
            metrics,
            DispatcherConfig {
                workers: 2,
                poll_interval_ms: 10,
                ..DispatcherConfig::default()
            },
        ));

        Self {
            store,
            queue,
            bus,
            runtime,
            upstream,
            network,
            lifecycle,
            router,
            pool,
            scaler,
            ingress,
            dispatcher,
            _dir: dir,
        }
    }

    /// Drive dispatcher workers inline until the queue drains or `max_spins`
    /// cycles pass. Deterministic alternative to spawning the worker tasks.
    pub async fn drain_queue(&self, max_spins: usize) {
        for _ in 0..max_spins {
            if self.queue.depth(None).await.unwrap_or(0) == 0 {
                return;
            }
            self.dispatcher.work_once("test-worker").await;
        }
    }
}
