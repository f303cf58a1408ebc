#![allow(clippy::result_large_err)]
#![allow(clippy::uninlined_format_args)]

pub mod args;
pub mod config;
pub mod dispatcher;
pub mod http;
pub mod runtime;
pub mod storage;
pub mod subsystems;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use utils::context::AppContext;
use utils::telemetry::{HubMetrics, HttpMetrics};

use config::Config;
use dispatcher::Dispatcher;
use runtime::ContainerRuntime;
use storage::{Queue, Store};
use subsystems::ingress::Ingress;
use subsystems::lifecycle::LifecycleManager;
use subsystems::monitor::MonitorBus;
use subsystems::network::NetworkIsolator;
use subsystems::pool::PoolManager;
use subsystems::router::JobRouter;
use subsystems::scaler::AutoScaler;
use subsystems::upstream::UpstreamApi;

pub use utils::init_tracing_tests;

/// Exit codes of the CLI contract. 78 stays reserved for the proxy-worker
/// hook protocol ("job delegated, skip local execution") even though the hub
/// drives allocation directly.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const RUNTIME_ERROR: i32 = 2;
    pub const JOB_DELEGATED: i32 = 78;
}

/// Wire the orchestrator from a config plus the two external collaborators.
/// Tests hand in fakes; main hands in Docker and the GitHub client.
pub async fn build_dispatcher(
    config: &Config,
    runtime: Arc<dyn ContainerRuntime>,
    upstream: Arc<dyn UpstreamApi>,
    metrics: HubMetrics,
) -> anyhow::Result<Arc<Dispatcher>> {
    tokio::fs::create_dir_all(&config.data).await?;
    let store = Store::connect(&config.database_url()).await?;
    let queue = Queue::new(store.pool().clone(), config.queue_config());
    let bus = Arc::new(MonitorBus::new());

    let network = Arc::new(NetworkIsolator::new(
        runtime.clone(),
        store.clone(),
        bus.clone(),
        config.network_cidr()?,
        config.network.idle_ttl_s,
    )?);
    let lifecycle = Arc::new(LifecycleManager::new(
        runtime,
        store.clone(),
        network.clone(),
        bus.clone(),
        metrics.lifecycle.clone(),
        config.lifecycle_config(),
    ));
    let router = Arc::new(JobRouter::new(store.clone()));
    let pool = Arc::new(PoolManager::new(
        store.clone(),
        lifecycle.clone(),
        upstream.clone(),
        bus.clone(),
        config.pool_manager_config(),
    ));
    let scaler = Arc::new(AutoScaler::new(
        store.clone(),
        pool.clone(),
        bus.clone(),
        metrics.scaler.clone(),
        config.scaler_config(),
    ));
    let ingress = Arc::new(Ingress::new(
        store.clone(),
        queue.clone(),
        config.ingress_config(),
        metrics.ingress.clone(),
    ));

    Ok(Arc::new(Dispatcher::new(
        store,
        queue,
        ingress,
        router,
        pool,
        scaler,
        lifecycle,
        network,
        upstream,
        bus,
        metrics,
        config.dispatcher_config(),
    )))
}

/// Entry point to start up the whole server.
/// Called from main and end-to-end tests.
pub fn run_server(
    ctx: AppContext,
    config: Config,
    dispatcher: Arc<Dispatcher>,
    metrics: HttpMetrics,
) {
    let _ = ctrlc::set_handler({
        let ctx = ctx.clone();
        move || {
            ctx.kill();
        }
    });

    dispatcher.start(ctx.clone());

    // the http server owns the calling thread until shutdown
    http::server::start(ctx, config, dispatcher, metrics).unwrap();
}
