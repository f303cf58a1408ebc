use std::sync::Arc;

use clap::Parser;
use opentelemetry::global;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utils::{
    config::{ConfigBuilder, ConfigExt},
    context::AppContext,
    telemetry::{setup_metrics, setup_tracing, Metrics},
};

use runnerhub::args::CliArgs;
use runnerhub::config::Config;
use runnerhub::runtime::docker::DockerRuntime;
use runnerhub::subsystems::upstream::UpstreamClient;
use runnerhub::{build_dispatcher, exit_codes, run_server};

fn main() {
    let args = CliArgs::parse();
    let config: Config = match ConfigBuilder::new(args).build::<Config>() {
        Ok(config) => Config {
            data: utils::config::expand_tilde(&config.data),
            ..config
        },
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(exit_codes::CONFIG_ERROR);
        }
    };

    let ctx = AppContext::with_worker_threads(config.runtime_threads.max(1));

    // setup tracing
    let filters = config.tracing_env_filter().unwrap();
    let tracer_provider = if let Some(collector) = config.jaeger.as_ref() {
        Some(setup_tracing(collector, "runnerhub", filters))
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_target(false),
            )
            .with(filters)
            .try_init()
            .unwrap();
        None
    };

    let meter_provider = config
        .prometheus
        .as_ref()
        .map(|collector| setup_metrics(collector, "runnerhub_metrics"));
    let meter = global::meter("runnerhub_metrics");
    let metrics = Metrics::init(&meter);

    let result = ctx.rt.clone().block_on(async {
        let runtime = Arc::new(DockerRuntime::connect()?);
        let upstream = Arc::new(UpstreamClient::new(
            config.upstream_config(),
            metrics.hub.upstream.clone(),
        )?);
        upstream.start(ctx.clone());

        build_dispatcher(&config, runtime, upstream, metrics.hub).await
    });

    let dispatcher = match result {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            eprintln!("startup failed: {err:#}");
            std::process::exit(exit_codes::RUNTIME_ERROR);
        }
    };

    run_server(ctx, config, dispatcher, metrics.http);

    if let Some(tracer) = tracer_provider {
        let _ = tracer.shutdown();
    }
    if let Some(meter) = meter_provider {
        let _ = meter.shutdown();
    }
}
