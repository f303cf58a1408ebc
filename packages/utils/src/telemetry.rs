use opentelemetry::{global, trace::TracerProvider as _};
use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    resource::Resource,
    trace::{self, Sampler, SdkTracerProvider},
};
use tracing_subscriber::layer::SubscriberExt;

pub fn setup_tracing(
    collector: &str,
    service_name: &str,
    filters: tracing_subscriber::EnvFilter,
) -> SdkTracerProvider {
    global::set_text_map_propagator(opentelemetry_jaeger_propagator::Propagator::new());
    let endpoint = format!("{}/v1/traces", collector);
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .expect("Failed to build OTLP exporter");

    let batch_processor = trace::BatchSpanProcessor::builder(exporter).build();

    let provider = SdkTracerProvider::builder()
        .with_span_processor(batch_processor)
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(format!("{}-tracer", service_name));
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    let subscriber = tracing_subscriber::Registry::default()
        .with(filters)
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry);

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default subscriber");

    tracing::info!("Trace export enabled");
    provider
}

pub fn setup_metrics(collector: &str, service_name: &str) -> SdkMeterProvider {
    let endpoint = format!("{}/api/v1/otlp/v1/metrics", collector);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .expect("Failed to build OTLP exporter!");

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .with_periodic_exporter(exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    tracing::info!("Metrics enabled and exporting to {}", collector);

    meter_provider
}

use opentelemetry::metrics::{Counter, Gauge, Meter, UpDownCounter};

pub struct Metrics {
    pub http: HttpMetrics,
    pub hub: HubMetrics,
}

impl Metrics {
    pub fn init(meter: &Meter) -> Self {
        Self {
            http: HttpMetrics::init(meter),
            hub: HubMetrics::init(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HubMetrics {
    pub ingress: IngressMetrics,
    pub dispatcher: DispatcherMetrics,
    pub scaler: ScalerMetrics,
    pub lifecycle: LifecycleMetrics,
    pub upstream: UpstreamMetrics,
}

impl HubMetrics {
    pub fn init(meter: &Meter) -> Self {
        Self {
            ingress: IngressMetrics::init(meter),
            dispatcher: DispatcherMetrics::init(meter),
            scaler: ScalerMetrics::init(meter),
            lifecycle: LifecycleMetrics::init(meter),
            upstream: UpstreamMetrics::init(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    pub requests: Counter<u64>,
}

impl HttpMetrics {
    pub const LABEL: &'static str = "http";

    pub fn init(meter: &Meter) -> Self {
        HttpMetrics {
            requests: meter
                .u64_counter(format!("{}_requests", Self::LABEL))
                .with_description("API requests served")
                .build(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IngressMetrics {
    pub accepted: Counter<u64>,
    pub duplicates: Counter<u64>,
    pub rejected_signature: Counter<u64>,
}

impl IngressMetrics {
    pub const LABEL: &'static str = "ingress";

    pub fn init(meter: &Meter) -> Self {
        IngressMetrics {
            accepted: meter
                .u64_counter(format!("{}_accepted", Self::LABEL))
                .with_description("Webhook deliveries accepted")
                .build(),
            duplicates: meter
                .u64_counter(format!("{}_duplicates", Self::LABEL))
                .with_description("Webhook deliveries dropped as duplicates")
                .build(),
            rejected_signature: meter
                .u64_counter(format!("{}_rejected_signature", Self::LABEL))
                .with_description("Webhook deliveries with a bad signature")
                .build(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherMetrics {
    pub dispatched: Counter<u64>,
    pub failed: Counter<u64>,
    pub retried: Counter<u64>,
    pub in_flight: UpDownCounter<i64>,
}

impl DispatcherMetrics {
    pub const LABEL: &'static str = "dispatcher";

    pub fn init(meter: &Meter) -> Self {
        DispatcherMetrics {
            dispatched: meter
                .u64_counter(format!("{}_dispatched", Self::LABEL))
                .with_description("Jobs assigned to a runner")
                .build(),
            failed: meter
                .u64_counter(format!("{}_failed", Self::LABEL))
                .with_description("Jobs moved to FAILED")
                .build(),
            retried: meter
                .u64_counter(format!("{}_retried", Self::LABEL))
                .with_description("Dispatch attempts nacked for retry")
                .build(),
            in_flight: meter
                .i64_up_down_counter(format!("{}_in_flight", Self::LABEL))
                .with_description("Reservations currently being processed")
                .build(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScalerMetrics {
    pub scale_ups: Counter<u64>,
    pub scale_downs: Counter<u64>,
    pub skipped_cooldown: Counter<u64>,
}

impl ScalerMetrics {
    pub const LABEL: &'static str = "scaler";

    pub fn init(meter: &Meter) -> Self {
        ScalerMetrics {
            scale_ups: meter
                .u64_counter(format!("{}_scale_ups", Self::LABEL))
                .with_description("Scale-up decisions applied")
                .build(),
            scale_downs: meter
                .u64_counter(format!("{}_scale_downs", Self::LABEL))
                .with_description("Scale-down decisions applied")
                .build(),
            skipped_cooldown: meter
                .u64_counter(format!("{}_skipped_cooldown", Self::LABEL))
                .with_description("Decisions suppressed by cooldown")
                .build(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleMetrics {
    pub containers_running: UpDownCounter<i64>,
    pub cleanups: Counter<u64>,
    pub cleanup_errors: Counter<u64>,
}

impl LifecycleMetrics {
    pub const LABEL: &'static str = "lifecycle";

    pub fn init(meter: &Meter) -> Self {
        LifecycleMetrics {
            containers_running: meter
                .i64_up_down_counter(format!("{}_containers_running", Self::LABEL))
                .with_description("Containers currently RUNNING")
                .build(),
            cleanups: meter
                .u64_counter(format!("{}_cleanups", Self::LABEL))
                .with_description("Containers removed by cleanup policies")
                .build(),
            cleanup_errors: meter
                .u64_counter(format!("{}_cleanup_errors", Self::LABEL))
                .with_description("Cleanup failures recorded in run details")
                .build(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamMetrics {
    pub requests: Counter<u64>,
    pub throttle_delays: Counter<u64>,
    pub rate_limit_remaining: Gauge<u64>,
}

impl UpstreamMetrics {
    pub const LABEL: &'static str = "upstream";

    pub fn init(meter: &Meter) -> Self {
        UpstreamMetrics {
            requests: meter
                .u64_counter(format!("{}_requests", Self::LABEL))
                .with_description("Requests issued to the upstream API")
                .build(),
            throttle_delays: meter
                .u64_counter(format!("{}_throttle_delays", Self::LABEL))
                .with_description("Requests delayed by the throttle strategy")
                .build(),
            rate_limit_remaining: meter
                .u64_gauge(format!("{}_rate_limit_remaining", Self::LABEL))
                .with_description("Most recently observed remaining quota")
                .build(),
        }
    }
}
