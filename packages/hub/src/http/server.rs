use axum::{
    middleware,
    routing::{delete, get, post, put},
};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utils::{context::AppContext, http::cors::OriginPatterns, telemetry::HttpMetrics};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{config::Config, dispatcher::Dispatcher};

use super::{
    handlers::{
        containers::{handle_list_containers, handle_stop_container},
        handle_not_found,
        health::handle_health,
        jobs::{handle_cancel_job, handle_get_job, handle_list_jobs},
        networks::{handle_list_networks, handle_network_cleanup},
        openapi::ApiDoc,
        routing::{
            handle_create_rule, handle_delete_rule, handle_list_rules, handle_preview,
            handle_update_rule,
        },
        runners::{
            handle_get_pool, handle_list_pools, handle_list_runners, handle_scale_pool,
            handle_update_pool,
        },
        webhook::{handle_replay, handle_retry_failed, handle_webhook},
    },
    state::HttpState,
};

const REALM: &str = "runnerhub";

// called from main; runs until the context is killed
pub fn start(
    ctx: AppContext,
    config: Config,
    dispatcher: Arc<Dispatcher>,
    metrics: HttpMetrics,
) -> anyhow::Result<()> {
    ctx.rt.clone().block_on(async move {
        let (host, port) = (config.host.clone(), config.port);

        let mut shutdown_signal = ctx.get_kill_receiver();

        let router = make_router(config, dispatcher, ctx, metrics);

        let listener = tokio::net::TcpListener::bind(&format!("{}:{}", host, port)).await?;

        tracing::info!("Http server starting on: {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal.recv().await.ok();

                tracing::debug!("Http server shutting down");
            })
            .await?;

        anyhow::Ok(())
    })?;

    Ok(())
}

// called from main and tests
pub fn make_router(
    config: Config,
    dispatcher: Arc<Dispatcher>,
    ctx: AppContext,
    metrics: HttpMetrics,
) -> axum::Router {
    let state = HttpState::new(config.clone(), dispatcher, ctx, metrics);

    // the webhook endpoint authenticates with its own HMAC, never the bearer
    let public = axum::Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(OtelAxumLayer::default())
        .route("/health", get(handle_health))
        .route("/webhooks/github", post(handle_webhook))
        .route("/jobs", get(handle_list_jobs))
        .route("/jobs/{id}", get(handle_get_job))
        .route("/runners", get(handle_list_runners))
        .route("/runners/pools", get(handle_list_pools))
        .route("/runners/pools/{owner}/{repo}", get(handle_get_pool))
        .route("/routing/rules", get(handle_list_rules))
        .route("/networks", get(handle_list_networks))
        .route("/containers", get(handle_list_containers));

    // mutating routes, bearer-protected when a token is configured
    let protected = axum::Router::new()
        .route("/jobs/{id}/cancel", post(handle_cancel_job))
        .route("/runners/pools/{owner}/{repo}", put(handle_update_pool))
        .route("/runners/pools/{owner}/{repo}/scale", post(handle_scale_pool))
        .route("/routing/rules", post(handle_create_rule))
        .route("/routing/rules/{id}", put(handle_update_rule))
        .route("/routing/rules/{id}", delete(handle_delete_rule))
        .route("/routing/preview", post(handle_preview))
        .route("/networks/cleanup", post(handle_network_cleanup))
        .route("/containers/{id}/stop", post(handle_stop_container))
        .route("/webhooks/replay/{delivery_id}", post(handle_replay))
        .route("/webhooks/retry-failed", post(handle_retry_failed));

    let public = public.with_state(state.clone());
    let protected = protected.with_state(state.clone());

    let mut router = public
        .merge(match &state.config.bearer_token {
            Some(token) => protected.layer(middleware::from_fn_with_state(
                (token.clone(), REALM.to_string()),
                utils::http::auth::verify_bearer_with_realm,
            )),
            None => protected,
        })
        .fallback(handle_not_found);

    if let Some(origins) = OriginPatterns::compile(&state.config.cors_allowed_origins) {
        router = router.layer(origins.into_layer());
    }

    router
}
