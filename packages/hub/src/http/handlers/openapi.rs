use utoipa::OpenApi;

use super::{containers, health, jobs, networks, routing, runners, webhook};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "RunnerHub API",
        description = "Self-hosted execution fabric for upstream CI jobs"
    ),
    paths(
        health::handle_health,
        webhook::handle_webhook,
        webhook::handle_replay,
        webhook::handle_retry_failed,
        jobs::handle_list_jobs,
        jobs::handle_get_job,
        jobs::handle_cancel_job,
        runners::handle_list_runners,
        runners::handle_list_pools,
        runners::handle_get_pool,
        runners::handle_update_pool,
        runners::handle_scale_pool,
        routing::handle_list_rules,
        routing::handle_create_rule,
        routing::handle_update_rule,
        routing::handle_delete_rule,
        routing::handle_preview,
        networks::handle_list_networks,
        networks::handle_network_cleanup,
        containers::handle_list_containers,
        containers::handle_stop_container,
    ),
    components(schemas(
        webhook::WebhookResponse,
        jobs::CancelRequest,
        runners::ScaleRequest,
        routing::RuleRequest,
        routing::PreviewRequest,
        routing::PreviewResponse,
        containers::StopRequest,
    ))
)]
pub struct ApiDoc;
