use std::sync::Arc;

use utils::context::AppContext;
use utils::telemetry::HttpMetrics;

use crate::config::Config;
use crate::dispatcher::Dispatcher;

#[derive(Clone)]
pub struct HttpState {
    pub config: Config,
    pub dispatcher: Arc<Dispatcher>,
    pub ctx: AppContext,
    pub metrics: HttpMetrics,
}

impl HttpState {
    pub fn new(
        config: Config,
        dispatcher: Arc<Dispatcher>,
        ctx: AppContext,
        metrics: HttpMetrics,
    ) -> Self {
        Self {
            config,
            dispatcher,
            ctx,
            metrics,
        }
    }

    /// During draining the health endpoint flips to 503 so load balancers
    /// stop routing new work here.
    pub fn draining(&self) -> bool {
        self.ctx.killed()
    }
}
