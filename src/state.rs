use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::orchestrator::Orchestrator;

// app's shared state, `config` is the orchestrator's own
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let config = Arc::clone(orchestrator.config());
        Self {
            orchestrator,
            config,
        }
    }
}
