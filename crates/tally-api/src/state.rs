use std::sync::Arc;

use tally_gateway::config::GatewayConfig;
use tally_gateway::service::SessionService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub service: SessionService,
    pub gateway: GatewayConfig,
}

impl AppStateInner {
    pub fn new(service: SessionService, gateway: GatewayConfig) -> AppState {
        Arc::new(Self { service, gateway })
    }
}
