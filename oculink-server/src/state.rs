use crate::websocket::ConnectionManager;
use oculink_config::Config;
use oculink_core::IntegrationContext;
use std::sync::Arc;

/// Server application state.
#[derive(Clone)]
pub struct AppState {
    pub core: IntegrationContext,
    pub websocket_manager: Arc<ConnectionManager>,
    pub config: Arc<Config>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("websocket_manager", &self.websocket_manager)
            .finish()
    }
}
