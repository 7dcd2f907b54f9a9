// Application state for HTTP handlers
use crate::application::sync_service::SyncOrchestrator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
}
