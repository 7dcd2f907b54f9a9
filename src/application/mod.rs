// Application layer - Ports and use cases
pub mod analytics;
pub mod history_service;
pub mod retention_store;
pub mod sync_service;
pub mod telemetry_source;
