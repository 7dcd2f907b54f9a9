// Presentation layer - Read-only status endpoint
pub mod app_state;
pub mod handlers;
