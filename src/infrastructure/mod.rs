// Infrastructure layer - External dependencies and adapters
pub mod config;
pub mod http_source;
pub mod memory_store;
pub mod rest_store;

#[cfg(test)]
pub mod test_server;
