// Domain layer - Core business models
pub mod error;
pub mod metrics;
pub mod reading;
pub mod stats;
