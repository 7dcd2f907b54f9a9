// Error taxonomy for the sync engine
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream returned an unreadable payload: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store request failed: {0}")]
    Request(String),

    #[error("Store returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Store response could not be decoded: {0}")]
    Decode(String),
}

/// A single upstream tank entry that failed normalization.
#[derive(Debug, Error)]
#[error("Malformed record in site {site_id}: {reason}")]
pub struct MalformedRecord {
    pub site_id: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(#[from] SourceError),

    #[error("Persistence failed for {site_id}/{tank_id}: {source}")]
    Persistence {
        site_id: String,
        tank_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Startup connectivity check failed: {0}")]
    StartupConnectivity(String),
}

impl SyncError {
    pub fn persistence(site_id: &str, tank_id: &str, source: StoreError) -> Self {
        SyncError::Persistence {
            site_id: site_id.to_string(),
            tank_id: tank_id.to_string(),
            source,
        }
    }
}
