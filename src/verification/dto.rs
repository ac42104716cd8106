use serde::Deserialize;

pub const MAX_BATCH_SIZE: usize = 500;
pub const MAX_WORKERS: usize = 32;

/// Body of `POST /verification/run`. Every field falls back to configuration.
#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    /// Run as exactly this worker identity.
    pub worker_id: Option<String>,
    pub batch_size: Option<usize>,
    /// Number of parallel worker identities; ignored when `worker_id` is set.
    pub workers: Option<usize>,
}
