use pinboard_db::{WriteFailure, classify};
use pinboard_types::SyncError;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Classify a store failure into the sync taxonomy. Constraint violations
/// are rejections; anything else is assumed retryable.
pub fn from_store(err: anyhow::Error) -> SyncError {
    match classify(&err) {
        WriteFailure::Duplicate | WriteFailure::Constraint => SyncError::WriteRejected(format!("{:#}", err)),
        WriteFailure::Other => SyncError::TransientNetwork(format!("{:#}", err)),
    }
}
