use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced by the sync layer.
///
/// `AlreadyVoted` is an expected outcome rather than a fault: callers treat it
/// as a no-op. `WriteRejected` means the store refused a write and any
/// optimistic entry for it has been rolled back.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("user {voter_id} already voted on message {message_id}")]
    AlreadyVoted { voter_id: Uuid, message_id: Uuid },

    #[error("write rejected by store: {0}")]
    WriteRejected(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("upstream service unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("{entity} {id} is owned by another user")]
    NotOwner { entity: &'static str, id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("surface is closed")]
    SurfaceClosed,
}

impl SyncError {
    /// Retryable errors leave local state untouched.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::UpstreamUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_failures_are_transient() {
        assert!(SyncError::TransientNetwork("reset".into()).is_transient());
        assert!(SyncError::UpstreamUnavailable("503".into()).is_transient());
        assert!(!SyncError::WriteRejected("fk".into()).is_transient());
        assert!(!SyncError::SurfaceClosed.is_transient());
    }
}
