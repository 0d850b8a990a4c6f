//! Remote endpoint port: The backend the sync queue drains into.
//!
//! The wire format is not specified here. Implementations only have to make
//! `upsert` idempotent on the envelope's `local_id`, so that a retried attempt
//! never creates a second copy.

use chrono::{DateTime, Utc};

use crate::domain::{ConsentRecord, SyncEnvelope};

/// Errors returned by a remote endpoint. All of them are treated as
/// transient by the sync queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Remote endpoint timed out after {0} ms")]
    Timeout(u64),

    #[error("Remote endpoint rejected the request: {0}")]
    Rejected(String),
}

/// Acknowledgement of a persisted upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAck {
    pub local_id: String,
    /// `false` when the key had already been applied (a replay)
    pub newly_applied: bool,
    pub acknowledged_at: DateTime<Utc>,
}

/// One page of the remote consent ledger.
///
/// `cursor` is assigned by the server in arrival order, independent of the
/// records' own timestamps, so a record that arrives late (written offline
/// on another device) is still returned to every reader behind it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsentPage {
    pub records: Vec<ConsentRecord>,
    /// Arrival position of the last record returned; pass it back to resume
    pub cursor: u64,
}

/// Trait for the backend collaborator.
pub trait RemoteEndpoint: Send + Sync {
    /// Persist one queued write. Must be idempotent on `envelope.local_id`.
    ///
    /// # Errors
    /// Returns `RemoteError` if the write could not be confirmed.
    fn upsert(&self, envelope: &SyncEnvelope) -> Result<RemoteAck, RemoteError>;

    /// Consent records that arrived after `cursor` (all records if `None`),
    /// in arrival order.
    ///
    /// # Errors
    /// Returns `RemoteError` if the ledger could not be read.
    fn fetch_consents_since(&self, cursor: Option<u64>) -> Result<ConsentPage, RemoteError>;
}
