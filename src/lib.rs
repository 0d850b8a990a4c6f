//! # CareVista offline core
//!
//! Offline-first persistence and consent enforcement for the CareVista
//! telemedicine portal.
//!
//! This crate provides:
//! - A durable local store for symptom entries, media, consent records and
//!   temporary patients that works with zero network
//! - A sync queue that drains local writes to the backend with idempotent,
//!   backed-off retries
//! - An append-only consent ledger with fail-closed merge semantics
//! - A consent visibility gate that keeps protected data away from doctors
//!   whose access was revoked
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: Core record types and the consent merge rule
//! - `ports`: Trait definitions for storage, the remote endpoint and time
//! - `adapters`: Concrete implementations (SQLite, loopback remote, clocks)
//! - `application`: Services orchestrating domain and ports
//! - `config`: Environment-driven tunables

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use config::SyncConfig;
pub use domain::{ConsentRecord, ConsentType, Entry, EntryKind, MediaBlob, Report, SyncStatus};

use crate::ports::StoreError;

/// Result type for CareVista operations
pub type Result<T> = std::result::Result<T, CareVistaError>;

/// Main error type for CareVista
#[derive(Debug, thiserror::Error)]
pub enum CareVistaError {
    /// Device storage is full and nothing could be evicted.
    #[error("Local storage exhausted: {requested} bytes requested, {available} bytes available")]
    StorageExhausted { requested: u64, available: u64 },

    #[error("Storage operation failed: {0}")]
    Store(StoreError),

    /// One remote call failed; the item stays queued.
    #[error("Sync attempt failed for {local_id}: {reason}")]
    SyncAttemptFailed { local_id: String, reason: String },

    /// Attempt limit reached; the item is kept for manual retry.
    #[error("Sync permanently failed for {local_id} after {attempts} attempts")]
    SyncPermanentlyFailed { local_id: String, attempts: u32 },

    #[error("Consent reconciliation failed: {0}")]
    ConsentReconciliationFailed(String),

    /// Protected data was held while consent was not granted.
    #[error("Protected data held without doctor sharing consent for subject")]
    ConsentViolation { subject_id: String },

    #[error("Consent required: {consent_type}")]
    ConsentRequired { consent_type: ConsentType },

    #[error("Invalid data: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for CareVistaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StorageExhausted {
                requested,
                available,
            } => Self::StorageExhausted {
                requested,
                available,
            },
            other => Self::Store(other),
        }
    }
}
