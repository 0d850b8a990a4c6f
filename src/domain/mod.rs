//! Domain layer: Core record types and the consent merge rule.
//!
//! This module contains plain Rust types with no I/O. Everything here is
//! serializable so it can be persisted locally and shipped to the remote
//! endpoint unchanged.

mod consent;
mod entry;
mod report;
mod sync;
mod temporary_patient;

use chrono::{DateTime, SubsecRound, Utc};

pub use consent::{ConsentChange, ConsentRecord, ConsentSnapshot, ConsentState, ConsentType, RecordOrigin};
pub use entry::{Entry, EntryKind, MediaBlob, StructuredSummary};
pub use report::{Report, ReportUploader};
pub use sync::{
    EntityType, SyncEnvelope, SyncErrorReport, SyncOperation, SyncQueueItem, SyncStatus,
};
pub use temporary_patient::TemporaryPatient;

/// Timestamps are kept at microsecond precision, which is what the local
/// store persists. Truncating at creation keeps stored and in-memory values equal.
#[must_use]
pub fn truncate_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Generate a random UUID v4 string using a CSPRNG.
///
/// Identifiers double as sync idempotency keys, so they must not be
/// predictable or collide across devices.
pub(crate) fn new_id() -> String {
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    let mut rng = ChaCha20Rng::from_entropy();
    let bytes: [u8; 16] = rng.gen();

    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3],
        bytes[4], bytes[5],
        (bytes[6] & 0x0f) | 0x40, bytes[7],
        (bytes[8] & 0x3f) | 0x80, bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
    )
}
