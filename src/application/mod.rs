//! Application layer: Use cases and services.
//!
//! This module orchestrates domain logic with ports to implement
//! the offline-first use cases: capturing records, draining the sync queue,
//! keeping the consent ledger and gating protected reads.

mod backoff;
mod consent_gate;
mod consent_ledger;
mod engine;
mod records;
mod sync_queue;
mod worker;

pub use backoff::BackoffPolicy;
pub use consent_gate::{ConsentGate, GatePoller, GateState, ProtectedView};
pub use consent_ledger::{ConsentCache, ConsentLedger};
pub use engine::OfflineCore;
pub use records::RecordService;
pub use sync_queue::{DrainReport, SyncQueue};
pub use worker::{SyncEvent, SyncTrigger, SyncWorker, SyncWorkerHandle};

use chrono::{DateTime, SecondsFormat, Utc};

/// Timestamp format used in the metadata table.
pub(crate) fn format_meta_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_meta_timestamp(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!("Ignoring unparsable metadata timestamp: {}", e);
            None
        }
    }
}
