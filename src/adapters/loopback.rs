//! Loopback adapter: In-process implementation of `RemoteEndpoint`.
//!
//! Keeps everything it receives in memory and applies each `local_id` at most
//! once, which is the contract a real backend must honor. Connectivity,
//! injected failures and latency can be controlled to simulate field
//! conditions (camp with no signal, flaky uplink, slow server).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::domain::{
    truncate_timestamp, ConsentRecord, EntityType, RecordOrigin, SyncEnvelope, SyncOperation,
};
use crate::ports::{ConsentPage, RemoteAck, RemoteEndpoint, RemoteError};

#[derive(Debug, Default)]
struct LoopbackState {
    online: bool,
    fail_next: u32,
    latency: Option<Duration>,
    upsert_calls: usize,
    applied: HashMap<String, SyncEnvelope>,
    applied_order: Vec<String>,
    consents: Vec<ConsentRecord>,
}

/// In-memory remote endpoint.
#[derive(Debug)]
pub struct LoopbackRemote {
    state: Mutex<LoopbackState>,
}

impl Default for LoopbackRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRemote {
    /// Create an online remote with an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                online: true,
                ..LoopbackState::default()
            }),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.state.lock().expect("Lock failed").online = online;
    }

    /// Fail the next `n` upserts with `Unreachable`.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().expect("Lock failed").fail_next = n;
    }

    /// Delay every upsert by `latency` before answering.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().expect("Lock failed").latency = latency;
    }

    /// Add a consent record as if another device had written it.
    pub fn push_remote_consent(&self, mut record: ConsentRecord) {
        record.origin = RecordOrigin::Remote;
        self.state.lock().expect("Lock failed").consents.push(record);
    }

    /// Number of upsert calls received, including failed and replayed ones.
    #[must_use]
    pub fn upsert_calls(&self) -> usize {
        self.state.lock().expect("Lock failed").upsert_calls
    }

    /// Number of distinct writes applied.
    #[must_use]
    pub fn stored_count(&self) -> usize {
        self.state.lock().expect("Lock failed").applied.len()
    }

    #[must_use]
    pub fn contains(&self, local_id: &str) -> bool {
        self.state.lock().expect("Lock failed").applied.contains_key(local_id)
    }

    /// `local_id`s in the order they were first applied.
    #[must_use]
    pub fn applied_order(&self) -> Vec<String> {
        self.state.lock().expect("Lock failed").applied_order.clone()
    }

    #[must_use]
    pub fn envelope(&self, local_id: &str) -> Option<SyncEnvelope> {
        self.state.lock().expect("Lock failed").applied.get(local_id).cloned()
    }
}

impl RemoteEndpoint for LoopbackRemote {
    fn upsert(&self, envelope: &SyncEnvelope) -> Result<RemoteAck, RemoteError> {
        let latency = {
            let mut state = self.state.lock().expect("Lock failed");
            state.upsert_calls += 1;
            state.latency
        };
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        let mut state = self.state.lock().expect("Lock failed");
        if !state.online {
            return Err(RemoteError::Unreachable("no network".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RemoteError::Unreachable("connection reset".to_string()));
        }

        let acknowledged_at = truncate_timestamp(Utc::now());
        if state.applied.contains_key(&envelope.local_id) {
            return Ok(RemoteAck {
                local_id: envelope.local_id.clone(),
                newly_applied: false,
                acknowledged_at,
            });
        }

        if envelope.entity_type == EntityType::Consent && envelope.operation == SyncOperation::Upsert {
            let mut record: ConsentRecord = serde_json::from_value(envelope.payload.clone())
                .map_err(|e| RemoteError::Rejected(format!("malformed consent payload: {e}")))?;
            record.origin = RecordOrigin::Remote;
            state.consents.push(record);
        }

        state.applied.insert(envelope.local_id.clone(), envelope.clone());
        state.applied_order.push(envelope.local_id.clone());

        Ok(RemoteAck {
            local_id: envelope.local_id.clone(),
            newly_applied: true,
            acknowledged_at,
        })
    }

    fn fetch_consents_since(&self, cursor: Option<u64>) -> Result<ConsentPage, RemoteError> {
        let state = self.state.lock().expect("Lock failed");
        if !state.online {
            return Err(RemoteError::Unreachable("no network".to_string()));
        }

        // Arrival position of a record is its 1-based index in the ledger.
        let start = cursor
            .and_then(|c| usize::try_from(c).ok())
            .unwrap_or(0)
            .min(state.consents.len());
        Ok(ConsentPage {
            records: state.consents[start..].to_vec(),
            cursor: state.consents.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConsentType;

    fn envelope(local_id: &str) -> SyncEnvelope {
        SyncEnvelope {
            local_id: local_id.to_string(),
            entity_type: EntityType::Entry,
            operation: SyncOperation::Upsert,
            subject_id: "p1".to_string(),
            created_at: Utc::now(),
            payload: serde_json::json!({ "id": local_id }),
        }
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let remote = LoopbackRemote::new();
        assert!(remote.upsert(&envelope("e1")).expect("ack").newly_applied);
        assert!(!remote.upsert(&envelope("e1")).expect("ack").newly_applied);
        assert_eq!(remote.stored_count(), 1);
        assert_eq!(remote.upsert_calls(), 2);
    }

    #[test]
    fn test_offline_and_injected_failures() {
        let remote = LoopbackRemote::new();
        remote.set_online(false);
        assert!(remote.upsert(&envelope("e1")).is_err());
        assert!(remote.fetch_consents_since(None).is_err());

        remote.set_online(true);
        remote.fail_next(1);
        assert!(remote.upsert(&envelope("e1")).is_err());
        assert!(remote.upsert(&envelope("e1")).is_ok());
        assert_eq!(remote.applied_order(), vec!["e1".to_string()]);
    }

    #[test]
    fn test_consent_upserts_feed_the_ledger() {
        let remote = LoopbackRemote::new();
        let record = ConsentRecord::grant("p1", ConsentType::Recording, Utc::now(), None);
        let env = SyncEnvelope {
            local_id: record.id.clone(),
            entity_type: EntityType::Consent,
            operation: SyncOperation::Upsert,
            subject_id: "p1".to_string(),
            created_at: record.timestamp,
            payload: serde_json::to_value(&record).expect("serialize"),
        };
        remote.upsert(&env).expect("ack");

        let page = remote.fetch_consents_since(None).expect("fetch");
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].origin, RecordOrigin::Remote);
        assert_eq!(page.cursor, 1);
        assert!(remote
            .fetch_consents_since(Some(page.cursor))
            .expect("fetch")
            .records
            .is_empty());
    }

    #[test]
    fn test_cursor_follows_arrival_not_timestamp() {
        let remote = LoopbackRemote::new();
        let now = Utc::now();
        remote.push_remote_consent(ConsentRecord::grant("p2", ConsentType::DoctorSharing, now, None));
        let first = remote.fetch_consents_since(None).expect("fetch");

        // Older record arriving late.
        let late = ConsentRecord::revoke("p1", ConsentType::DoctorSharing, now - chrono::Duration::hours(1));
        remote.push_remote_consent(late.clone());

        let next = remote.fetch_consents_since(Some(first.cursor)).expect("fetch");
        assert_eq!(next.records.len(), 1);
        assert_eq!(next.records[0].id, late.id);
        assert_eq!(next.cursor, 2);
    }
}
