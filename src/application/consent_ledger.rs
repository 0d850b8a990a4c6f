//! Consent ledger: Append-only consent records with fail-closed reads.
//!
//! The ledger never keeps a "current consent" value as the source of truth.
//! Every read folds the stored record set for the pair, plus the in-memory
//! latest-record cache, through the merge rule in `ConsentSnapshot`.
//!
//! The cache exists for one reason: a revoke must take effect even if the
//! device cannot persist it. `revoke` writes to the cache first.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use super::SyncQueue;
use crate::domain::{
    truncate_timestamp, ConsentChange, ConsentRecord, ConsentSnapshot, ConsentState, ConsentType,
    EntityType, RecordOrigin, SyncQueueItem,
};
use crate::ports::{Clock, LocalStore, RemoteEndpoint, META_CONSENT_CURSOR};
use crate::{CareVistaError, Result};

/// Latest record seen per (subject, consent type) in this process.
#[derive(Debug, Default)]
pub struct ConsentCache {
    latest: Mutex<HashMap<(String, ConsentType), ConsentRecord>>,
}

impl ConsentCache {
    /// Keep `record` if it supersedes what is cached for its pair.
    pub fn observe(&self, record: &ConsentRecord) {
        let mut latest = self.latest.lock().expect("Lock failed");
        let key = (record.subject_id.clone(), record.consent_type);
        let replace = latest
            .get(&key)
            .map_or(true, |current| record.supersedes(current));
        if replace {
            latest.insert(key, record.clone());
        }
    }

    #[must_use]
    pub fn latest(&self, subject_id: &str, consent_type: ConsentType) -> Option<ConsentRecord> {
        self.latest
            .lock()
            .expect("Lock failed")
            .get(&(subject_id.to_string(), consent_type))
            .cloned()
    }

    /// Fold the store's records for a pair together with the cached one.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub fn snapshot<S: LocalStore + ?Sized>(
        &self,
        store: &S,
        subject_id: &str,
        consent_type: ConsentType,
    ) -> Result<ConsentSnapshot> {
        let records = store.consents_for(subject_id, consent_type)?;
        let mut snapshot = ConsentSnapshot::from_records(&records);
        if let Some(cached) = self.latest(subject_id, consent_type) {
            snapshot.absorb(&cached);
        }
        Ok(snapshot)
    }
}

/// Service owning consent grants, revokes and reconciliation.
pub struct ConsentLedger<S, R>
where
    S: LocalStore,
    R: RemoteEndpoint,
{
    store: Arc<S>,
    remote: Arc<R>,
    queue: Arc<SyncQueue<S, R>>,
    cache: Arc<ConsentCache>,
    clock: Arc<dyn Clock>,
    subscribers: Mutex<Vec<Sender<ConsentChange>>>,
}

impl<S, R> ConsentLedger<S, R>
where
    S: LocalStore + 'static,
    R: RemoteEndpoint + 'static,
{
    /// Create a ledger sharing the queue's consent cache.
    pub fn new(store: Arc<S>, remote: Arc<R>, queue: Arc<SyncQueue<S, R>>, clock: Arc<dyn Clock>) -> Self {
        let cache = queue.consent_cache();
        Self {
            store,
            remote,
            queue,
            cache,
            clock,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Record a grant.
    ///
    /// # Errors
    /// Returns error if the record cannot be stored or enqueued.
    pub fn grant(
        &self,
        subject_id: &str,
        consent_type: ConsentType,
        timestamp: DateTime<Utc>,
        assisted_by: Option<&str>,
    ) -> Result<ConsentRecord> {
        if subject_id.trim().is_empty() {
            return Err(CareVistaError::Validation("Subject id must not be empty".to_string()));
        }

        let record = ConsentRecord::grant(
            subject_id,
            consent_type,
            timestamp,
            assisted_by.map(str::to_string),
        );

        let stored = self.store.put_consent(&record)?;
        self.cache.observe(&stored);
        self.queue.enqueue(&SyncQueueItem::upsert(
            EntityType::Consent,
            stored.id.clone(),
            subject_id,
            stored.timestamp,
        ))?;
        self.notify(&stored);

        tracing::info!(consent_type = %consent_type, assisted = assisted_by.is_some(), "Consent granted");
        Ok(stored)
    }

    /// Record a revoke. Takes effect for every later read before this
    /// returns, even when persisting fails.
    ///
    /// The record's timestamp is raised to the newest known record of the
    /// pair, so a revoke is never shadowed by an earlier-dated grant.
    ///
    /// # Errors
    /// Returns error if the record cannot be stored or enqueued. The revoke
    /// is still in effect for this process.
    pub fn revoke(
        &self,
        subject_id: &str,
        consent_type: ConsentType,
        timestamp: DateTime<Utc>,
    ) -> Result<ConsentRecord> {
        if subject_id.trim().is_empty() {
            return Err(CareVistaError::Validation("Subject id must not be empty".to_string()));
        }

        let mut effective = truncate_timestamp(timestamp);
        let known = match self.current_state(subject_id, consent_type) {
            Ok(snapshot) => snapshot.latest,
            Err(e) => {
                tracing::warn!("Consent read failed while revoking, using cache: {}", e);
                self.cache.latest(subject_id, consent_type)
            }
        };
        if let Some(latest) = known {
            effective = effective.max(latest.timestamp);
        }

        let record = ConsentRecord::revoke(subject_id, consent_type, effective);
        self.cache.observe(&record);

        let persisted = self
            .store
            .put_consent(&record)
            .map_err(CareVistaError::from)
            .and_then(|stored| {
                self.queue.enqueue(&SyncQueueItem::upsert(
                    EntityType::Consent,
                    stored.id,
                    subject_id,
                    record.timestamp,
                ))
            });
        self.notify(&record);

        match persisted {
            Ok(_) => {
                tracing::info!(consent_type = %consent_type, "Consent revoked");
                Ok(record)
            }
            Err(e) => {
                tracing::error!("Revoke held in memory only, persisting failed: {}", e);
                Err(e)
            }
        }
    }

    /// Merged view of a pair: stored records plus the in-memory cache.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub fn current_state(&self, subject_id: &str, consent_type: ConsentType) -> Result<ConsentSnapshot> {
        self.cache.snapshot(self.store.as_ref(), subject_id, consent_type)
    }

    /// State derived from the in-memory cache only.
    #[must_use]
    pub fn cached_state(&self, subject_id: &str, consent_type: ConsentType) -> Option<ConsentState> {
        self.cache.latest(subject_id, consent_type).map(|record| {
            if record.granted {
                ConsentState::Granted
            } else {
                ConsentState::Revoked
            }
        })
    }

    /// # Errors
    /// Returns error if the store cannot be read.
    pub fn is_granted(&self, subject_id: &str, consent_type: ConsentType) -> Result<bool> {
        Ok(self.current_state(subject_id, consent_type)?.is_granted())
    }

    /// Fail with `ConsentRequired` unless the consent is in effect.
    ///
    /// # Errors
    /// Returns `ConsentRequired`, or a storage error.
    pub fn require(&self, subject_id: &str, consent_type: ConsentType) -> Result<()> {
        if self.is_granted(subject_id, consent_type)? {
            Ok(())
        } else {
            Err(CareVistaError::ConsentRequired { consent_type })
        }
    }

    /// Consent types currently granted for a subject.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub fn consent_scope(&self, subject_id: &str) -> Result<Vec<ConsentType>> {
        let mut scope = Vec::new();
        for consent_type in ConsentType::ALL {
            if self.is_granted(subject_id, consent_type)? {
                scope.push(consent_type);
            }
        }
        Ok(scope)
    }

    /// Audio may be processed only with both recording and transcription consent.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub fn can_process_audio(&self, subject_id: &str) -> Result<bool> {
        Ok(self.is_granted(subject_id, ConsentType::Recording)?
            && self.is_granted(subject_id, ConsentType::Transcription)?)
    }

    /// # Errors
    /// Returns error if the store cannot be read.
    pub fn can_share_with_doctor(&self, subject_id: &str) -> Result<bool> {
        self.is_granted(subject_id, ConsentType::DoctorSharing)
    }

    /// Audit trail for a pair, oldest first, including a revoke that only
    /// exists in memory.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub fn history(&self, subject_id: &str, consent_type: ConsentType) -> Result<Vec<ConsentRecord>> {
        let mut records = self.store.consents_for(subject_id, consent_type)?;
        if let Some(cached) = self.cache.latest(subject_id, consent_type) {
            if !records.iter().any(|r| r.id == cached.id) {
                records.push(cached);
            }
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    /// Pull remote records that arrived since the stored cursor and merge
    /// them locally.
    ///
    /// The cursor is the remote's arrival position, not a record timestamp:
    /// a record dated before ones already seen is still fetched.
    ///
    /// # Returns
    /// Number of pairs whose effective record changed.
    ///
    /// # Errors
    /// Returns `ConsentReconciliationFailed` if the remote cannot be reached;
    /// local state is left untouched in that case.
    pub fn reconcile(&self) -> Result<usize> {
        let cursor = self.stored_cursor()?;

        let page = self
            .remote
            .fetch_consents_since(cursor)
            .map_err(|e| CareVistaError::ConsentReconciliationFailed(e.to_string()))?;

        let mut changed = 0;
        for mut record in page.records {
            record.origin = RecordOrigin::Remote;
            record.timestamp = truncate_timestamp(record.timestamp);

            let before = self.current_state(&record.subject_id, record.consent_type)?.latest;
            self.store.put_consent(&record)?;
            let after = self.current_state(&record.subject_id, record.consent_type)?.latest;

            if before != after {
                changed += 1;
                if let Some(effective) = &after {
                    self.notify(effective);
                }
            }
        }

        if cursor.map_or(true, |c| page.cursor > c) {
            self.store.set_meta(META_CONSENT_CURSOR, &page.cursor.to_string())?;
        }

        tracing::debug!("Consent reconciliation changed {} pair(s)", changed);
        Ok(changed)
    }

    fn stored_cursor(&self) -> Result<Option<u64>> {
        let Some(value) = self.store.get_meta(META_CONSENT_CURSOR)? else {
            return Ok(None);
        };
        match value.trim().parse::<u64>() {
            Ok(cursor) => Ok(Some(cursor)),
            Err(e) => {
                // Refetching everything is safe: records are applied by id.
                tracing::warn!("Ignoring unparsable consent cursor: {}", e);
                Ok(None)
            }
        }
    }

    /// Receive a notification whenever a pair may have changed.
    pub fn subscribe(&self) -> Receiver<ConsentChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().expect("Lock failed").push(tx);
        rx
    }

    /// Current time from the ledger's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn notify(&self, record: &ConsentRecord) {
        let change = ConsentChange::from(record);
        self.subscribers
            .lock()
            .expect("Lock failed")
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LoopbackRemote, ManualClock, SqliteStore};
    use crate::application::BackoffPolicy;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).single().expect("valid")
    }

    fn ledger() -> (ConsentLedger<SqliteStore, LoopbackRemote>, Arc<LoopbackRemote>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().expect("db"));
        let remote = Arc::new(LoopbackRemote::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(at(0)));
        let queue = Arc::new(SyncQueue::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&clock),
            BackoffPolicy::default(),
            std::time::Duration::from_secs(1),
        ));
        let ledger = ConsentLedger::new(Arc::clone(&store), Arc::clone(&remote), queue, clock);
        (ledger, remote, store)
    }

    #[test]
    fn test_grant_then_revoke() {
        let (ledger, _remote, store) = ledger();
        ledger.grant("p1", ConsentType::DoctorSharing, at(0), Some("hw-1")).expect("grant");
        assert!(ledger.can_share_with_doctor("p1").expect("read"));

        ledger.revoke("p1", ConsentType::DoctorSharing, at(10)).expect("revoke");
        assert_eq!(
            ledger.current_state("p1", ConsentType::DoctorSharing).expect("read").state(),
            ConsentState::Revoked
        );
        assert_eq!(ledger.history("p1", ConsentType::DoctorSharing).expect("history").len(), 2);
        assert_eq!(store.pending_count().expect("count"), 2);
    }

    #[test]
    fn test_revoke_is_never_shadowed_by_earlier_timestamp() {
        let (ledger, _remote, _store) = ledger();
        ledger.grant("p1", ConsentType::DoctorSharing, at(100), None).expect("grant");

        // Device clock behind the grant's timestamp.
        let revoke = ledger.revoke("p1", ConsentType::DoctorSharing, at(50)).expect("revoke");
        assert_eq!(revoke.timestamp, at(100));
        assert!(!ledger.can_share_with_doctor("p1").expect("read"));
    }

    #[test]
    fn test_require_and_scope() {
        let (ledger, _remote, _store) = ledger();
        assert!(matches!(
            ledger.require("p1", ConsentType::Recording),
            Err(CareVistaError::ConsentRequired { consent_type: ConsentType::Recording })
        ));

        ledger.grant("p1", ConsentType::Recording, at(0), None).expect("grant");
        assert!(ledger.require("p1", ConsentType::Recording).is_ok());
        assert!(!ledger.can_process_audio("p1").expect("read"));

        ledger.grant("p1", ConsentType::Transcription, at(1), None).expect("grant");
        assert!(ledger.can_process_audio("p1").expect("read"));
        assert_eq!(
            ledger.consent_scope("p1").expect("scope"),
            vec![ConsentType::Recording, ConsentType::Transcription]
        );
    }

    #[test]
    fn test_stale_remote_grant_does_not_override_local_revoke() {
        let (ledger, remote, _store) = ledger();
        ledger.grant("p1", ConsentType::DoctorSharing, at(0), None).expect("grant");
        ledger.revoke("p1", ConsentType::DoctorSharing, at(20)).expect("revoke");

        remote.push_remote_consent(ConsentRecord::grant("p1", ConsentType::DoctorSharing, at(10), None));
        ledger.reconcile().expect("reconcile");
        assert!(!ledger.can_share_with_doctor("p1").expect("read"));

        // A genuinely newer grant from another device does apply.
        remote.push_remote_consent(ConsentRecord::grant(
            "p1",
            ConsentType::DoctorSharing,
            at(20) + Duration::seconds(5),
            None,
        ));
        assert_eq!(ledger.reconcile().expect("reconcile"), 1);
        assert!(ledger.can_share_with_doctor("p1").expect("read"));
    }

    #[test]
    fn test_late_arriving_remote_revoke_is_applied() {
        let (ledger, remote, store) = ledger();
        ledger.grant("p1", ConsentType::DoctorSharing, at(5), None).expect("grant");

        remote.push_remote_consent(ConsentRecord::grant("p2", ConsentType::DoctorSharing, at(20), None));
        ledger.reconcile().expect("reconcile");
        assert_eq!(store.get_meta(META_CONSENT_CURSOR).expect("meta").as_deref(), Some("1"));

        // Written offline on another device, uploaded after p2's record.
        remote.push_remote_consent(ConsentRecord::revoke("p1", ConsentType::DoctorSharing, at(10)));
        assert_eq!(ledger.reconcile().expect("reconcile"), 1);
        assert!(!ledger.can_share_with_doctor("p1").expect("read"));
        assert!(ledger.can_share_with_doctor("p2").expect("read"));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (ledger, remote, store) = ledger();
        remote.push_remote_consent(ConsentRecord::grant("p1", ConsentType::Recording, at(0), None));
        assert_eq!(ledger.reconcile().expect("reconcile"), 1);
        assert_eq!(ledger.reconcile().expect("reconcile"), 0);

        // A garbled cursor falls back to a full fetch.
        store.set_meta(META_CONSENT_CURSOR, "not-a-number").expect("meta");
        assert_eq!(ledger.reconcile().expect("reconcile"), 0);
        assert_eq!(ledger.history("p1", ConsentType::Recording).expect("history").len(), 1);
    }

    #[test]
    fn test_blank_subject_rejected() {
        let (ledger, _remote, store) = ledger();
        assert!(matches!(
            ledger.revoke("  ", ConsentType::DoctorSharing, at(0)),
            Err(CareVistaError::Validation(_))
        ));
        assert!(ledger.cached_state("  ", ConsentType::DoctorSharing).is_none());
        assert_eq!(store.pending_count().expect("count"), 0);
    }

    #[test]
    fn test_reconcile_failure_leaves_local_state() {
        let (ledger, remote, _store) = ledger();
        ledger.grant("p1", ConsentType::Recording, at(0), None).expect("grant");
        remote.set_online(false);

        assert!(matches!(
            ledger.reconcile(),
            Err(CareVistaError::ConsentReconciliationFailed(_))
        ));
        assert!(ledger.is_granted("p1", ConsentType::Recording).expect("read"));
    }

    #[test]
    fn test_subscribers_see_changes() {
        let (ledger, _remote, _store) = ledger();
        let rx = ledger.subscribe();
        ledger.grant("p1", ConsentType::DoctorSharing, at(0), None).expect("grant");
        ledger.revoke("p1", ConsentType::DoctorSharing, at(1)).expect("revoke");

        let changes: Vec<bool> = rx.try_iter().map(|c| c.granted).collect();
        assert_eq!(changes, vec![true, false]);
    }
}
