//! Sync queue: Drains local writes to the remote endpoint.
//!
//! Items are attempted in creation order per entity: while an item is
//! backing off, later operations on the same entity (a tombstone behind its
//! upsert, a link behind its registration) wait for it. Nothing else does.
//! Ordering across entities is not guaranteed, and a permanently failed item
//! holds back nothing, so one bad upload never blocks a later revoke or entry.
//!
//! Every attempt carries the item's `local_id` as idempotency key. An item is
//! removed only after the remote acknowledged it, in the same transaction
//! that stamps the source entity as synced.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use super::{format_meta_timestamp, parse_meta_timestamp, BackoffPolicy, ConsentCache};
use crate::domain::{
    ConsentType, EntityType, SyncEnvelope, SyncErrorReport, SyncOperation, SyncQueueItem,
    SyncStatus,
};
use crate::ports::{Clock, LocalStore, RemoteAck, RemoteEndpoint, RemoteError, StoreError, META_LAST_SYNC_AT};
use crate::{CareVistaError, Result};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items acknowledged and removed
    pub synced: usize,
    /// Items whose attempt failed and were rescheduled
    pub failed: usize,
    /// Items that reached the attempt limit during this pass
    pub permanently_failed: usize,
    /// Items not attempted (not yet due, permanently failed, or behind an
    /// earlier operation on the same entity)
    pub deferred: usize,
    /// Another drain was already running
    pub skipped: bool,
}

/// Service draining the persisted queue.
pub struct SyncQueue<S, R>
where
    S: LocalStore,
    R: RemoteEndpoint,
{
    store: Arc<S>,
    remote: Arc<R>,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
    remote_timeout: Duration,
    consent_cache: Arc<ConsentCache>,
    rng: Mutex<ChaCha20Rng>,
    drain_lock: Mutex<()>,
    is_syncing: AtomicBool,
    subscribers: Mutex<Vec<Sender<SyncStatus>>>,
}

impl<S, R> SyncQueue<S, R>
where
    S: LocalStore + 'static,
    R: RemoteEndpoint + 'static,
{
    pub fn new(
        store: Arc<S>,
        remote: Arc<R>,
        clock: Arc<dyn Clock>,
        policy: BackoffPolicy,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            policy,
            remote_timeout,
            consent_cache: Arc::new(ConsentCache::default()),
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
            drain_lock: Mutex::new(()),
            is_syncing: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Cache of in-memory consent records, shared with the ledger.
    #[must_use]
    pub fn consent_cache(&self) -> Arc<ConsentCache> {
        Arc::clone(&self.consent_cache)
    }

    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Persist an item. Idempotent on `local_id`.
    ///
    /// # Returns
    /// `true` if the item was newly queued.
    ///
    /// # Errors
    /// Returns error if the store rejects the write.
    pub fn enqueue(&self, item: &SyncQueueItem) -> Result<bool> {
        let added = self.store.enqueue(item)?;
        if added {
            tracing::debug!(entity = %item.entity_type, "Queued {} for sync", item.local_id);
            self.publish_status();
        }
        Ok(added)
    }

    /// Attempt every due item once.
    ///
    /// Returns immediately with `skipped = true` if another drain is running.
    ///
    /// # Errors
    /// Returns error only if the store fails; remote failures are recorded
    /// on the items and reported in the `DrainReport`.
    pub fn drain(&self) -> Result<DrainReport> {
        let _guard = match self.drain_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("Drain already in progress");
                return Ok(DrainReport {
                    skipped: true,
                    ..DrainReport::default()
                });
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        self.is_syncing.store(true, Ordering::SeqCst);
        self.publish_status();

        let result = self.drain_due_items();

        self.is_syncing.store(false, Ordering::SeqCst);
        self.publish_status();

        if let Ok(report) = &result {
            if report.synced > 0 || report.failed > 0 {
                tracing::info!(
                    "Drain finished: {} synced, {} failed, {} permanently failed, {} deferred",
                    report.synced,
                    report.failed,
                    report.permanently_failed,
                    report.deferred
                );
            }
        }
        result
    }

    fn drain_due_items(&self) -> Result<DrainReport> {
        let now = self.clock.now();
        let mut report = DrainReport::default();
        let mut held: HashSet<(EntityType, String)> = HashSet::new();

        for item in self.store.queue_items()? {
            if item.failed {
                report.deferred += 1;
                continue;
            }

            let key = (item.entity_type, item.payload_ref.clone());
            if held.contains(&key) || !item.is_due(now) {
                held.insert(key);
                report.deferred += 1;
                continue;
            }

            match self.attempt(&item)? {
                None => report.synced += 1,
                Some(CareVistaError::SyncPermanentlyFailed { .. }) => {
                    report.failed += 1;
                    report.permanently_failed += 1;
                }
                Some(_) => {
                    report.failed += 1;
                    held.insert(key);
                }
            }
        }

        Ok(report)
    }

    /// Run one attempt. The outer `Result` carries store failures, the inner
    /// `Option` the attempt's own failure.
    fn attempt(&self, item: &SyncQueueItem) -> Result<Option<CareVistaError>> {
        let outcome = match self.build_envelope(item) {
            Ok(envelope) => self.call_with_timeout(envelope).map_err(|e| e.to_string()),
            Err(CareVistaError::Store(StoreError::Backend(msg))) => {
                return Err(CareVistaError::Store(StoreError::Backend(msg)))
            }
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(ack) => {
                self.on_success(item, &ack)?;
                Ok(None)
            }
            Err(reason) => self.on_failure(item, reason).map(Some),
        }
    }

    fn on_success(&self, item: &SyncQueueItem, ack: &RemoteAck) -> Result<()> {
        let at = self.clock.now();

        if item.entity_type == EntityType::Entry
            && item.operation == SyncOperation::Upsert
            && self.doctor_sharing_granted(&item.subject_id)?
        {
            self.store.mark_shared(&item.payload_ref)?;
        }

        self.store.complete_sync(item, at)?;
        self.store.set_meta(META_LAST_SYNC_AT, &format_meta_timestamp(at))?;

        if ack.newly_applied {
            tracing::debug!(entity = %item.entity_type, "Synced {}", item.local_id);
        } else {
            tracing::debug!("Remote already held {}, treated as acknowledged", item.local_id);
        }
        Ok(())
    }

    fn on_failure(&self, item: &SyncQueueItem, reason: String) -> Result<CareVistaError> {
        let mut item = item.clone();
        item.attempt_count = item.attempt_count.saturating_add(1);
        item.last_error = Some(reason.clone());

        if self.policy.is_exhausted(item.attempt_count) {
            item.failed = true;
            item.next_attempt_at = None;
            self.store.record_attempt(&item)?;
            tracing::warn!(
                entity = %item.entity_type,
                "Sync permanently failed for {} after {} attempts: {}",
                item.local_id,
                item.attempt_count,
                reason
            );
            return Ok(CareVistaError::SyncPermanentlyFailed {
                local_id: item.local_id,
                attempts: item.attempt_count,
            });
        }

        let sample: f64 = self.rng.lock().expect("Lock failed").gen();
        let delay = self.policy.delay_for(
            item.attempt_count,
            Duration::from_millis(item.last_delay_ms),
            sample,
        );
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        item.last_delay_ms = delay_ms;
        let wait = chrono::Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX / 1_000));
        item.next_attempt_at = Some(self.clock.now() + wait);
        self.store.record_attempt(&item)?;

        tracing::warn!(
            "Sync attempt {} failed for {}, retrying in {} ms: {}",
            item.attempt_count,
            item.local_id,
            delay_ms,
            reason
        );
        Ok(CareVistaError::SyncAttemptFailed {
            local_id: item.local_id,
            reason,
        })
    }

    fn doctor_sharing_granted(&self, subject_id: &str) -> Result<bool> {
        Ok(self
            .consent_cache
            .snapshot(self.store.as_ref(), subject_id, ConsentType::DoctorSharing)?
            .is_granted())
    }

    /// Call the remote on a helper thread, bounded by `remote_timeout`.
    ///
    /// A call that times out keeps running in the background; its result is
    /// discarded and the retry is deduplicated by `local_id`.
    fn call_with_timeout(&self, envelope: SyncEnvelope) -> std::result::Result<RemoteAck, RemoteError> {
        let (tx, rx) = mpsc::channel();
        let remote = Arc::clone(&self.remote);

        thread::spawn(move || {
            let _ = tx.send(remote.upsert(&envelope));
        });

        match rx.recv_timeout(self.remote_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(RemoteError::Timeout(
                u64::try_from(self.remote_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(RemoteError::Unreachable("remote call aborted".to_string()))
            }
        }
    }

    fn build_envelope(&self, item: &SyncQueueItem) -> Result<SyncEnvelope> {
        let missing = || StoreError::NotFound(format!("{} {}", item.entity_type, item.payload_ref));

        let payload = match (item.entity_type, item.operation) {
            (EntityType::Entry, SyncOperation::Upsert) => {
                let entry = self.store.get_entry(&item.payload_ref)?.ok_or_else(missing)?;
                serde_json::to_value(&entry)?
            }
            (EntityType::Entry, SyncOperation::Tombstone) => {
                let entry = self.store.get_entry(&item.payload_ref)?.ok_or_else(missing)?;
                serde_json::json!({
                    "id": entry.id,
                    "deletedAt": entry.deleted_at,
                })
            }
            (EntityType::Media, SyncOperation::Upsert) => {
                let blob = self.store.get_media(&item.payload_ref)?.ok_or_else(missing)?;
                let data = blob.data.as_deref().ok_or_else(|| {
                    CareVistaError::Validation(format!("media {} has no resident bytes", blob.id))
                })?;
                serde_json::json!({
                    "id": blob.id,
                    "subjectId": blob.subject_id,
                    "mimeType": blob.mime_type,
                    "sha256": blob.sha256,
                    "sizeBytes": blob.size_bytes,
                    "createdAt": blob.created_at,
                    "data": base64::engine::general_purpose::STANDARD.encode(data),
                })
            }
            (EntityType::Consent, SyncOperation::Upsert) => {
                let record = self
                    .store
                    .consents_for_subject(&item.subject_id)?
                    .into_iter()
                    .find(|r| r.id == item.payload_ref)
                    .ok_or_else(missing)?;
                serde_json::to_value(&record)?
            }
            (EntityType::TemporaryPatient, SyncOperation::Upsert) => {
                let patient = self
                    .store
                    .get_temporary_patient(&item.payload_ref)?
                    .ok_or_else(missing)?;
                serde_json::to_value(&patient)?
            }
            (EntityType::TemporaryPatient, SyncOperation::Link) => {
                let patient = self
                    .store
                    .get_temporary_patient(&item.payload_ref)?
                    .ok_or_else(missing)?;
                serde_json::json!({
                    "tempId": patient.id,
                    "permanentId": patient.linked_to,
                    "linkedAt": patient.linked_at,
                })
            }
            (EntityType::Report, SyncOperation::Upsert) => {
                let report = self.store.get_report(&item.payload_ref)?.ok_or_else(missing)?;
                serde_json::to_value(&report)?
            }
            (EntityType::Report, SyncOperation::Approve) => {
                let report = self.store.get_report(&item.payload_ref)?.ok_or_else(missing)?;
                serde_json::json!({
                    "id": report.id,
                    "approvedForSharing": report.approved_for_sharing,
                    "approvedAt": report.approved_at,
                })
            }
            (entity_type, operation) => {
                return Err(CareVistaError::Validation(format!(
                    "unsupported sync operation {} for {}",
                    operation.as_str(),
                    entity_type
                )))
            }
        };

        Ok(SyncEnvelope {
            local_id: item.local_id.clone(),
            entity_type: item.entity_type,
            operation: item.operation,
            subject_id: item.subject_id.clone(),
            created_at: item.created_at,
            payload,
        })
    }

    /// Snapshot for status indicators.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub fn status(&self) -> Result<SyncStatus> {
        let items = self.store.queue_items()?;

        let errors = items
            .iter()
            .filter(|item| item.failed)
            .map(|item| SyncErrorReport {
                local_id: item.local_id.clone(),
                entity_type: item.entity_type,
                attempt_count: item.attempt_count,
                last_error: item.last_error.clone(),
            })
            .collect();
        let last_error = items.iter().rev().find_map(|item| item.last_error.clone());

        Ok(SyncStatus {
            is_syncing: self.is_syncing(),
            pending_count: items.len(),
            last_sync_at: self.last_sync_at()?,
            errors,
            last_error,
        })
    }

    /// Receive a fresh status snapshot whenever the queue changes.
    pub fn subscribe_status(&self) -> Receiver<SyncStatus> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().expect("Lock failed").push(tx);
        rx
    }

    fn publish_status(&self) {
        let mut subscribers = self.subscribers.lock().expect("Lock failed");
        if subscribers.is_empty() {
            return;
        }
        match self.status() {
            Ok(status) => subscribers.retain(|tx| tx.send(status.clone()).is_ok()),
            Err(e) => tracing::debug!("Status unavailable: {}", e),
        }
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// # Errors
    /// Returns error if the store cannot be read.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.store.pending_count()?)
    }

    /// # Errors
    /// Returns error if the store cannot be read.
    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get_meta(META_LAST_SYNC_AT)?
            .as_deref()
            .and_then(parse_meta_timestamp))
    }

    /// Put a permanently failed item back in line with a fresh attempt budget.
    ///
    /// # Returns
    /// `false` if no failed item has that id.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub fn retry_failed(&self, local_id: &str) -> Result<bool> {
        let reset = self.store.reset_failed(Some(local_id))? > 0;
        if reset {
            tracing::info!("Manual retry requested for {}", local_id);
            self.publish_status();
        }
        Ok(reset)
    }

    /// # Errors
    /// Returns error if the store fails.
    pub fn retry_all_failed(&self) -> Result<usize> {
        let reset = self.store.reset_failed(None)?;
        if reset > 0 {
            tracing::info!("Manual retry requested for {} failed item(s)", reset);
            self.publish_status();
        }
        Ok(reset)
    }

    /// Record that a doctor reviewed an entry.
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if the entry does not exist.
    pub fn acknowledge_review(&self, entry_id: &str) -> Result<()> {
        self.store.mark_reviewed(entry_id)?;
        tracing::debug!("Entry {} marked as reviewed", entry_id);
        Ok(())
    }

    /// Re-queue unsynced local writes that lost their queue item.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for item in self.store.orphaned_writes()? {
            if self.store.enqueue(&item)? {
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!("Recovered {} unsynced write(s) without a queue item", recovered);
            self.publish_status();
        }
        Ok(recovered)
    }

    #[cfg(test)]
    fn seed_jitter(&self, seed: [u8; 32]) {
        *self.rng.lock().expect("Lock failed") = ChaCha20Rng::from_seed(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LoopbackRemote, ManualClock, SqliteStore};
    use crate::domain::{ConsentRecord, Entry, EntryKind, Report, ReportUploader};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).single().expect("valid")
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        remote: Arc<LoopbackRemote>,
        clock: Arc<ManualClock>,
        queue: SyncQueue<SqliteStore, LoopbackRemote>,
    }

    fn fixture(jitter: f64) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().expect("db"));
        let remote = Arc::new(LoopbackRemote::new());
        let clock = Arc::new(ManualClock::new(at(0)));
        let policy = BackoffPolicy {
            jitter,
            ..BackoffPolicy::default()
        };
        let queue = SyncQueue::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&clock) as Arc<dyn Clock>,
            policy,
            Duration::from_millis(500),
        );
        queue.seed_jitter([3u8; 32]);
        Fixture {
            store,
            remote,
            clock,
            queue,
        }
    }

    fn queue_entry(f: &Fixture, subject: &str, secs: i64) -> Entry {
        let entry = Entry::new(subject, EntryKind::Manual, "tired", at(secs));
        f.store.put_entry(&entry).expect("save");
        f.queue
            .enqueue(&SyncQueueItem::upsert(EntityType::Entry, entry.id.clone(), subject, entry.created_at))
            .expect("enqueue");
        entry
    }

    #[test]
    fn test_drain_acknowledges_and_stamps() {
        let f = fixture(0.0);
        let entry = queue_entry(&f, "p1", 0);

        let report = f.queue.drain().expect("drain");
        assert_eq!(report.synced, 1);
        assert_eq!(f.queue.pending_count().expect("count"), 0);
        assert!(f.remote.contains(&entry.id));

        let stored = f.store.get_entry(&entry.id).expect("load").expect("exists");
        assert!(stored.synced_at.is_some());
        assert!(!stored.shared_with_doctor, "no doctor sharing consent");
        assert_eq!(f.queue.last_sync_at().expect("meta"), Some(at(0)));
    }

    #[test]
    fn test_entry_marked_shared_when_consent_granted() {
        let f = fixture(0.0);
        f.store
            .put_consent(&ConsentRecord::grant("p1", ConsentType::DoctorSharing, at(0), None))
            .expect("consent");
        let entry = queue_entry(&f, "p1", 1);

        f.queue.drain().expect("drain");
        assert!(f.store.get_entry(&entry.id).expect("load").expect("exists").shared_with_doctor);
    }

    #[test]
    fn test_report_upload_and_approval_envelopes() {
        let f = fixture(0.0);
        let report = Report::new("p1", "cbc.pdf", "application/pdf", ReportUploader::Patient, at(0));
        f.store.put_report(&report).expect("save");
        f.queue
            .enqueue(&SyncQueueItem::upsert(EntityType::Report, report.id.clone(), "p1", at(0)))
            .expect("enqueue");
        f.store.approve_report(&report.id, at(1)).expect("approve");
        let approval = SyncQueueItem::approve(report.id.clone(), "p1", at(1));
        f.queue.enqueue(&approval).expect("enqueue");

        let drained = f.queue.drain().expect("drain");
        assert_eq!(drained.synced, 2);
        assert_eq!(f.remote.applied_order(), vec![report.id.clone(), approval.local_id.clone()]);

        let upload = f.remote.envelope(&report.id).expect("upload sent");
        assert_eq!(upload.payload["fileName"], "cbc.pdf");
        let approved = f.remote.envelope(&approval.local_id).expect("approval sent");
        assert_eq!(approved.operation, SyncOperation::Approve);
        assert_eq!(approved.payload["approvedForSharing"], true);
    }

    #[test]
    fn test_failure_schedules_backoff_and_holds_only_that_entity() {
        let f = fixture(0.0);
        let first = queue_entry(&f, "p1", 0);
        let tombstone = SyncQueueItem::tombstone(EntityType::Entry, first.id.clone(), "p1", at(1));
        f.store.tombstone_entry(&first.id, at(1)).expect("tombstone");
        f.queue.enqueue(&tombstone).expect("enqueue");
        let second = queue_entry(&f, "p1", 2);
        f.remote.fail_next(1);

        let report = f.queue.drain().expect("drain");
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1, "tombstone waits behind its upsert");
        assert_eq!(report.synced, 1, "other entries of the subject are not held back");
        assert!(f.remote.contains(&second.id));

        let item = f.store.queue_item(&first.id).expect("load").expect("queued");
        assert_eq!(item.attempt_count, 1);
        assert_eq!(item.last_delay_ms, 2_000);
        assert_eq!(item.next_attempt_at, Some(at(2)));

        // Not due yet.
        assert_eq!(f.queue.drain().expect("drain").synced, 0);

        f.clock.advance(chrono::Duration::seconds(2));
        assert_eq!(f.queue.drain().expect("drain").synced, 2);
        assert_eq!(
            f.remote.applied_order(),
            vec![second.id, first.id.clone(), tombstone.local_id]
        );
    }

    #[test]
    fn test_permanently_failed_item_blocks_nothing() {
        let f = fixture(0.0);
        let grant = ConsentRecord::grant("p1", ConsentType::DoctorSharing, at(0), None);
        f.store.put_consent(&grant).expect("consent");
        f.queue
            .enqueue(&SyncQueueItem::upsert(EntityType::Consent, grant.id.clone(), "p1", at(0)))
            .expect("enqueue");
        f.queue.drain().expect("drain");
        assert!(f.remote.contains(&grant.id));

        let stuck = queue_entry(&f, "p1", 1);
        f.remote.set_online(false);
        for _ in 0..5 {
            f.queue.drain().expect("drain");
            f.clock.advance(chrono::Duration::seconds(200));
        }
        assert!(f.store.queue_item(&stuck.id).expect("load").expect("kept").failed);

        f.remote.set_online(true);
        let revoke = ConsentRecord::revoke("p1", ConsentType::DoctorSharing, at(300));
        f.store.put_consent(&revoke).expect("consent");
        f.queue
            .enqueue(&SyncQueueItem::upsert(EntityType::Consent, revoke.id.clone(), "p1", at(300)))
            .expect("enqueue");
        let later = queue_entry(&f, "p1", 301);

        let report = f.queue.drain().expect("drain");
        assert_eq!(report.synced, 2);
        assert!(f.remote.contains(&revoke.id));
        assert!(f.remote.contains(&later.id));
        assert!(!f.remote.contains(&stuck.id));
        assert_eq!(f.queue.pending_count().expect("count"), 1);
    }

    #[test]
    fn test_jittered_delays_are_bounded_and_non_decreasing() {
        let f = fixture(0.2);
        let entry = queue_entry(&f, "p1", 0);
        f.remote.set_online(false);

        let mut previous = 0;
        for _ in 0..4 {
            f.queue.drain().expect("drain");
            let item = f.store.queue_item(&entry.id).expect("load").expect("queued");
            assert!(item.last_delay_ms >= previous);
            assert!(item.last_delay_ms <= 144_000);
            previous = item.last_delay_ms;
            f.clock.advance(chrono::Duration::seconds(200));
        }
    }

    #[test]
    fn test_permanent_failure_and_manual_retry() {
        let f = fixture(0.0);
        let entry = queue_entry(&f, "p1", 0);
        f.remote.set_online(false);

        for _ in 0..5 {
            f.queue.drain().expect("drain");
            f.clock.advance(chrono::Duration::seconds(200));
        }

        let status = f.queue.status().expect("status");
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].attempt_count, 5);

        // Failed items are not attempted again on their own.
        f.remote.set_online(true);
        assert_eq!(f.queue.drain().expect("drain").synced, 0);

        assert!(f.queue.retry_failed(&entry.id).expect("retry"));
        assert_eq!(f.queue.drain().expect("drain").synced, 1);
        assert!(!f.queue.status().expect("status").has_errors());
    }

    #[test]
    fn test_slow_remote_times_out() {
        let f = fixture(0.0);
        let entry = queue_entry(&f, "p1", 0);
        f.remote.set_latency(Some(Duration::from_millis(1_500)));

        let report = f.queue.drain().expect("drain");
        assert_eq!(report.failed, 1);
        let item = f.store.queue_item(&entry.id).expect("load").expect("queued");
        assert!(item.last_error.as_deref().is_some_and(|e| e.contains("timed out")));
    }

    #[test]
    fn test_recover_requeues_orphans() {
        let f = fixture(0.0);
        let entry = Entry::new("p1", EntryKind::Manual, "written before crash", at(0));
        f.store.put_entry(&entry).expect("save");

        assert_eq!(f.queue.recover().expect("recover"), 1);
        assert_eq!(f.queue.recover().expect("recover"), 0);
        assert_eq!(f.queue.drain().expect("drain").synced, 1);
    }

    #[test]
    fn test_status_subscription() {
        let f = fixture(0.0);
        let rx = f.queue.subscribe_status();
        queue_entry(&f, "p1", 0);
        f.queue.drain().expect("drain");

        let snapshots: Vec<SyncStatus> = rx.try_iter().collect();
        assert!(snapshots.iter().any(|s| s.is_syncing));
        assert_eq!(snapshots.last().map(|s| s.pending_count), Some(0));
    }
}
