//! Local store port: Durable on-device persistence.
//!
//! Every write the user makes lands here first and must succeed without
//! network access. The store also persists the sync queue and a small
//! key/value table for sync metadata (consent cursor, last sync time).

use chrono::{DateTime, Utc};

use crate::domain::{
    ConsentRecord, ConsentType, EntityType, Entry, MediaBlob, Report, SyncQueueItem,
    TemporaryPatient,
};

/// Errors surfaced by a local store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The write could not be persisted. Nothing was dropped; the caller has
    /// to free space (or wait for blobs to sync so they become evictable).
    #[error("Local storage exhausted: {requested} bytes requested, {available} bytes available")]
    StorageExhausted { requested: u64, available: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Temporary patient {temp_id} is already linked to another account")]
    AlreadyLinked { temp_id: String },

    #[error("Database error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted row: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Whether the failure is caused by lack of space.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::StorageExhausted { .. })
    }
}

/// Metadata key holding the remote consent ledger cursor.
pub const META_CONSENT_CURSOR: &str = "consent_cursor";

/// Metadata key holding the time of the last successful drain.
pub const META_LAST_SYNC_AT: &str = "last_sync_at";

/// Any stored entity, as returned by [`LocalStore::get_all_for_subject`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoredEntity {
    Entry(Entry),
    Media(MediaBlob),
    Consent(ConsentRecord),
    TemporaryPatient(TemporaryPatient),
    Report(Report),
}

/// Trait for on-device storage.
///
/// All `put_*` operations are idempotent keyed by id: if a row with the same
/// id exists it is left untouched and returned. Mutations are atomic per
/// entity.
pub trait LocalStore: Send + Sync {
    // --- Entries ---

    /// Store an entry (or return the already stored one).
    ///
    /// # Errors
    /// Returns `StoreError::StorageExhausted` when the device is full.
    fn put_entry(&self, entry: &Entry) -> Result<Entry, StoreError>;

    /// Load a single entry, tombstoned or not.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn get_entry(&self, id: &str) -> Result<Option<Entry>, StoreError>;

    /// Entries for a subject, newest first, tombstones excluded.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn entries_for_subject(&self, subject_id: &str) -> Result<Vec<Entry>, StoreError>;

    /// Flag an entry as shared with the subject's doctor. Idempotent.
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if the entry does not exist.
    fn mark_shared(&self, entry_id: &str) -> Result<(), StoreError>;

    /// Flag an entry as reviewed by a doctor. Idempotent.
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if the entry does not exist.
    fn mark_reviewed(&self, entry_id: &str) -> Result<(), StoreError>;

    /// Set the tombstone marker on an entry (first call wins).
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if the entry does not exist.
    fn tombstone_entry(&self, entry_id: &str, at: DateTime<Utc>) -> Result<Entry, StoreError>;

    // --- Media ---

    /// Store a media blob, evicting bytes of already-synced blobs if the
    /// quota would otherwise be exceeded.
    ///
    /// # Errors
    /// Returns `StoreError::StorageExhausted` if space cannot be made.
    fn put_media(&self, blob: &MediaBlob) -> Result<MediaBlob, StoreError>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn get_media(&self, id: &str) -> Result<Option<MediaBlob>, StoreError>;

    /// Media blobs for a subject, newest first.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn media_for_subject(&self, subject_id: &str) -> Result<Vec<MediaBlob>, StoreError>;

    /// Record that the user asked to delete a blob. Bytes stay until the
    /// blob is also synced and `collect_garbage` runs.
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if the blob does not exist.
    fn request_media_deletion(&self, id: &str, at: DateTime<Utc>) -> Result<MediaBlob, StoreError>;

    /// Drop bytes of blobs that are both synced and user-deleted.
    ///
    /// # Returns
    /// Number of blobs whose bytes were released.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn collect_garbage(&self) -> Result<usize, StoreError>;

    // --- Consent ---

    /// Append a consent record. Existing ids are left untouched.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn put_consent(&self, record: &ConsentRecord) -> Result<ConsentRecord, StoreError>;

    /// All records for one (subject, type) pair, oldest first.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn consents_for(
        &self,
        subject_id: &str,
        consent_type: ConsentType,
    ) -> Result<Vec<ConsentRecord>, StoreError>;

    /// All records for a subject, oldest first.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn consents_for_subject(&self, subject_id: &str) -> Result<Vec<ConsentRecord>, StoreError>;

    // --- Temporary patients ---

    /// # Errors
    /// Returns error if storage operation fails.
    fn put_temporary_patient(&self, patient: &TemporaryPatient) -> Result<TemporaryPatient, StoreError>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn get_temporary_patient(&self, id: &str) -> Result<Option<TemporaryPatient>, StoreError>;

    /// Temporary patients registered by a health worker, newest first.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn temporary_patients_by(&self, health_worker_id: &str) -> Result<Vec<TemporaryPatient>, StoreError>;

    /// Link a temporary patient to a permanent account.
    ///
    /// # Errors
    /// Returns `StoreError::AlreadyLinked` if a link exists, or
    /// `StoreError::NotFound` if the patient does not exist.
    fn link_temporary_patient(
        &self,
        temp_id: &str,
        permanent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<TemporaryPatient, StoreError>;

    // --- Reports ---

    /// Store a report (or return the already stored one).
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn put_report(&self, report: &Report) -> Result<Report, StoreError>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn get_report(&self, id: &str) -> Result<Option<Report>, StoreError>;

    /// Reports for a subject, newest first.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn reports_for_subject(&self, subject_id: &str) -> Result<Vec<Report>, StoreError>;

    /// Approve a report for sharing with doctors. Idempotent; the first
    /// approval time is kept.
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if the report does not exist.
    fn approve_report(&self, id: &str, at: DateTime<Utc>) -> Result<Report, StoreError>;

    // --- Sync queue ---

    /// Persist a queue item. Idempotent on `local_id`.
    ///
    /// # Returns
    /// `true` if the item was newly added.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn enqueue(&self, item: &SyncQueueItem) -> Result<bool, StoreError>;

    /// All queue items in creation order.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn queue_items(&self) -> Result<Vec<SyncQueueItem>, StoreError>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn queue_item(&self, local_id: &str) -> Result<Option<SyncQueueItem>, StoreError>;

    /// Persist the outcome of a failed attempt (attempt count, error, backoff).
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn record_attempt(&self, item: &SyncQueueItem) -> Result<(), StoreError>;

    /// Remove an acknowledged item and stamp its source entity as synced,
    /// in one transaction.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn complete_sync(&self, item: &SyncQueueItem, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Clear the failed flag and attempt count so items are retried.
    /// `None` resets every failed item.
    ///
    /// # Returns
    /// Number of items reset.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn reset_failed(&self, local_id: Option<&str>) -> Result<usize, StoreError>;

    /// Number of items still in the queue.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn pending_count(&self) -> Result<usize, StoreError>;

    /// Unsynced local writes that have no queue item (e.g. the process died
    /// between the write and the enqueue).
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn orphaned_writes(&self) -> Result<Vec<SyncQueueItem>, StoreError>;

    // --- Metadata ---

    /// # Errors
    /// Returns error if storage operation fails.
    fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// # Errors
    /// Returns error if storage operation fails.
    fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Finite snapshot of a subject's entities of one type, newest first.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn get_all_for_subject(
        &self,
        subject_id: &str,
        entity_type: EntityType,
    ) -> Result<Vec<StoredEntity>, StoreError> {
        let entities = match entity_type {
            EntityType::Entry => self
                .entries_for_subject(subject_id)?
                .into_iter()
                .map(StoredEntity::Entry)
                .collect(),
            EntityType::Media => self
                .media_for_subject(subject_id)?
                .into_iter()
                .map(StoredEntity::Media)
                .collect(),
            EntityType::Consent => {
                let mut records = self.consents_for_subject(subject_id)?;
                records.reverse();
                records.into_iter().map(StoredEntity::Consent).collect()
            }
            EntityType::TemporaryPatient => self
                .get_temporary_patient(subject_id)?
                .into_iter()
                .map(StoredEntity::TemporaryPatient)
                .collect(),
            EntityType::Report => self
                .reports_for_subject(subject_id)?
                .into_iter()
                .map(StoredEntity::Report)
                .collect(),
        };
        Ok(entities)
    }
}
