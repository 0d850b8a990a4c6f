//! Record service: Captures logbook entries, media, reports and temporary
//! patients.
//!
//! Every write goes to the local store first and is queued for sync in the
//! same call. Nothing here touches the network.

use std::sync::Arc;

use super::{ConsentLedger, SyncQueue};
use crate::domain::{
    ConsentType, EntityType, Entry, EntryKind, MediaBlob, Report, SyncQueueItem, TemporaryPatient,
};
use crate::ports::{Clock, LocalStore, RemoteEndpoint};
use crate::{CareVistaError, Result};

/// Service for capturing and managing records offline.
pub struct RecordService<S, R>
where
    S: LocalStore,
    R: RemoteEndpoint,
{
    store: Arc<S>,
    queue: Arc<SyncQueue<S, R>>,
    ledger: Arc<ConsentLedger<S, R>>,
    clock: Arc<dyn Clock>,
}

impl<S, R> RecordService<S, R>
where
    S: LocalStore + 'static,
    R: RemoteEndpoint + 'static,
{
    pub fn new(
        store: Arc<S>,
        queue: Arc<SyncQueue<S, R>>,
        ledger: Arc<ConsentLedger<S, R>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            ledger,
            clock,
        }
    }

    /// Store an entry and queue it for sync.
    ///
    /// A voice entry carrying a summary needs transcription consent.
    ///
    /// # Errors
    /// Returns `Validation` for malformed entries, `ConsentRequired`, or a
    /// storage error (`StorageExhausted` included).
    pub fn capture_entry(&self, entry: Entry) -> Result<Entry> {
        entry
            .validate()
            .map_err(|errors| CareVistaError::Validation(errors.join("; ")))?;

        if entry.kind == EntryKind::Voice && entry.structured_summary.is_some() {
            self.ledger.require(&entry.subject_id, ConsentType::Transcription)?;
        }

        let stored = self.store.put_entry(&entry)?;
        self.queue.enqueue(&SyncQueueItem::upsert(
            EntityType::Entry,
            stored.id.clone(),
            stored.subject_id.clone(),
            stored.created_at,
        ))?;

        tracing::info!(kind = %stored.kind, "Captured logbook entry");
        Ok(stored)
    }

    /// Store a recording or image together with the entry that owns it.
    ///
    /// The blob is queued ahead of the entry, so a drain that reaches both
    /// uploads the bytes first.
    ///
    /// # Errors
    /// Returns `ConsentRequired` without recording consent, or a storage error.
    pub fn capture_entry_with_media(
        &self,
        entry: Entry,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(Entry, MediaBlob)> {
        self.ledger.require(&entry.subject_id, ConsentType::Recording)?;

        if bytes.is_empty() {
            return Err(CareVistaError::Validation("Recording is empty".to_string()));
        }

        let blob = MediaBlob::new(entry.subject_id.clone(), mime_type, bytes, entry.created_at);
        let blob = self.store.put_media(&blob)?;
        self.queue.enqueue(&SyncQueueItem::upsert(
            EntityType::Media,
            blob.id.clone(),
            blob.subject_id.clone(),
            blob.created_at,
        ))?;

        let entry = self.capture_entry(entry.with_media(blob.id.clone()))?;
        Ok((entry, blob))
    }

    /// Tombstone an entry and queue the deletion.
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if the entry does not exist.
    pub fn tombstone_entry(&self, entry_id: &str) -> Result<Entry> {
        let entry = self.store.tombstone_entry(entry_id, self.clock.now())?;
        let deleted_at = entry.deleted_at.unwrap_or_else(|| self.clock.now());
        self.queue.enqueue(&SyncQueueItem::tombstone(
            EntityType::Entry,
            entry.id.clone(),
            entry.subject_id.clone(),
            deleted_at,
        ))?;
        Ok(entry)
    }

    /// Mark a blob deleted by the user. Its bytes are released by
    /// `collect_garbage` once it has also been synced.
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if the blob does not exist.
    pub fn delete_media(&self, media_id: &str) -> Result<MediaBlob> {
        Ok(self.store.request_media_deletion(media_id, self.clock.now())?)
    }

    /// # Errors
    /// Returns error if the store fails.
    pub fn collect_garbage(&self) -> Result<usize> {
        Ok(self.store.collect_garbage()?)
    }

    /// # Errors
    /// Returns error if the store fails.
    pub fn media(&self, media_id: &str) -> Result<Option<MediaBlob>> {
        Ok(self.store.get_media(media_id)?)
    }

    /// The subject's own logbook, newest first. Not gated: patients always
    /// see their own entries.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub fn own_logbook(&self, subject_id: &str) -> Result<Vec<Entry>> {
        Ok(self.store.entries_for_subject(subject_id)?)
    }

    /// Store an uploaded report file and queue both blob and metadata.
    ///
    /// The report starts private; doctors see it only after
    /// [`approve_report_sharing`](Self::approve_report_sharing).
    ///
    /// # Errors
    /// Returns `Validation` for malformed reports or empty files, or a
    /// storage error (`StorageExhausted` included).
    pub fn capture_report(&self, report: Report, bytes: Vec<u8>) -> Result<Report> {
        report
            .validate()
            .map_err(|errors| CareVistaError::Validation(errors.join("; ")))?;
        if bytes.is_empty() {
            return Err(CareVistaError::Validation("Report file is empty".to_string()));
        }

        let blob = MediaBlob::new(report.subject_id.clone(), &report.file_type, bytes, report.created_at);
        let blob = self.store.put_media(&blob)?;
        self.queue.enqueue(&SyncQueueItem::upsert(
            EntityType::Media,
            blob.id.clone(),
            blob.subject_id.clone(),
            blob.created_at,
        ))?;

        let report = Report {
            file_size: blob.size_bytes,
            media_ref: Some(blob.id),
            ..report
        };
        let stored = self.store.put_report(&report)?;
        self.queue.enqueue(&SyncQueueItem::upsert(
            EntityType::Report,
            stored.id.clone(),
            stored.subject_id.clone(),
            stored.created_at,
        ))?;

        tracing::info!(uploaded_by = stored.uploaded_by.as_str(), "Captured report");
        Ok(stored)
    }

    /// The patient approves a report for sharing with doctors.
    ///
    /// # Errors
    /// Returns `StoreError::NotFound` if the report does not exist.
    pub fn approve_report_sharing(&self, report_id: &str) -> Result<Report> {
        let report = self.store.approve_report(report_id, self.clock.now())?;
        let approved_at = report.approved_at.unwrap_or_else(|| self.clock.now());
        self.queue.enqueue(&SyncQueueItem::approve(
            report.id.clone(),
            report.subject_id.clone(),
            approved_at,
        ))?;
        Ok(report)
    }

    /// The subject's own reports, newest first. Not gated.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub fn own_reports(&self, subject_id: &str) -> Result<Vec<Report>> {
        Ok(self.store.reports_for_subject(subject_id)?)
    }

    /// Reports a doctor may see: doctor sharing must be in effect and the
    /// patient must have approved each report.
    ///
    /// Meant to be loaded through a `ProtectedView` so a later revoke
    /// evicts what was read.
    ///
    /// # Errors
    /// Returns `ConsentRequired` without doctor sharing, or a storage error.
    pub fn reports_for_doctor(&self, subject_id: &str) -> Result<Vec<Report>> {
        self.ledger.require(subject_id, ConsentType::DoctorSharing)?;
        Ok(self
            .store
            .reports_for_subject(subject_id)?
            .into_iter()
            .filter(|report| report.approved_for_sharing)
            .collect())
    }

    /// Register a patient without an account at a camp.
    ///
    /// # Errors
    /// Returns `Validation` for incomplete registrations, or a storage error.
    pub fn register_temporary_patient(&self, patient: TemporaryPatient) -> Result<TemporaryPatient> {
        patient
            .validate()
            .map_err(|errors| CareVistaError::Validation(errors.join("; ")))?;

        let stored = self.store.put_temporary_patient(&patient)?;
        self.queue.enqueue(&SyncQueueItem::upsert(
            EntityType::TemporaryPatient,
            stored.id.clone(),
            stored.id.clone(),
            stored.created_at,
        ))?;

        tracing::info!("Registered temporary patient");
        Ok(stored)
    }

    /// Link a temporary patient to a permanent account.
    ///
    /// # Errors
    /// Returns `StoreError::AlreadyLinked` when linked to a different
    /// account, or `StoreError::NotFound`.
    pub fn link_temporary_patient(&self, temp_id: &str, permanent_id: &str) -> Result<TemporaryPatient> {
        if permanent_id.trim().is_empty() {
            return Err(CareVistaError::Validation("Permanent id must not be empty".to_string()));
        }

        let linked = self
            .store
            .link_temporary_patient(temp_id, permanent_id, self.clock.now())?;
        let linked_at = linked.linked_at.unwrap_or_else(|| self.clock.now());
        self.queue
            .enqueue(&SyncQueueItem::link(linked.id.clone(), permanent_id, linked_at))?;
        Ok(linked)
    }

    /// # Errors
    /// Returns error if the store fails.
    pub fn temporary_patients_for(&self, health_worker_id: &str) -> Result<Vec<TemporaryPatient>> {
        Ok(self.store.temporary_patients_by(health_worker_id)?)
    }
}
