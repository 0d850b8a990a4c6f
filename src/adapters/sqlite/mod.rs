//! SQLite adapter: Implementation of LocalStore.
//!
//! Provides on-device persistence for entries, media blobs, consent records,
//! temporary patients, reports and the sync queue. Works with zero network.
//!
//! # Layout
//!
//! `entries`, `media`, `consents`, `temporary_patients`, `reports`,
//! `sync_queue` and a `sync_meta` key/value table. Timestamps are stored as microseconds since
//! the Unix epoch so ordering is numeric and exact.
//!
//! # Quota
//!
//! An optional byte quota applies to resident media bytes. When a new blob
//! does not fit, bytes of the oldest already-synced blobs are evicted (the
//! remote holds a copy). Unsynced bytes are never evicted; if space cannot be
//! made the write fails with `StorageExhausted` and nothing is changed.
//!
//! # Mutex Behavior
//!
//! The connection is protected by `Mutex`. A poisoned mutex (from a panic in
//! another thread) will cause a panic. This fail-fast behavior is intentional:
//! continuing after a half-applied write would risk the data we exist to keep.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::domain::{
    ConsentRecord, ConsentType, EntityType, Entry, EntryKind, MediaBlob, RecordOrigin, Report,
    ReportUploader, StructuredSummary, SyncOperation, SyncQueueItem, TemporaryPatient,
};
use crate::ports::{LocalStore, StoreError};

const ENTRY_COLUMNS: &str = "id, subject_id, kind, created_at, original_text, structured_summary, \
     media_ref, language, assisted_by, shared_with_doctor, doctor_reviewed, synced_at, deleted_at";

const MEDIA_COLUMNS: &str = "id, subject_id, mime_type, sha256, size_bytes, created_at, data, \
     synced_at, user_deleted_at, evicted_at";

const CONSENT_COLUMNS: &str = "id, subject_id, consent_type, granted, timestamp, assisted_by, origin";

const TEMP_PATIENT_COLUMNS: &str =
    "id, name, phone, age, gender, camp_name, created_by, linked_to, linked_at, created_at";

const REPORT_COLUMNS: &str = "id, subject_id, file_name, file_type, file_size, uploaded_by, \
     symptom_entry_id, media_ref, approved_for_sharing, approved_at, created_at";

const QUEUE_COLUMNS: &str = "local_id, entity_type, payload_ref, subject_id, operation, \
     attempt_count, last_error, created_at, next_attempt_at, last_delay_ms, failed";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref e, _) if e.code == rusqlite::ErrorCode::DiskFull => {
                Self::StorageExhausted {
                    requested: 0,
                    available: 0,
                }
            }
            rusqlite::Error::FromSqlConversionFailure(_, _, inner) => {
                Self::Corrupted(inner.to_string())
            }
            other => Self::Backend(other.to_string()),
        }
    }
}

/// SQLite store adapter.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    quota_bytes: Option<u64>,
}

impl SqliteStore {
    /// Open (or create) a file-backed store.
    ///
    /// # Errors
    /// Returns error if database cannot be opened or initialized.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            quota_bytes: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    ///
    /// # Errors
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            quota_bytes: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Limit resident media bytes.
    #[must_use]
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("Lock failed");

        conn.execute_batch(
            r"
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                original_text TEXT NOT NULL,
                structured_summary TEXT,
                media_ref TEXT,
                language TEXT NOT NULL,
                assisted_by TEXT,
                shared_with_doctor INTEGER NOT NULL DEFAULT 0,
                doctor_reviewed INTEGER NOT NULL DEFAULT 0,
                synced_at INTEGER,
                deleted_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_entries_subject
                ON entries(subject_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS media (
                id TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                data BLOB,
                synced_at INTEGER,
                user_deleted_at INTEGER,
                evicted_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_media_subject
                ON media(subject_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS consents (
                id TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL,
                consent_type TEXT NOT NULL,
                granted INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                assisted_by TEXT,
                origin TEXT NOT NULL,
                synced_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_consents_pair
                ON consents(subject_id, consent_type, timestamp);

            CREATE TABLE IF NOT EXISTS temporary_patients (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                phone TEXT,
                age INTEGER,
                gender TEXT,
                camp_name TEXT,
                created_by TEXT NOT NULL,
                linked_to TEXT,
                linked_at INTEGER,
                created_at INTEGER NOT NULL,
                synced_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_type TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                uploaded_by TEXT NOT NULL,
                symptom_entry_id TEXT,
                media_ref TEXT,
                approved_for_sharing INTEGER NOT NULL DEFAULT 0,
                approved_at INTEGER,
                created_at INTEGER NOT NULL,
                synced_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_reports_subject
                ON reports(subject_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                local_id TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                payload_ref TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                next_attempt_at INTEGER,
                last_delay_ms INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    fn table_for(entity_type: EntityType) -> &'static str {
        match entity_type {
            EntityType::Entry => "entries",
            EntityType::Media => "media",
            EntityType::Consent => "consents",
            EntityType::TemporaryPatient => "temporary_patients",
            EntityType::Report => "reports",
        }
    }

    fn select_entry(conn: &Connection, id: &str) -> Result<Option<Entry>, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], row_to_entry).optional()?)
    }

    fn select_media(conn: &Connection, id: &str) -> Result<Option<MediaBlob>, StoreError> {
        let sql = format!("SELECT {MEDIA_COLUMNS} FROM media WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], row_to_media).optional()?)
    }

    fn select_consent(conn: &Connection, id: &str) -> Result<Option<ConsentRecord>, StoreError> {
        let sql = format!("SELECT {CONSENT_COLUMNS} FROM consents WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], row_to_consent).optional()?)
    }

    fn select_temporary_patient(
        conn: &Connection,
        id: &str,
    ) -> Result<Option<TemporaryPatient>, StoreError> {
        let sql = format!("SELECT {TEMP_PATIENT_COLUMNS} FROM temporary_patients WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], row_to_temporary_patient).optional()?)
    }

    fn select_report(conn: &Connection, id: &str) -> Result<Option<Report>, StoreError> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = ?1");
        Ok(conn.query_row(&sql, params![id], row_to_report).optional()?)
    }

    /// Evict bytes of the oldest synced blobs until `needed` more bytes fit.
    ///
    /// Runs inside the caller's transaction; on failure the caller rolls back.
    fn make_room(conn: &Connection, quota: u64, needed: u64) -> Result<usize, StoreError> {
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM media WHERE data IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let mut used = used.max(0) as u64;

        if used.saturating_add(needed) <= quota {
            return Ok(0);
        }

        let mut stmt = conn.prepare(
            r"
            SELECT id, size_bytes FROM media
            WHERE data IS NOT NULL AND synced_at IS NOT NULL
            ORDER BY created_at ASC
            ",
        )?;
        let candidates = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let now = to_micros(Utc::now());
        let mut evicted = 0;
        for (id, size) in candidates {
            if used.saturating_add(needed) <= quota {
                break;
            }
            conn.execute(
                "UPDATE media SET data = NULL, evicted_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            used = used.saturating_sub(size.max(0) as u64);
            evicted += 1;
        }

        if used.saturating_add(needed) > quota {
            return Err(StoreError::StorageExhausted {
                requested: needed,
                available: quota.saturating_sub(used),
            });
        }

        Ok(evicted)
    }
}

impl LocalStore for SqliteStore {
    fn put_entry(&self, entry: &Entry) -> Result<Entry, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");

        let summary = entry
            .structured_summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let inserted = conn.execute(
            r"
            INSERT OR IGNORE INTO entries (
                id, subject_id, kind, created_at, original_text, structured_summary,
                media_ref, language, assisted_by, shared_with_doctor, doctor_reviewed,
                synced_at, deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ",
            params![
                entry.id,
                entry.subject_id,
                entry.kind.as_str(),
                to_micros(entry.created_at),
                entry.original_text,
                summary,
                entry.media_ref,
                entry.language,
                entry.assisted_by,
                entry.shared_with_doctor,
                entry.doctor_reviewed,
                entry.synced_at.map(to_micros),
                entry.deleted_at.map(to_micros),
            ],
        )?;

        if inserted == 0 {
            tracing::debug!("Entry {} already stored, keeping existing row", entry.id);
        } else {
            tracing::debug!("Saved entry {} to storage", entry.id);
        }

        Self::select_entry(&conn, &entry.id)?
            .ok_or_else(|| StoreError::NotFound(format!("entry {}", entry.id)))
    }

    fn get_entry(&self, id: &str) -> Result<Option<Entry>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        Self::select_entry(&conn, id)
    }

    fn entries_for_subject(&self, subject_id: &str) -> Result<Vec<Entry>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");

        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries
             WHERE subject_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at DESC, rowid DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![subject_id], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn mark_shared(&self, entry_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let changed = conn.execute(
            "UPDATE entries SET shared_with_doctor = 1 WHERE id = ?1",
            params![entry_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("entry {entry_id}")));
        }
        Ok(())
    }

    fn mark_reviewed(&self, entry_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let changed = conn.execute(
            "UPDATE entries SET doctor_reviewed = 1 WHERE id = ?1",
            params![entry_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("entry {entry_id}")));
        }
        Ok(())
    }

    fn tombstone_entry(&self, entry_id: &str, at: DateTime<Utc>) -> Result<Entry, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        conn.execute(
            "UPDATE entries SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![to_micros(at), entry_id],
        )?;
        Self::select_entry(&conn, entry_id)?
            .ok_or_else(|| StoreError::NotFound(format!("entry {entry_id}")))
    }

    fn put_media(&self, blob: &MediaBlob) -> Result<MediaBlob, StoreError> {
        let mut conn = self.conn.lock().expect("Lock failed");
        let tx = conn.transaction()?;

        if let Some(existing) = Self::select_media(&tx, &blob.id)? {
            return Ok(existing);
        }

        let mut evicted = 0;
        if let (Some(quota), Some(_)) = (self.quota_bytes, &blob.data) {
            evicted = Self::make_room(&tx, quota, blob.size_bytes)?;
        }

        tx.execute(
            r"
            INSERT INTO media (
                id, subject_id, mime_type, sha256, size_bytes, created_at, data,
                synced_at, user_deleted_at, evicted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                blob.id,
                blob.subject_id,
                blob.mime_type,
                blob.sha256,
                blob.size_bytes as i64,
                to_micros(blob.created_at),
                blob.data,
                blob.synced_at.map(to_micros),
                blob.user_deleted_at.map(to_micros),
                blob.evicted_at.map(to_micros),
            ],
        )?;

        let stored = Self::select_media(&tx, &blob.id)?
            .ok_or_else(|| StoreError::NotFound(format!("media {}", blob.id)))?;
        tx.commit()?;

        if evicted > 0 {
            tracing::info!("Evicted {} synced media blob(s) to make room", evicted);
        }
        tracing::debug!("Saved media {} ({} bytes)", stored.id, stored.size_bytes);
        Ok(stored)
    }

    fn get_media(&self, id: &str) -> Result<Option<MediaBlob>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        Self::select_media(&conn, id)
    }

    fn media_for_subject(&self, subject_id: &str) -> Result<Vec<MediaBlob>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let sql = format!(
            "SELECT {MEDIA_COLUMNS} FROM media WHERE subject_id = ?1 ORDER BY created_at DESC, rowid DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let blobs = stmt
            .query_map(params![subject_id], row_to_media)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(blobs)
    }

    fn request_media_deletion(&self, id: &str, at: DateTime<Utc>) -> Result<MediaBlob, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        conn.execute(
            "UPDATE media SET user_deleted_at = ?1 WHERE id = ?2 AND user_deleted_at IS NULL",
            params![to_micros(at), id],
        )?;
        Self::select_media(&conn, id)?.ok_or_else(|| StoreError::NotFound(format!("media {id}")))
    }

    fn collect_garbage(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let released = conn.execute(
            r"
            UPDATE media SET data = NULL
            WHERE data IS NOT NULL
              AND synced_at IS NOT NULL
              AND user_deleted_at IS NOT NULL
            ",
            [],
        )?;
        if released > 0 {
            tracing::info!("Released bytes of {} deleted media blob(s)", released);
        }
        Ok(released)
    }

    fn put_consent(&self, record: &ConsentRecord) -> Result<ConsentRecord, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");

        // Remote-origin records are already on the server.
        let synced_at = match record.origin {
            RecordOrigin::Remote => Some(to_micros(record.timestamp)),
            RecordOrigin::Local => None,
        };

        conn.execute(
            r"
            INSERT OR IGNORE INTO consents (
                id, subject_id, consent_type, granted, timestamp, assisted_by, origin, synced_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                record.id,
                record.subject_id,
                record.consent_type.as_str(),
                record.granted,
                to_micros(record.timestamp),
                record.assisted_by,
                record.origin.as_str(),
                synced_at,
            ],
        )?;

        Self::select_consent(&conn, &record.id)?
            .ok_or_else(|| StoreError::NotFound(format!("consent {}", record.id)))
    }

    fn consents_for(
        &self,
        subject_id: &str,
        consent_type: ConsentType,
    ) -> Result<Vec<ConsentRecord>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let sql = format!(
            "SELECT {CONSENT_COLUMNS} FROM consents
             WHERE subject_id = ?1 AND consent_type = ?2
             ORDER BY timestamp ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![subject_id, consent_type.as_str()], row_to_consent)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn consents_for_subject(&self, subject_id: &str) -> Result<Vec<ConsentRecord>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let sql = format!(
            "SELECT {CONSENT_COLUMNS} FROM consents
             WHERE subject_id = ?1
             ORDER BY timestamp ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![subject_id], row_to_consent)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn put_temporary_patient(&self, patient: &TemporaryPatient) -> Result<TemporaryPatient, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        conn.execute(
            r"
            INSERT OR IGNORE INTO temporary_patients (
                id, name, phone, age, gender, camp_name, created_by,
                linked_to, linked_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                patient.id,
                patient.name,
                patient.phone,
                patient.age.map(i64::from),
                patient.gender,
                patient.camp_name,
                patient.created_by,
                patient.linked_to,
                patient.linked_at.map(to_micros),
                to_micros(patient.created_at),
            ],
        )?;

        Self::select_temporary_patient(&conn, &patient.id)?
            .ok_or_else(|| StoreError::NotFound(format!("temporary patient {}", patient.id)))
    }

    fn get_temporary_patient(&self, id: &str) -> Result<Option<TemporaryPatient>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        Self::select_temporary_patient(&conn, id)
    }

    fn temporary_patients_by(&self, health_worker_id: &str) -> Result<Vec<TemporaryPatient>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let sql = format!(
            "SELECT {TEMP_PATIENT_COLUMNS} FROM temporary_patients
             WHERE created_by = ?1
             ORDER BY created_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let patients = stmt
            .query_map(params![health_worker_id], row_to_temporary_patient)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(patients)
    }

    fn link_temporary_patient(
        &self,
        temp_id: &str,
        permanent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<TemporaryPatient, StoreError> {
        let mut conn = self.conn.lock().expect("Lock failed");
        let tx = conn.transaction()?;

        let patient = Self::select_temporary_patient(&tx, temp_id)?
            .ok_or_else(|| StoreError::NotFound(format!("temporary patient {temp_id}")))?;

        match patient.linked_to.as_deref() {
            Some(existing) if existing == permanent_id => return Ok(patient),
            Some(_) => {
                return Err(StoreError::AlreadyLinked {
                    temp_id: temp_id.to_string(),
                })
            }
            None => {}
        }

        tx.execute(
            "UPDATE temporary_patients SET linked_to = ?1, linked_at = ?2 WHERE id = ?3",
            params![permanent_id, to_micros(at), temp_id],
        )?;
        let linked = Self::select_temporary_patient(&tx, temp_id)?
            .ok_or_else(|| StoreError::NotFound(format!("temporary patient {temp_id}")))?;
        tx.commit()?;

        tracing::info!("Linked temporary patient to permanent account");
        Ok(linked)
    }

    fn put_report(&self, report: &Report) -> Result<Report, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        conn.execute(
            r"
            INSERT OR IGNORE INTO reports (
                id, subject_id, file_name, file_type, file_size, uploaded_by,
                symptom_entry_id, media_ref, approved_for_sharing, approved_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                report.id,
                report.subject_id,
                report.file_name,
                report.file_type,
                i64::try_from(report.file_size).unwrap_or(i64::MAX),
                report.uploaded_by.as_str(),
                report.symptom_entry_id,
                report.media_ref,
                report.approved_for_sharing,
                report.approved_at.map(to_micros),
                to_micros(report.created_at),
            ],
        )?;

        Self::select_report(&conn, &report.id)?
            .ok_or_else(|| StoreError::NotFound(format!("report {}", report.id)))
    }

    fn get_report(&self, id: &str) -> Result<Option<Report>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        Self::select_report(&conn, id)
    }

    fn reports_for_subject(&self, subject_id: &str) -> Result<Vec<Report>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM reports
             WHERE subject_id = ?1
             ORDER BY created_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let reports = stmt
            .query_map(params![subject_id], row_to_report)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(reports)
    }

    fn approve_report(&self, id: &str, at: DateTime<Utc>) -> Result<Report, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let changed = conn.execute(
            r"
            UPDATE reports SET
                approved_for_sharing = 1,
                approved_at = COALESCE(approved_at, ?1)
            WHERE id = ?2
            ",
            params![to_micros(at), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("report {id}")));
        }
        Self::select_report(&conn, id)?.ok_or_else(|| StoreError::NotFound(format!("report {id}")))
    }

    fn enqueue(&self, item: &SyncQueueItem) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let inserted = conn.execute(
            r"
            INSERT OR IGNORE INTO sync_queue (
                local_id, entity_type, payload_ref, subject_id, operation,
                attempt_count, last_error, created_at, next_attempt_at, last_delay_ms, failed
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                item.local_id,
                item.entity_type.as_str(),
                item.payload_ref,
                item.subject_id,
                item.operation.as_str(),
                i64::from(item.attempt_count),
                item.last_error,
                to_micros(item.created_at),
                item.next_attempt_at.map(to_micros),
                item.last_delay_ms as i64,
                item.failed,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn queue_items(&self) -> Result<Vec<SyncQueueItem>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM sync_queue ORDER BY created_at ASC, seq ASC");
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map([], row_to_queue_item)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn queue_item(&self, local_id: &str) -> Result<Option<SyncQueueItem>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE local_id = ?1");
        Ok(conn.query_row(&sql, params![local_id], row_to_queue_item).optional()?)
    }

    fn record_attempt(&self, item: &SyncQueueItem) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let changed = conn.execute(
            r"
            UPDATE sync_queue SET
                attempt_count = ?1,
                last_error = ?2,
                next_attempt_at = ?3,
                last_delay_ms = ?4,
                failed = ?5
            WHERE local_id = ?6
            ",
            params![
                i64::from(item.attempt_count),
                item.last_error,
                item.next_attempt_at.map(to_micros),
                item.last_delay_ms as i64,
                item.failed,
                item.local_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("queue item {}", item.local_id)));
        }
        Ok(())
    }

    fn complete_sync(&self, item: &SyncQueueItem, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().expect("Lock failed");
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM sync_queue WHERE local_id = ?1", params![item.local_id])?;

        if item.operation == SyncOperation::Upsert {
            let sql = format!(
                "UPDATE {} SET synced_at = ?1 WHERE id = ?2 AND synced_at IS NULL",
                Self::table_for(item.entity_type)
            );
            tx.execute(&sql, params![to_micros(at), item.payload_ref])?;
        }

        tx.commit()?;
        Ok(())
    }

    fn reset_failed(&self, local_id: Option<&str>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let reset = match local_id {
            Some(id) => conn.execute(
                r"
                UPDATE sync_queue
                SET failed = 0, attempt_count = 0, next_attempt_at = NULL, last_delay_ms = 0
                WHERE failed = 1 AND local_id = ?1
                ",
                params![id],
            )?,
            None => conn.execute(
                r"
                UPDATE sync_queue
                SET failed = 0, attempt_count = 0, next_attempt_at = NULL, last_delay_ms = 0
                WHERE failed = 1
                ",
                [],
            )?,
        };
        Ok(reset)
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    fn orphaned_writes(&self) -> Result<Vec<SyncQueueItem>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        let mut stmt = conn.prepare(
            r"
            SELECT 'entry', id, subject_id, created_at FROM entries
                WHERE synced_at IS NULL AND id NOT IN (SELECT local_id FROM sync_queue)
            UNION ALL
            SELECT 'media', id, subject_id, created_at FROM media
                WHERE synced_at IS NULL AND id NOT IN (SELECT local_id FROM sync_queue)
            UNION ALL
            SELECT 'consent', id, subject_id, timestamp FROM consents
                WHERE synced_at IS NULL AND origin = 'local'
                  AND id NOT IN (SELECT local_id FROM sync_queue)
            UNION ALL
            SELECT 'temporary_patient', id, id, created_at FROM temporary_patients
                WHERE synced_at IS NULL AND id NOT IN (SELECT local_id FROM sync_queue)
            UNION ALL
            SELECT 'report', id, subject_id, created_at FROM reports
                WHERE synced_at IS NULL AND id NOT IN (SELECT local_id FROM sync_queue)
            ORDER BY 4 ASC
            ",
        )?;

        let items = stmt
            .query_map([], |row| {
                let entity_type: String = row.get(0)?;
                let entity_type = EntityType::parse(&entity_type)
                    .ok_or_else(|| corrupted(0, format!("unknown entity type {entity_type}")))?;
                let id: String = row.get(1)?;
                let subject_id: String = row.get(2)?;
                let created_at = from_micros(3, row.get(3)?)?;
                Ok(SyncQueueItem::upsert(entity_type, id, subject_id, created_at))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(items)
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        Ok(conn
            .query_row("SELECT value FROM sync_meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("Lock failed");
        conn.execute(
            r"
            INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
            params![key, value],
        )?;
        Ok(())
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

fn opt_from_micros(idx: usize, micros: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    micros.map(|m| from_micros(idx, m)).transpose()
}

fn corrupted(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(StoreError::Corrupted(msg)))
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let kind: String = row.get(2)?;
    let kind = EntryKind::parse(&kind).ok_or_else(|| corrupted(2, format!("unknown entry kind {kind}")))?;

    let summary: Option<String> = row.get(5)?;
    let structured_summary = summary
        .map(|s| serde_json::from_str::<StructuredSummary>(&s))
        .transpose()
        .map_err(|e| corrupted(5, e.to_string()))?;

    Ok(Entry {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        kind,
        created_at: from_micros(3, row.get(3)?)?,
        original_text: row.get(4)?,
        structured_summary,
        media_ref: row.get(6)?,
        language: row.get(7)?,
        assisted_by: row.get(8)?,
        shared_with_doctor: row.get(9)?,
        doctor_reviewed: row.get(10)?,
        synced_at: opt_from_micros(11, row.get(11)?)?,
        deleted_at: opt_from_micros(12, row.get(12)?)?,
    })
}

fn row_to_media(row: &Row<'_>) -> rusqlite::Result<MediaBlob> {
    let size: i64 = row.get(4)?;
    Ok(MediaBlob {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        mime_type: row.get(2)?,
        sha256: row.get(3)?,
        size_bytes: size.max(0) as u64,
        created_at: from_micros(5, row.get(5)?)?,
        data: row.get(6)?,
        synced_at: opt_from_micros(7, row.get(7)?)?,
        user_deleted_at: opt_from_micros(8, row.get(8)?)?,
        evicted_at: opt_from_micros(9, row.get(9)?)?,
    })
}

fn row_to_consent(row: &Row<'_>) -> rusqlite::Result<ConsentRecord> {
    let consent_type: String = row.get(2)?;
    let consent_type = ConsentType::parse(&consent_type)
        .ok_or_else(|| corrupted(2, format!("unknown consent type {consent_type}")))?;
    let origin: String = row.get(6)?;
    let origin =
        RecordOrigin::parse(&origin).ok_or_else(|| corrupted(6, format!("unknown origin {origin}")))?;

    Ok(ConsentRecord {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        consent_type,
        granted: row.get(3)?,
        timestamp: from_micros(4, row.get(4)?)?,
        assisted_by: row.get(5)?,
        origin,
    })
}

fn row_to_temporary_patient(row: &Row<'_>) -> rusqlite::Result<TemporaryPatient> {
    let age: Option<i64> = row.get(3)?;
    Ok(TemporaryPatient {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        age: age.and_then(|a| u16::try_from(a).ok()),
        gender: row.get(4)?,
        camp_name: row.get(5)?,
        created_by: row.get(6)?,
        linked_to: row.get(7)?,
        linked_at: opt_from_micros(8, row.get(8)?)?,
        created_at: from_micros(9, row.get(9)?)?,
    })
}

fn row_to_report(row: &Row<'_>) -> rusqlite::Result<Report> {
    let uploaded_by: String = row.get(5)?;
    let uploaded_by = ReportUploader::parse(&uploaded_by)
        .ok_or_else(|| corrupted(5, format!("unknown uploader {uploaded_by}")))?;
    let file_size: i64 = row.get(4)?;

    Ok(Report {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        file_name: row.get(2)?,
        file_type: row.get(3)?,
        file_size: file_size.max(0) as u64,
        uploaded_by,
        symptom_entry_id: row.get(6)?,
        media_ref: row.get(7)?,
        approved_for_sharing: row.get(8)?,
        approved_at: opt_from_micros(9, row.get(9)?)?,
        created_at: from_micros(10, row.get(10)?)?,
    })
}

fn row_to_queue_item(row: &Row<'_>) -> rusqlite::Result<SyncQueueItem> {
    let entity_type: String = row.get(1)?;
    let entity_type = EntityType::parse(&entity_type)
        .ok_or_else(|| corrupted(1, format!("unknown entity type {entity_type}")))?;
    let operation: String = row.get(4)?;
    let operation = SyncOperation::parse(&operation)
        .ok_or_else(|| corrupted(4, format!("unknown operation {operation}")))?;
    let attempts: i64 = row.get(5)?;
    let delay: i64 = row.get(9)?;

    Ok(SyncQueueItem {
        local_id: row.get(0)?,
        entity_type,
        payload_ref: row.get(2)?,
        subject_id: row.get(3)?,
        operation,
        attempt_count: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.get(6)?,
        created_at: from_micros(7, row.get(7)?)?,
        next_attempt_at: opt_from_micros(8, row.get(8)?)?,
        last_delay_ms: delay.max(0) as u64,
        failed: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StoredEntity;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).single().expect("valid")
    }

    fn entry(subject: &str, secs: i64, text: &str) -> Entry {
        Entry::new(subject, EntryKind::Manual, text, at(secs))
    }

    #[test]
    fn test_entry_crud() {
        let store = SqliteStore::in_memory().expect("Should create db");

        let first = entry("p1", 0, "cough");
        let second = entry("p1", 10, "fever");
        store.put_entry(&first).expect("Should save");
        store.put_entry(&second).expect("Should save");
        store.put_entry(&entry("p2", 5, "rash")).expect("Should save");

        let loaded = store.entries_for_subject("p1").expect("Should load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, second.id, "newest first");
        assert_eq!(loaded[1], first);

        store.tombstone_entry(&first.id, at(20)).expect("Should tombstone");
        let loaded = store.entries_for_subject("p1").expect("Should load");
        assert_eq!(loaded.len(), 1);

        // Tombstoned rows are still there.
        let kept = store.get_entry(&first.id).expect("Should load").expect("Should exist");
        assert_eq!(kept.deleted_at, Some(at(20)));
    }

    #[test]
    fn test_put_entry_is_idempotent() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let original = entry("p1", 0, "headache");
        store.put_entry(&original).expect("Should save");

        let mut changed = original.clone();
        changed.original_text = "rewritten".to_string();
        let stored = store.put_entry(&changed).expect("Should save");

        assert_eq!(stored.original_text, "headache");
        assert_eq!(store.entries_for_subject("p1").expect("Should load").len(), 1);
    }

    #[test]
    fn test_summary_roundtrip_and_flags() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let e = entry("p1", 0, "chest pain").with_summary(StructuredSummary {
            chief_complaint: "Chest pain".to_string(),
            symptom_timeline: "since morning".to_string(),
            severity: "severe".to_string(),
            past_history: Some("asthma".to_string()),
            additional_notes: None,
        });
        store.put_entry(&e).expect("Should save");

        store.mark_shared(&e.id).expect("Should flag");
        store.mark_shared(&e.id).expect("Flag flip is idempotent");
        store.mark_reviewed(&e.id).expect("Should flag");

        let loaded = store.get_entry(&e.id).expect("Should load").expect("Should exist");
        assert!(loaded.shared_with_doctor);
        assert!(loaded.doctor_reviewed);
        assert_eq!(loaded.structured_summary, e.structured_summary);

        assert!(matches!(store.mark_shared("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_quota_evicts_only_synced_media() {
        let store = SqliteStore::in_memory()
            .expect("Should create db")
            .with_quota(Some(10));

        let old = MediaBlob::new("p1", "audio/webm", vec![0; 6], at(0));
        store.put_media(&old).expect("Should save");

        // Old blob not synced yet: no room.
        let next = MediaBlob::new("p1", "audio/webm", vec![1; 6], at(10));
        let err = store.put_media(&next).expect_err("Should be exhausted");
        assert!(err.is_exhausted());
        assert!(store.get_media(&old.id).expect("load").expect("exists").is_resident());

        let item = SyncQueueItem::upsert(EntityType::Media, old.id.clone(), "p1", at(0));
        store.enqueue(&item).expect("Should enqueue");
        store.complete_sync(&item, at(5)).expect("Should complete");

        store.put_media(&next).expect("Should fit after eviction");
        let evicted = store.get_media(&old.id).expect("load").expect("exists");
        assert!(!evicted.is_resident());
        assert!(evicted.evicted_at.is_some());
        assert!(store.get_media(&next.id).expect("load").expect("exists").verify());
    }

    #[test]
    fn test_garbage_collection_requires_sync_and_deletion() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let blob = MediaBlob::new("p1", "image/png", vec![7; 4], at(0));
        store.put_media(&blob).expect("Should save");

        store.request_media_deletion(&blob.id, at(1)).expect("Should mark");
        assert_eq!(store.collect_garbage().expect("gc"), 0, "not synced yet");

        let item = SyncQueueItem::upsert(EntityType::Media, blob.id.clone(), "p1", at(0));
        store.enqueue(&item).expect("Should enqueue");
        store.complete_sync(&item, at(2)).expect("Should complete");

        assert_eq!(store.collect_garbage().expect("gc"), 1);
        assert!(!store.get_media(&blob.id).expect("load").expect("exists").is_resident());
    }

    #[test]
    fn test_consent_records_append_only() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let grant = ConsentRecord::grant("p1", ConsentType::DoctorSharing, at(0), Some("hw-1".into()));
        let revoke = ConsentRecord::revoke("p1", ConsentType::DoctorSharing, at(10));
        store.put_consent(&revoke).expect("Should save");
        store.put_consent(&grant).expect("Should save");
        store.put_consent(&grant).expect("Duplicate id ignored");

        let records = store
            .consents_for("p1", ConsentType::DoctorSharing)
            .expect("Should load");
        assert_eq!(records, vec![grant.clone(), revoke]);
        assert!(store.consents_for("p1", ConsentType::Recording).expect("load").is_empty());

        let all = store
            .get_all_for_subject("p1", EntityType::Consent)
            .expect("Should load");
        assert!(matches!(&all[1], StoredEntity::Consent(r) if r.id == grant.id));
    }

    #[test]
    fn test_queue_lifecycle() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let e = entry("p1", 0, "dizzy");
        store.put_entry(&e).expect("Should save");

        let item = SyncQueueItem::upsert(EntityType::Entry, e.id.clone(), "p1", e.created_at);
        assert!(store.enqueue(&item).expect("Should enqueue"));
        assert!(!store.enqueue(&item).expect("Idempotent"));
        assert_eq!(store.pending_count().expect("count"), 1);

        let mut attempted = item.clone();
        attempted.attempt_count = 5;
        attempted.failed = true;
        attempted.last_error = Some("offline".to_string());
        attempted.next_attempt_at = Some(at(0) + Duration::seconds(4));
        store.record_attempt(&attempted).expect("Should record");
        assert_eq!(store.queue_item(&item.local_id).expect("load"), Some(attempted));

        assert_eq!(store.reset_failed(None).expect("reset"), 1);
        let reset = store.queue_item(&item.local_id).expect("load").expect("exists");
        assert_eq!(reset.attempt_count, 0);
        assert!(!reset.failed);

        store.complete_sync(&reset, at(30)).expect("Should complete");
        assert_eq!(store.pending_count().expect("count"), 0);
        let synced = store.get_entry(&e.id).expect("load").expect("exists");
        assert_eq!(synced.synced_at, Some(at(30)));
    }

    #[test]
    fn test_orphaned_writes_are_found() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let queued = entry("p1", 0, "queued");
        let orphan = entry("p1", 5, "orphan");
        store.put_entry(&queued).expect("save");
        store.put_entry(&orphan).expect("save");
        store
            .enqueue(&SyncQueueItem::upsert(EntityType::Entry, queued.id.clone(), "p1", at(0)))
            .expect("enqueue");

        let mut remote = ConsentRecord::grant("p1", ConsentType::Recording, at(1), None);
        remote.origin = RecordOrigin::Remote;
        store.put_consent(&remote).expect("save");

        let orphans = store.orphaned_writes().expect("scan");
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].payload_ref, orphan.id);
    }

    #[test]
    fn test_temporary_patient_linking() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let patient = TemporaryPatient::new("Ravi", "hw-1", at(0)).at_camp("East camp");
        store.put_temporary_patient(&patient).expect("save");

        let linked = store
            .link_temporary_patient(&patient.id, "uid-9", at(10))
            .expect("link");
        assert_eq!(linked.linked_to.as_deref(), Some("uid-9"));

        // Same link again is a no-op, a different account is rejected.
        store.link_temporary_patient(&patient.id, "uid-9", at(11)).expect("relink");
        assert!(matches!(
            store.link_temporary_patient(&patient.id, "uid-7", at(12)),
            Err(StoreError::AlreadyLinked { .. })
        ));

        assert_eq!(store.temporary_patients_by("hw-1").expect("list").len(), 1);
        assert!(store.temporary_patients_by("hw-2").expect("list").is_empty());
    }

    #[test]
    fn test_report_approval_keeps_first_time() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let older = Report::new("p1", "xray.png", "image/png", ReportUploader::HealthWorker, at(0));
        let newer = Report::new("p1", "cbc.pdf", "application/pdf", ReportUploader::Patient, at(5));
        store.put_report(&older).expect("save");
        store.put_report(&newer).expect("save");
        store.put_report(&newer).expect("idempotent");

        let listed = store.reports_for_subject("p1").expect("list");
        assert_eq!(listed.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec![
            newer.id.as_str(),
            older.id.as_str()
        ]);
        assert!(listed.iter().all(|r| !r.approved_for_sharing));

        let approved = store.approve_report(&older.id, at(10)).expect("approve");
        assert!(approved.approved_for_sharing);
        assert_eq!(approved.approved_at, Some(at(10)));
        let again = store.approve_report(&older.id, at(20)).expect("approve again");
        assert_eq!(again.approved_at, Some(at(10)));

        assert!(matches!(
            store.approve_report("missing", at(30)),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.reports_for_subject("p2").expect("list").is_empty());
    }

    #[test]
    fn test_report_sync_is_stamped_and_orphans_found() {
        let store = SqliteStore::in_memory().expect("Should create db");
        let report = Report::new("p1", "cbc.pdf", "application/pdf", ReportUploader::Patient, at(0));
        store.put_report(&report).expect("save");

        let orphans = store.orphaned_writes().expect("scan");
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].entity_type, EntityType::Report);

        let item = SyncQueueItem::upsert(EntityType::Report, &report.id, "p1", at(0));
        store.enqueue(&item).expect("enqueue");
        store.complete_sync(&item, at(1)).expect("complete");
        assert!(store.orphaned_writes().expect("scan").is_empty());

        let all = store.get_all_for_subject("p1", EntityType::Report).expect("all");
        assert!(matches!(&all[0], StoredEntity::Report(r) if r.id == report.id));
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("carevista.db");

        let e = entry("p1", 0, "persisted");
        {
            let store = SqliteStore::new(&path).expect("open");
            store.put_entry(&e).expect("save");
            store.set_meta("consent_cursor", "42").expect("meta");
        }

        let store = SqliteStore::new(&path).expect("reopen");
        assert_eq!(store.get_entry(&e.id).expect("load"), Some(e));
        assert_eq!(store.get_meta("consent_cursor").expect("meta").as_deref(), Some("42"));
    }
}
