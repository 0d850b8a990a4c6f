//! Sync queue bookkeeping and the status contract exposed to the UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::truncate_timestamp;

/// Kind of entity a queue item refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Entry,
    Media,
    Consent,
    TemporaryPatient,
    Report,
}

impl EntityType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Media => "media",
            Self::Consent => "consent",
            Self::TemporaryPatient => "temporary_patient",
            Self::Report => "report",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(Self::Entry),
            "media" => Some(Self::Media),
            "consent" => Some(Self::Consent),
            "temporary_patient" => Some(Self::TemporaryPatient),
            "report" => Some(Self::Report),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the remote side should do with the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    /// Create or replace the entity
    Upsert,
    /// Mark the entity deleted
    Tombstone,
    /// Attach a temporary patient to a permanent account
    Link,
    /// Patient approved a report for sharing with doctors
    Approve,
}

impl SyncOperation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Tombstone => "tombstone",
            Self::Link => "link",
            Self::Approve => "approve",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upsert" => Some(Self::Upsert),
            "tombstone" => Some(Self::Tombstone),
            "link" => Some(Self::Link),
            "approve" => Some(Self::Approve),
            _ => None,
        }
    }
}

/// A local write that the remote endpoint has not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Idempotency key sent with every attempt
    pub local_id: String,
    pub entity_type: EntityType,
    /// Id of the entity in the local store
    pub payload_ref: String,
    /// Subject the entity belongs to
    pub subject_id: String,
    pub operation: SyncOperation,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Earliest time the next attempt may run
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Delay applied after the previous failure, in milliseconds
    pub last_delay_ms: u64,
    /// Max attempts reached; kept for manual retry
    pub failed: bool,
}

impl SyncQueueItem {
    fn new(
        local_id: String,
        entity_type: EntityType,
        payload_ref: impl Into<String>,
        subject_id: impl Into<String>,
        operation: SyncOperation,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id,
            entity_type,
            payload_ref: payload_ref.into(),
            subject_id: subject_id.into(),
            operation,
            attempt_count: 0,
            last_error: None,
            created_at: truncate_timestamp(created_at),
            next_attempt_at: None,
            last_delay_ms: 0,
            failed: false,
        }
    }

    /// Queue item for a freshly written entity. The entity id is the key.
    #[must_use]
    pub fn upsert(
        entity_type: EntityType,
        payload_ref: impl Into<String>,
        subject_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let payload_ref = payload_ref.into();
        Self::new(
            payload_ref.clone(),
            entity_type,
            payload_ref,
            subject_id,
            SyncOperation::Upsert,
            created_at,
        )
    }

    /// Queue item propagating a tombstone.
    #[must_use]
    pub fn tombstone(
        entity_type: EntityType,
        payload_ref: impl Into<String>,
        subject_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let payload_ref = payload_ref.into();
        Self::new(
            format!("{payload_ref}:tombstone"),
            entity_type,
            payload_ref,
            subject_id,
            SyncOperation::Tombstone,
            created_at,
        )
    }

    /// Queue item linking a temporary patient to a permanent account.
    #[must_use]
    pub fn link(temp_id: impl Into<String>, permanent_id: &str, created_at: DateTime<Utc>) -> Self {
        let temp_id = temp_id.into();
        Self::new(
            format!("{temp_id}:link:{permanent_id}"),
            EntityType::TemporaryPatient,
            temp_id.clone(),
            temp_id,
            SyncOperation::Link,
            created_at,
        )
    }

    /// Queue item propagating a report sharing approval.
    #[must_use]
    pub fn approve(
        report_id: impl Into<String>,
        subject_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let report_id = report_id.into();
        Self::new(
            format!("{report_id}:approve"),
            EntityType::Report,
            report_id,
            subject_id,
            SyncOperation::Approve,
            created_at,
        )
    }

    /// Whether the item may be attempted at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.failed && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// What is sent to the remote endpoint for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub local_id: String,
    pub entity_type: EntityType,
    pub operation: SyncOperation,
    pub subject_id: String,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// A queue item surfaced to the UI as an error badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncErrorReport {
    pub local_id: String,
    pub entity_type: EntityType,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

/// Aggregate sync state for status indicators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_syncing: bool,
    /// Every unacknowledged item, including permanently failed ones
    pub pending_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Items that reached the attempt limit
    pub errors: Vec<SyncErrorReport>,
    /// Most recent failure message across the queue
    pub last_error: Option<String>,
}

impl SyncStatus {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
