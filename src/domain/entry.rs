//! Symptom logbook entries and the media blobs they reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{new_id, truncate_timestamp};

/// How an entry was authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Typed by the patient or an assisting health worker
    Manual,
    /// Spoken, with the recording attached as a media blob
    Voice,
    /// Collected through the symptom chatbot
    Chatbot,
}

impl EntryKind {
    /// Stable storage representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Voice => "voice",
            Self::Chatbot => "chatbot",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "voice" => Some(Self::Voice),
            "chatbot" => Some(Self::Chatbot),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured summary of a symptom narrative.
///
/// The summary only restates what the patient reported; it never contains
/// a diagnosis. When summarization failed the entry carries no summary and
/// consumers fall back to the original text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredSummary {
    pub chief_complaint: String,
    pub symptom_timeline: String,
    pub severity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub past_history: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_notes: Option<String>,
}

impl StructuredSummary {
    /// Render the summary as a single readable line.
    #[must_use]
    pub fn to_plain_text(&self) -> String {
        let mut parts = Vec::new();
        if !self.chief_complaint.is_empty() {
            parts.push(format!("Main problem: {}", self.chief_complaint));
        }
        if !self.symptom_timeline.is_empty() {
            parts.push(format!("Timeline: {}", self.symptom_timeline));
        }
        if !self.severity.is_empty() {
            parts.push(format!("Severity: {}", self.severity));
        }
        if let Some(history) = &self.past_history {
            parts.push(format!("Past history: {history}"));
        }
        parts.join(". ")
    }
}

/// A symptom/logbook record authored on the device.
///
/// Content fields are immutable once stored. Only the two sharing flags and
/// the sync bookkeeping (`synced_at`, `deleted_at`) change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier, also the sync idempotency key
    pub id: String,

    /// Patient (or temporary patient) the entry belongs to
    pub subject_id: String,

    pub kind: EntryKind,

    pub created_at: DateTime<Utc>,

    /// Patient's own words (transcript for voice entries)
    pub original_text: String,

    pub structured_summary: Option<StructuredSummary>,

    /// Reference to a `MediaBlob` holding the recording or image
    pub media_ref: Option<String>,

    /// Language the entry was authored in
    pub language: String,

    /// Health worker who assisted the capture, if any
    pub assisted_by: Option<String>,

    pub shared_with_doctor: bool,

    pub doctor_reviewed: bool,

    /// When the remote endpoint acknowledged the entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,

    /// Tombstone marker; entries are never erased
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entry {
    /// Create a new entry for a subject.
    #[must_use]
    pub fn new(
        subject_id: impl Into<String>,
        kind: EntryKind,
        original_text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            subject_id: subject_id.into(),
            kind,
            created_at: truncate_timestamp(created_at),
            original_text: original_text.into(),
            structured_summary: None,
            media_ref: None,
            language: "english".to_string(),
            assisted_by: None,
            shared_with_doctor: false,
            doctor_reviewed: false,
            synced_at: None,
            deleted_at: None,
        }
    }

    #[must_use]
    pub fn with_summary(mut self, summary: StructuredSummary) -> Self {
        self.structured_summary = Some(summary);
        self
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    #[must_use]
    pub fn assisted_by(mut self, health_worker_id: impl Into<String>) -> Self {
        self.assisted_by = Some(health_worker_id.into());
        self
    }

    #[must_use]
    pub fn with_media(mut self, media_id: impl Into<String>) -> Self {
        self.media_ref = Some(media_id.into());
        self
    }

    /// Whether the entry has been tombstoned.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Text shown to a reader: the summary when present, else the raw text.
    #[must_use]
    pub fn display_text(&self) -> String {
        match &self.structured_summary {
            Some(summary) => summary.to_plain_text(),
            None => self.original_text.clone(),
        }
    }

    /// Validate an entry before it is stored.
    ///
    /// # Errors
    /// Returns the list of problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("Entry id must not be empty".to_string());
        }
        if self.subject_id.trim().is_empty() {
            errors.push("Subject id must not be empty".to_string());
        }
        if self.original_text.trim().is_empty() && self.media_ref.is_none() {
            errors.push("Entry needs either text or an attached recording".to_string());
        }
        if self.deleted_at.is_some() {
            errors.push("Cannot store an entry that is already tombstoned".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Raw audio/image bytes owned by the entry that references them.
///
/// `data` is `None` once the bytes were evicted under storage pressure
/// (only possible after upload) or garbage-collected after the user deleted
/// them. Metadata is never removed.
#[derive(Clone, PartialEq)]
pub struct MediaBlob {
    pub id: String,
    pub subject_id: String,
    pub mime_type: String,
    /// Hex SHA-256 of the original bytes
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub data: Option<Vec<u8>>,
    pub synced_at: Option<DateTime<Utc>>,
    pub user_deleted_at: Option<DateTime<Utc>>,
    pub evicted_at: Option<DateTime<Utc>>,
}

impl MediaBlob {
    /// Wrap freshly captured bytes.
    #[must_use]
    pub fn new(
        subject_id: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            subject_id: subject_id.into(),
            mime_type: mime_type.into(),
            sha256: sha256_hex(&data),
            size_bytes: data.len() as u64,
            created_at: truncate_timestamp(created_at),
            data: Some(data),
            synced_at: None,
            user_deleted_at: None,
            evicted_at: None,
        }
    }

    /// Whether the bytes are still held locally.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.data.is_some()
    }

    /// Verify the resident bytes against the recorded checksum.
    #[must_use]
    pub fn verify(&self) -> bool {
        match &self.data {
            Some(bytes) => sha256_hex(bytes) == self.sha256,
            None => false,
        }
    }
}

// Bytes are patient recordings; keep them out of logs.
impl std::fmt::Debug for MediaBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBlob")
            .field("id", &self.id)
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.size_bytes)
            .field("resident", &self.is_resident())
            .field("synced", &self.synced_at.is_some())
            .finish_non_exhaustive()
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> StructuredSummary {
        StructuredSummary {
            chief_complaint: "Fever".to_string(),
            symptom_timeline: "3 days".to_string(),
            severity: "moderate".to_string(),
            past_history: None,
            additional_notes: None,
        }
    }

    #[test]
    fn test_display_text_prefers_summary() {
        let entry = Entry::new("patient-1", EntryKind::Manual, "hot and tired", Utc::now());
        assert_eq!(entry.display_text(), "hot and tired");

        let entry = entry.with_summary(summary());
        assert_eq!(
            entry.display_text(),
            "Main problem: Fever. Timeline: 3 days. Severity: moderate"
        );
    }

    #[test]
    fn test_validation() {
        let valid = Entry::new("patient-1", EntryKind::Manual, "headache", Utc::now());
        assert!(valid.validate().is_ok());

        let invalid = Entry::new("", EntryKind::Voice, "  ", Utc::now());
        let errors = invalid.validate().expect_err("should be invalid");
        assert!(errors.len() >= 2);
    }

    #[test]
    fn test_media_checksum_and_debug() {
        let blob = MediaBlob::new("patient-1", "audio/webm", vec![1, 2, 3], Utc::now());
        assert!(blob.verify());
        assert_eq!(blob.size_bytes, 3);

        let debug = format!("{blob:?}");
        assert!(!debug.contains("[1, 2, 3]"));
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [EntryKind::Manual, EntryKind::Voice, EntryKind::Chatbot] {
            assert_eq!(EntryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EntryKind::parse("video"), None);
    }
}
