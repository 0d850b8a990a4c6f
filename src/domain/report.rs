//! Medical reports uploaded by a patient or a health worker.
//!
//! A report is a file (lab result, scan, prescription) attached to a subject.
//! Doctors only see it once the patient has approved it for sharing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{new_id, truncate_timestamp};

/// Who uploaded the report file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportUploader {
    Patient,
    HealthWorker,
}

impl ReportUploader {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::HealthWorker => "health_worker",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "patient" => Some(Self::Patient),
            "health_worker" => Some(Self::HealthWorker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub subject_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub uploaded_by: ReportUploader,
    /// Symptom entry the report belongs to, if any
    pub symptom_entry_id: Option<String>,
    /// Media blob holding the file bytes
    pub media_ref: Option<String>,
    pub approved_for_sharing: bool,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Report {
    #[must_use]
    pub fn new(
        subject_id: impl Into<String>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        uploaded_by: ReportUploader,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            subject_id: subject_id.into(),
            file_name: file_name.into(),
            file_type: file_type.into(),
            file_size: 0,
            uploaded_by,
            symptom_entry_id: None,
            media_ref: None,
            approved_for_sharing: false,
            approved_at: None,
            created_at: truncate_timestamp(created_at),
        }
    }

    #[must_use]
    pub fn for_entry(mut self, entry_id: impl Into<String>) -> Self {
        self.symptom_entry_id = Some(entry_id.into());
        self
    }

    /// # Errors
    /// Returns the list of problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.subject_id.trim().is_empty() {
            errors.push("Report must belong to a subject".to_string());
        }
        if self.file_name.trim().is_empty() {
            errors.push("File name must not be empty".to_string());
        }
        if self.file_type.trim().is_empty() {
            errors.push("File type must not be empty".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
