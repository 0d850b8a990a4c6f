//! Consent records and the rule that decides which one is current.
//!
//! Consent is an append-only audit trail. A revoke is a new record with
//! `granted = false`; nothing is ever updated in place. The current state of a
//! (subject, consent type) pair is the record with the latest timestamp, and on
//! equal timestamps a revoke beats a grant (fail closed).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{new_id, truncate_timestamp};

/// What the patient is consenting to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentType {
    /// Saving audio recordings of symptoms
    Recording,
    /// Transcribing and summarizing recordings
    Transcription,
    /// Showing logbook and intake data to a doctor
    DoctorSharing,
}

impl ConsentType {
    pub const ALL: [ConsentType; 3] = [Self::Recording, Self::Transcription, Self::DoctorSharing];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Transcription => "transcription",
            Self::DoctorSharing => "doctor_sharing",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "recording" => Some(Self::Recording),
            "transcription" => Some(Self::Transcription),
            "doctor_sharing" => Some(Self::DoctorSharing),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConsentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record was first written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// Appended on this device
    Local,
    /// Pulled from the remote ledger during reconciliation
    Remote,
}

impl RecordOrigin {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "remote" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// A single grant or revoke event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: String,
    pub subject_id: String,
    pub consent_type: ConsentType,
    pub granted: bool,
    pub timestamp: DateTime<Utc>,
    /// Health worker who captured the consent on the patient's behalf
    pub assisted_by: Option<String>,
    #[serde(default = "default_origin")]
    pub origin: RecordOrigin,
}

fn default_origin() -> RecordOrigin {
    RecordOrigin::Remote
}

impl ConsentRecord {
    /// Create a grant record.
    #[must_use]
    pub fn grant(
        subject_id: impl Into<String>,
        consent_type: ConsentType,
        timestamp: DateTime<Utc>,
        assisted_by: Option<String>,
    ) -> Self {
        Self {
            id: new_id(),
            subject_id: subject_id.into(),
            consent_type,
            granted: true,
            timestamp: truncate_timestamp(timestamp),
            assisted_by,
            origin: RecordOrigin::Local,
        }
    }

    /// Create a revoke record.
    #[must_use]
    pub fn revoke(
        subject_id: impl Into<String>,
        consent_type: ConsentType,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            subject_id: subject_id.into(),
            consent_type,
            granted: false,
            timestamp: truncate_timestamp(timestamp),
            assisted_by: None,
            origin: RecordOrigin::Local,
        }
    }

    /// Whether this record takes precedence over `other` for the same pair.
    #[must_use]
    pub fn supersedes(&self, other: &ConsentRecord) -> bool {
        match self.timestamp.cmp(&other.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => !self.granted && other.granted,
        }
    }

    /// Whether both records describe the same (subject, type) pair.
    #[must_use]
    pub fn same_pair(&self, other: &ConsentRecord) -> bool {
        self.subject_id == other.subject_id && self.consent_type == other.consent_type
    }
}

/// Derived view of one (subject, consent type) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsentSnapshot {
    /// The record currently in effect
    pub latest: Option<ConsentRecord>,
    /// Whether any grant has ever been recorded for the pair
    pub ever_granted: bool,
}

impl ConsentSnapshot {
    /// Fold a record set into a snapshot.
    #[must_use]
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ConsentRecord>) -> Self {
        let mut snapshot = Self::default();
        for record in records {
            snapshot.absorb(record);
        }
        snapshot
    }

    /// Merge one more record into the snapshot.
    pub fn absorb(&mut self, record: &ConsentRecord) {
        self.ever_granted |= record.granted;
        let replace = match &self.latest {
            Some(current) => record.supersedes(current),
            None => true,
        };
        if replace {
            self.latest = Some(record.clone());
        }
    }

    /// Whether consent is currently in effect.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        self.latest.as_ref().is_some_and(|r| r.granted)
    }

    #[must_use]
    pub fn state(&self) -> ConsentState {
        match &self.latest {
            Some(record) if record.granted => ConsentState::Granted,
            Some(_) if self.ever_granted => ConsentState::Revoked,
            _ => ConsentState::NeverGranted,
        }
    }
}

/// Three-way consent answer used by the visibility gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentState {
    NeverGranted,
    Granted,
    Revoked,
}

/// Notification pushed to ledger subscribers whenever a pair may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentChange {
    pub subject_id: String,
    pub consent_type: ConsentType,
    pub granted: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<&ConsentRecord> for ConsentChange {
    fn from(record: &ConsentRecord) -> Self {
        Self {
            subject_id: record.subject_id.clone(),
            consent_type: record.consent_type,
            granted: record.granted,
            timestamp: record.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).single().expect("valid")
    }

    #[test]
    fn test_latest_timestamp_wins() {
        let grant = ConsentRecord::grant("p1", ConsentType::DoctorSharing, at(0), None);
        let revoke = ConsentRecord::revoke("p1", ConsentType::DoctorSharing, at(10));
        let regrant = ConsentRecord::grant("p1", ConsentType::DoctorSharing, at(20), None);

        let snapshot = ConsentSnapshot::from_records([&grant, &revoke]);
        assert_eq!(snapshot.state(), ConsentState::Revoked);

        let snapshot = ConsentSnapshot::from_records([&regrant, &grant, &revoke]);
        assert_eq!(snapshot.state(), ConsentState::Granted);
    }

    #[test]
    fn test_equal_timestamps_fail_closed() {
        let grant = ConsentRecord::grant("p1", ConsentType::DoctorSharing, at(5), None);
        let revoke = ConsentRecord::revoke("p1", ConsentType::DoctorSharing, at(5));

        // Order of arrival must not matter.
        assert!(!ConsentSnapshot::from_records([&grant, &revoke]).is_granted());
        assert!(!ConsentSnapshot::from_records([&revoke, &grant]).is_granted());
    }

    #[test]
    fn test_revoke_without_grant_is_never_granted() {
        let revoke = ConsentRecord::revoke("p1", ConsentType::Recording, at(1));
        let snapshot = ConsentSnapshot::from_records([&revoke]);
        assert_eq!(snapshot.state(), ConsentState::NeverGranted);
        assert_eq!(ConsentSnapshot::default().state(), ConsentState::NeverGranted);
    }

    #[test]
    fn test_consent_type_roundtrip() {
        for t in ConsentType::ALL {
            assert_eq!(ConsentType::parse(t.as_str()), Some(t));
        }
        let json = serde_json::to_string(&ConsentType::DoctorSharing).expect("serialize");
        assert_eq!(json, "\"doctor_sharing\"");
    }
}
