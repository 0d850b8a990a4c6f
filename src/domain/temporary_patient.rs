//! Temporary patients registered by health workers at rural camps.
//!
//! A temporary id lets a health worker capture symptoms and consent for
//! someone without an account. It is linked once to a permanent account
//! later; linking never drops records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{new_id, truncate_timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryPatient {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub age: Option<u16>,
    pub gender: Option<String>,
    pub camp_name: Option<String>,
    /// Health worker who registered the patient
    pub created_by: String,
    pub linked_to: Option<String>,
    pub linked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TemporaryPatient {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        created_by: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("temp-{}", new_id()),
            name: name.into(),
            phone: None,
            age: None,
            gender: None,
            camp_name: None,
            created_by: created_by.into(),
            linked_to: None,
            linked_at: None,
            created_at: truncate_timestamp(created_at),
        }
    }

    #[must_use]
    pub fn at_camp(mut self, camp_name: impl Into<String>) -> Self {
        self.camp_name = Some(camp_name.into());
        self
    }

    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    #[must_use]
    pub fn with_age(mut self, age: u16) -> Self {
        self.age = Some(age);
        self
    }

    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.linked_to.is_some()
    }

    /// # Errors
    /// Returns the list of problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("Name must not be empty".to_string());
        }
        if self.created_by.trim().is_empty() {
            errors.push("Registering health worker must be known".to_string());
        }
        if let Some(age) = self.age {
            if age > 130 {
                errors.push(format!("Age {age} out of range [0, 130]"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
