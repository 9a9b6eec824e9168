use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::institution::InstitutionType;
use crate::job::ValidationRules;

/// Fields extracted for one listing by the parse collaborator, before
/// per-record validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl RecordDraft {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "title" => Some(&self.title),
            "description" => Some(&self.description),
            "category" => self.category.as_deref(),
            "country" => self.country.as_deref(),
            _ => None,
        }
    }

    /// Check the draft against the job's validation rules. Returns the
    /// reason a failing record is dropped.
    pub fn validate(&self, rules: &ValidationRules) -> Result<(), String> {
        for required in &rules.required_fields {
            match self.field(required) {
                Some(value) if !value.trim().is_empty() => {}
                Some(_) => return Err(format!("required field '{required}' is empty")),
                None => return Err(format!("required field '{required}' is missing")),
            }
        }
        for (name, value) in [
            ("title", Some(self.title.as_str())),
            ("description", Some(self.description.as_str())),
            ("category", self.category.as_deref()),
            ("country", self.country.as_deref()),
        ] {
            if let Some(value) = value
                && value.len() > rules.max_field_len
            {
                return Err(format!(
                    "field '{name}' exceeds {} bytes",
                    rules.max_field_len
                ));
            }
        }
        Ok(())
    }
}

/// One extracted technology-transfer listing. Immutable once stored;
/// later re-scrapes supersede it via upsert on `natural_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedRecord {
    /// Stable dedup key: SHA-256 of source URL + title.
    pub natural_key: String,
    pub title: String,
    pub description: String,
    pub institution: InstitutionType,
    pub category: Option<String>,
    pub country: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_job_id: Uuid,
}

impl ScrapedRecord {
    pub fn from_draft(
        draft: RecordDraft,
        source_url: &str,
        institution: InstitutionType,
        source_job_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            natural_key: natural_key(source_url, &draft.title),
            title: draft.title,
            description: draft.description,
            institution,
            category: draft.category,
            country: draft.country,
            discovered_at: now,
            updated_at: now,
            source_job_id,
        }
    }
}

/// Stable record identity across re-scrapes: SHA-256 over source URL and
/// title, as 64-char hex.
pub fn natural_key(source_url: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(title.as_bytes());
    format!("{:x}", hasher.finalize())
}
