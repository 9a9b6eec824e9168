use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::institution::InstitutionType;
use crate::rate_limit::RateLimitPolicy;
use crate::retry::RetryPolicy;

/// Status of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are final; no further transitions are permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {s}")),
        }
    }
}

/// Structured error recorded on a job: stable kind label plus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

impl From<&AppError> for JobError {
    fn from(err: &AppError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Selectors the parse collaborator applies to a fetched document.
///
/// `item_selector` locates the listing collection; `fields` maps record
/// field names to per-item selectors; `next_page_selector`, when present,
/// locates the link to the next remote page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub item_selector: String,
    pub fields: HashMap<String, String>,
    #[serde(default)]
    pub next_page_selector: Option<String>,
}

/// Per-record validation applied to extracted fields. Records failing
/// validation are dropped (and counted), never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRules {
    /// Fields that must be present and non-empty on every record.
    pub required_fields: Vec<String>,
    /// Upper bound on any single field's length.
    #[serde(default = "default_max_field_len")]
    pub max_field_len: usize,
}

fn default_max_field_len() -> usize {
    4096
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            required_fields: vec!["title".to_string()],
            max_field_len: default_max_field_len(),
        }
    }
}

/// One scraping request: a single URL/institution, owned exclusively by
/// the job state machine once admitted. External callers read it or
/// request cancellation; they never mutate it.
#[derive(Debug, Clone)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub url: String,
    pub institution: InstitutionType,
    /// Limiter/breaker key for an individually-configured institution.
    /// When unset the institution type is the key.
    pub instance_key: Option<String>,
    pub selector: SelectorConfig,
    /// Per-key rate-limit override; replaces the type profile for this
    /// job's key.
    pub rate_limit: Option<RateLimitPolicy>,
    pub retry: RetryPolicy,
    pub validation: ValidationRules,
    pub status: JobStatus,
    /// Retry attempts consumed so far; never exceeds `retry.max_attempts`.
    pub retry_count: u32,
    /// Set on each failed attempt, cleared on success.
    pub last_error: Option<JobError>,
    /// Cooperative cancellation intent; the worker honors it between
    /// attempts, never mid-fetch.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub pages_fetched: u32,
    pub records_stored: u64,
    pub records_dropped: u64,
}

impl ScrapeJob {
    /// Key under which this job's rate limiter and circuit breaker state live.
    pub fn limiter_key(&self) -> String {
        self.instance_key
            .clone()
            .unwrap_or_else(|| self.institution.as_str().to_string())
    }
}

/// Unvalidated submission payload, as received from a caller. The
/// submission gate turns this into a `ScrapeJob` or a validation failure.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub url: String,
    /// Institution type as submitted; parsed and checked by the gate.
    pub institution: String,
    pub instance_key: Option<String>,
    pub selector: SelectorConfig,
    pub rate_limit: Option<RateLimitPolicy>,
    pub retry: Option<RetryPolicy>,
    pub validation: Option<ValidationRules>,
}

impl JobRequest {
    pub fn new(url: impl Into<String>, institution: impl Into<String>, selector: SelectorConfig) -> Self {
        Self {
            url: url.into(),
            institution: institution.into(),
            instance_key: None,
            selector,
            rate_limit: None,
            retry: None,
            validation: None,
        }
    }

    pub fn with_instance_key(mut self, key: impl Into<String>) -> Self {
        self.instance_key = Some(key.into());
        self
    }

    pub fn with_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_validation(mut self, rules: ValidationRules) -> Self {
        self.validation = Some(rules);
        self
    }
}

/// Configuration for a worker in the pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    /// Guard against unbounded remote pagination.
    pub max_pages_per_job: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            poll_interval: Duration::from_secs(5),
            max_pages_per_job: 50,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
