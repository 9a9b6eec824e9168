use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use magpie_core::circuit_breaker::BreakerStats;
use magpie_core::error::Violation;
use magpie_core::job::{JobRequest, ScrapeJob, SelectorConfig, ValidationRules};
use magpie_core::metrics::MetricsSnapshot;
use magpie_core::rate_limit::RateLimitPolicy;
use magpie_core::record::ScrapedRecord;
use magpie_core::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Job submission
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SubmitJobRequest {
    /// Listing page to scrape (https only)
    pub url: String,
    /// Institution class, e.g. "us_university"
    pub institution: String,
    /// Limiter/breaker key for an individually rate-limited institution
    pub instance_key: Option<String>,
    pub selector: SelectorConfigDto,
    pub rate_limit: Option<RateLimitDto>,
    pub retry: Option<RetryDto>,
    pub validation: Option<ValidationRulesDto>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SelectorConfigDto {
    pub item_selector: String,
    /// Record field name -> selector within one item
    pub fields: HashMap<String, String>,
    pub next_page_selector: Option<String>,
}

impl From<SelectorConfigDto> for SelectorConfig {
    fn from(dto: SelectorConfigDto) -> Self {
        Self {
            item_selector: dto.item_selector,
            fields: dto.fields,
            next_page_selector: dto.next_page_selector,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RateLimitDto {
    /// Tokens added per second
    pub refill_rate: f64,
    pub burst_capacity: f64,
    /// Cooldown after provider throttling, in seconds
    pub cooldown_secs: Option<u64>,
}

impl From<RateLimitDto> for RateLimitPolicy {
    fn from(dto: RateLimitDto) -> Self {
        let mut policy = RateLimitPolicy::new(dto.refill_rate, dto.burst_capacity);
        if let Some(secs) = dto.cooldown_secs {
            policy = policy.with_cooldown(Duration::from_secs(secs));
        }
        policy
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RetryDto {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub max_backoff_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
}

impl From<RetryDto> for RetryPolicy {
    fn from(dto: RetryDto) -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: dto.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: dto
                .initial_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            backoff_multiplier: dto.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
            max_backoff: dto
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            jitter: dto
                .jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.jitter),
            max_parse_retries: defaults.max_parse_retries,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ValidationRulesDto {
    pub required_fields: Vec<String>,
    pub max_field_len: Option<usize>,
}

impl From<ValidationRulesDto> for ValidationRules {
    fn from(dto: ValidationRulesDto) -> Self {
        let defaults = ValidationRules::default();
        Self {
            required_fields: dto.required_fields,
            max_field_len: dto.max_field_len.unwrap_or(defaults.max_field_len),
        }
    }
}

impl From<SubmitJobRequest> for JobRequest {
    fn from(dto: SubmitJobRequest) -> Self {
        Self {
            url: dto.url,
            institution: dto.institution,
            instance_key: dto.instance_key,
            selector: dto.selector.into(),
            rate_limit: dto.rate_limit.map(Into::into),
            retry: dto.retry.map(Into::into),
            validation: dto.validation.map(Into::into),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobLinks {
    #[serde(rename = "self")]
    pub self_link: String,
    pub results: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    /// Always "scheduled": admission is fire-and-forget
    pub status: String,
    #[serde(rename = "_links")]
    pub links: JobLinks,
}

// ---------------------------------------------------------------------------
// Job status & cancellation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobErrorDto {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobStatusResponse {
    pub id: Uuid,
    pub url: String,
    pub institution: String,
    pub status: String,
    pub retry_count: u32,
    pub last_error: Option<JobErrorDto>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pages_fetched: u32,
    pub records_stored: u64,
    pub records_dropped: u64,
}

impl From<ScrapeJob> for JobStatusResponse {
    fn from(job: ScrapeJob) -> Self {
        Self {
            id: job.id,
            url: job.url,
            institution: job.institution.to_string(),
            status: job.status.to_string(),
            retry_count: job.retry_count,
            last_error: job.last_error.map(|e| JobErrorDto {
                kind: e.kind,
                message: e.message,
            }),
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            pages_fetched: job.pages_fetched,
            records_stored: job.records_stored,
            records_dropped: job.records_dropped,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CancelJobResponse {
    pub job_id: Uuid,
    /// Status after the cancellation request took effect
    pub status: String,
}

// ---------------------------------------------------------------------------
// Results & pagination
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ResultsQuery {
    /// 1-based page number
    pub page: Option<u32>,
    /// Page size, clamped server-side
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RecordResponse {
    pub title: String,
    pub description: String,
    pub institution: String,
    pub category: Option<String>,
    pub country: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_job_id: Uuid,
}

impl From<ScrapedRecord> for RecordResponse {
    fn from(record: ScrapedRecord) -> Self {
        Self {
            title: record.title,
            description: record.description,
            institution: record.institution.to_string(),
            category: record.category,
            country: record.country,
            discovered_at: record.discovered_at,
            updated_at: record.updated_at,
            source_job_id: record.source_job_id,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PaginationMeta {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub pages: u64,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ResultsResponse {
    pub data: Vec<RecordResponse>,
    pub pagination: PaginationMeta,
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct BreakerDto {
    pub key: String,
    pub state: String,
    pub consecutive_failures: u32,
}

impl From<BreakerStats> for BreakerDto {
    fn from(stats: BreakerStats) -> Self {
        Self {
            key: stats.key,
            state: stats.state.to_string(),
            consecutive_failures: stats.consecutive_failures,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct MetricsResponse {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub active_jobs: i64,
    pub requests_total: u64,
    pub rate_limit_hits: u64,
    pub breaker_transitions: u64,
    pub breaker_opens: u64,
    pub errors_by_kind: HashMap<String, u64>,
    pub breakers: Vec<BreakerDto>,
}

impl MetricsResponse {
    pub fn new(snapshot: MetricsSnapshot, breakers: Vec<BreakerStats>) -> Self {
        Self {
            jobs_submitted: snapshot.jobs_submitted,
            jobs_completed: snapshot.jobs_completed,
            jobs_failed: snapshot.jobs_failed,
            jobs_cancelled: snapshot.jobs_cancelled,
            active_jobs: snapshot.active_jobs,
            requests_total: snapshot.requests_total,
            rate_limit_hits: snapshot.rate_limit_hits,
            breaker_transitions: snapshot.breaker_transitions,
            breaker_opens: snapshot.breaker_opens,
            errors_by_kind: snapshot.errors_by_kind,
            breakers: breakers.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pending_jobs: i64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ViolationDto {
    pub field: String,
    pub message: String,
}

impl From<Violation> for ViolationDto {
    fn from(v: Violation) -> Self {
        Self {
            field: v.field,
            message: v.message,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    /// Every violated rule, on validation failures
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub violations: Vec<ViolationDto>,
}
