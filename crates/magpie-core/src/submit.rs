//! Job submission and validation gate.
//!
//! Admission is fire-and-forget: a valid request creates a `pending` job
//! and returns its id immediately, without waiting for execution. An
//! invalid request reports **every** violated rule, not just the first,
//! so callers can fix all issues in one round trip.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use url::Url;
use uuid::Uuid;

use crate::error::{AppError, ValidationFailure};
use crate::institution::InstitutionType;
use crate::job::{JobRequest, JobStatus, ScrapeJob};
use crate::job_queue::JobQueue;
use crate::metrics::PipelineMetrics;
use crate::retry::RetryPolicy;

/// System-wide bounds every submission must fall within.
#[derive(Debug, Clone)]
pub struct SubmissionLimits {
    pub max_retry_attempts: u32,
    pub max_backoff: Duration,
    pub max_refill_rate: f64,
    pub max_burst_capacity: f64,
    pub max_cooldown: Duration,
}

impl Default for SubmissionLimits {
    fn default() -> Self {
        Self {
            max_retry_attempts: 10,
            max_backoff: Duration::from_secs(3600),
            max_refill_rate: 10.0,
            max_burst_capacity: 100.0,
            max_cooldown: Duration::from_secs(3600),
        }
    }
}

/// Validation gate in front of the job queue.
#[derive(Clone)]
pub struct JobSubmitter<Q: JobQueue> {
    queue: Q,
    limits: SubmissionLimits,
    metrics: Arc<PipelineMetrics>,
}

impl<Q: JobQueue> JobSubmitter<Q> {
    pub fn new(queue: Q, limits: SubmissionLimits, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            queue,
            limits,
            metrics,
        }
    }

    /// Validate `request` and admit it as a `pending` job.
    pub async fn submit(&self, request: JobRequest) -> Result<ScrapeJob, AppError> {
        let institution = self.validate(&request)?;

        let now = Utc::now();
        let job = ScrapeJob {
            id: Uuid::new_v4(),
            url: request.url,
            institution,
            instance_key: request.instance_key,
            selector: request.selector,
            rate_limit: request.rate_limit,
            retry: request.retry.unwrap_or_default(),
            validation: request.validation.unwrap_or_default(),
            status: JobStatus::Pending,
            retry_count: 0,
            last_error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            worker_id: None,
            pages_fetched: 0,
            records_stored: 0,
            records_dropped: 0,
        };

        self.queue.insert_job(job.clone()).await?;
        self.metrics.job_submitted();
        tracing::info!(job_id = %job.id, url = %job.url, institution = %job.institution, "Job admitted");
        Ok(job)
    }

    /// Check every rule, collecting all violations.
    fn validate(&self, request: &JobRequest) -> Result<InstitutionType, AppError> {
        let mut failure = ValidationFailure::default();

        match Url::parse(&request.url) {
            Ok(url) if url.scheme() != "https" => {
                failure.push("url", "only https URLs are accepted");
            }
            Ok(url) if url.host_str().is_none() => {
                failure.push("url", "URL has no host");
            }
            Ok(_) => {}
            Err(e) => failure.push("url", format!("malformed URL: {e}")),
        }

        let institution = match InstitutionType::from_str(&request.institution) {
            Ok(ty) => Some(ty),
            Err(_) => {
                let known = InstitutionType::ALL
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                failure.push(
                    "institution",
                    format!("'{}' is not one of: {known}", request.institution),
                );
                None
            }
        };

        if let Some(retry) = &request.retry {
            self.check_retry(retry, &mut failure);
        }

        if let Some(rate) = &request.rate_limit {
            if !(rate.refill_rate > 0.0) {
                failure.push("rate_limit.refill_rate", "must be greater than 0");
            } else if rate.refill_rate > self.limits.max_refill_rate {
                failure.push(
                    "rate_limit.refill_rate",
                    format!("exceeds ceiling of {}/s", self.limits.max_refill_rate),
                );
            }
            if rate.burst_capacity < 1.0 {
                failure.push("rate_limit.burst_capacity", "must be at least 1");
            } else if rate.burst_capacity > self.limits.max_burst_capacity {
                failure.push(
                    "rate_limit.burst_capacity",
                    format!("exceeds ceiling of {}", self.limits.max_burst_capacity),
                );
            }
            if rate.cooldown > self.limits.max_cooldown {
                failure.push(
                    "rate_limit.cooldown",
                    format!("exceeds ceiling of {}s", self.limits.max_cooldown.as_secs()),
                );
            }
        }

        if request.selector.item_selector.trim().is_empty() {
            failure.push("selector.item_selector", "must not be empty");
        }
        let required = request
            .validation
            .clone()
            .unwrap_or_default()
            .required_fields;
        if required.is_empty() {
            failure.push("validation.required_fields", "must name at least one field");
        }
        for field in &required {
            match request.selector.fields.get(field) {
                Some(sel) if !sel.trim().is_empty() => {}
                Some(_) => failure.push(
                    format!("selector.fields.{field}"),
                    "selector for required field is empty",
                ),
                None => failure.push(
                    format!("selector.fields.{field}"),
                    "required field has no selector",
                ),
            }
        }

        if !failure.is_empty() {
            return Err(AppError::Validation(failure));
        }
        // Institution parsed or a violation was recorded above.
        Ok(institution.expect("validated"))
    }

    fn check_retry(&self, retry: &RetryPolicy, failure: &mut ValidationFailure) {
        if retry.max_attempts > self.limits.max_retry_attempts {
            failure.push(
                "retry.max_attempts",
                format!("exceeds ceiling of {}", self.limits.max_retry_attempts),
            );
        }
        if retry.backoff_multiplier < 1.0 {
            failure.push("retry.backoff_multiplier", "must be at least 1.0");
        }
        if retry.max_backoff > self.limits.max_backoff {
            failure.push(
                "retry.max_backoff",
                format!("exceeds ceiling of {}s", self.limits.max_backoff.as_secs()),
            );
        }
        if retry.initial_delay > retry.max_backoff {
            failure.push("retry.initial_delay", "exceeds max_backoff");
        }
    }
}
