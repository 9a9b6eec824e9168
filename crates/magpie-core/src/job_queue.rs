use std::future::Future;

use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobError, JobStatus, ScrapeJob};

/// Job queue for the fetch pipeline.
///
/// Implementations must make `claim_job` safe against double-claims: at
/// most one worker owns a job at a time.
pub trait JobQueue: Send + Sync + Clone {
    /// Admit a validated job in `pending` state.
    fn insert_job(&self, job: ScrapeJob) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Atomically claim the oldest eligible pending job.
    ///
    /// Returns `None` if no jobs are available.
    fn claim_job(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<ScrapeJob>, AppError>> + Send;

    /// Mark a running job completed and persist its final counters.
    /// Clears `last_error`.
    fn complete_job(
        &self,
        job_id: Uuid,
        pages_fetched: u32,
        records_stored: u64,
        records_dropped: u64,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Mark a running job permanently failed with its final error.
    fn fail_job(
        &self,
        job_id: Uuid,
        error: &JobError,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Persist per-attempt bookkeeping while the job stays `running`:
    /// the new retry count and the error that triggered the retry.
    fn record_attempt(
        &self,
        job_id: Uuid,
        retry_count: u32,
        error: &JobError,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Request cancellation. Pending jobs cancel immediately; running
    /// jobs get the cooperative intent flag set; terminal jobs are left
    /// unchanged (idempotent). Returns the job's status after the call.
    fn cancel_job(&self, job_id: Uuid) -> impl Future<Output = Result<JobStatus, AppError>> + Send;

    /// Whether cancellation has been requested for a job.
    fn cancel_requested(&self, job_id: Uuid)
    -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Transition a running job to `cancelled` (worker honoring the
    /// intent flag between attempts).
    fn mark_cancelled(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<ScrapeJob>, AppError>> + Send;

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ScrapeJob>, AppError>> + Send;

    fn count_by_status(
        &self,
        status: JobStatus,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;

    /// Release all jobs held by a worker (graceful shutdown); released
    /// jobs return to `pending` with their retry counts intact.
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}
