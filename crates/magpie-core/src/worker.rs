//! Worker loop driving the job state machine.
//!
//! Each worker claims pending jobs and runs them to a terminal state.
//! Within `running`, every attempt goes circuit breaker first (so open
//! rejections never consume rate-limit budget), then rate limiter (a
//! denial is an admission delay, not a failure), then the fetch/parse
//! collaborators. Retries sleep inside the worker; the job never returns
//! to `pending` between attempts. Cancellation is cooperative and only
//! honored between attempts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::circuit_breaker::{Admission, CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::error::AppError;
use crate::job::{JobError, ScrapeJob, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::metrics::PipelineMetrics;
use crate::rate_limit::{Acquire, KeyedRateLimiter, RateLimitProfiles};
use crate::record::ScrapedRecord;
use crate::retry::RetryDecision;
use crate::store::ResultStore;
use crate::traits::{Fetcher, Parser};

/// Floor on admission-delay sleeps so a near-empty bucket cannot busy-spin.
const MIN_ADMISSION_WAIT: Duration = Duration::from_millis(10);

/// Bounds how many jobs run concurrently for one limiter key.
pub struct KeyedConcurrency {
    permits_per_key: usize,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl KeyedConcurrency {
    pub fn new(permits_per_key: usize) -> Self {
        Self {
            permits_per_key: permits_per_key.max(1),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a slot for `key`, waiting while the key is saturated.
    pub async fn acquire(&self, key: &str) -> OwnedSemaphorePermit {
        let semaphore = {
            let mut semaphores = self.semaphores.lock().unwrap_or_else(|p| p.into_inner());
            semaphores
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.permits_per_key)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .expect("keyed concurrency semaphore is never closed")
    }
}

/// Shared pipeline infrastructure, constructed once at process start and
/// handed to every worker by handle.
#[derive(Clone)]
pub struct PipelineContext {
    pub rate_limiter: Arc<KeyedRateLimiter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub metrics: Arc<PipelineMetrics>,
    pub concurrency: Arc<KeyedConcurrency>,
}

impl PipelineContext {
    pub fn new(
        profiles: RateLimitProfiles,
        breaker_config: CircuitBreakerConfig,
        max_concurrency_per_key: usize,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(breaker_config));
        breakers.subscribe(metrics.clone());
        Self {
            rate_limiter: Arc::new(KeyedRateLimiter::new(profiles)),
            breakers,
            metrics,
            concurrency: Arc::new(KeyedConcurrency::new(max_concurrency_per_key)),
        }
    }
}

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling,
    JobClaimed {
        job: &'a ScrapeJob,
    },
    AttemptStarted {
        job_id: Uuid,
        url: &'a str,
        attempt: u32,
    },
    RateLimitWait {
        job_id: Uuid,
        key: &'a str,
        wait: Duration,
    },
    PageStored {
        job_id: Uuid,
        page: u32,
        stored: u64,
        dropped: u64,
    },
    JobRetrying {
        job_id: Uuid,
        error: &'a str,
        attempt: u32,
        delay: Duration,
    },
    JobCompleted {
        job_id: Uuid,
        pages: u32,
        records: u64,
    },
    JobFailed {
        job_id: Uuid,
        error: &'a str,
    },
    JobCancelled {
        job_id: Uuid,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::debug!("Polling for jobs");
            }
            WorkerEvent::JobClaimed { job } => {
                tracing::info!(job_id = %job.id, url = %job.url, "Job claimed");
            }
            WorkerEvent::AttemptStarted {
                job_id,
                url,
                attempt,
            } => {
                tracing::info!(%job_id, %url, attempt, "Fetching");
            }
            WorkerEvent::RateLimitWait { job_id, key, wait } => {
                tracing::debug!(%job_id, key, wait_ms = wait.as_millis() as u64, "Waiting for rate limiter");
            }
            WorkerEvent::PageStored {
                job_id,
                page,
                stored,
                dropped,
            } => {
                tracing::info!(%job_id, page, stored, dropped, "Page processed");
            }
            WorkerEvent::JobRetrying {
                job_id,
                error,
                attempt,
                delay,
            } => {
                tracing::warn!(%job_id, %error, attempt, delay_ms = delay.as_millis() as u64, "Retrying after failure");
            }
            WorkerEvent::JobCompleted {
                job_id,
                pages,
                records,
            } => {
                tracing::info!(%job_id, pages, records, "Job completed");
            }
            WorkerEvent::JobFailed { job_id, error } => {
                tracing::warn!(%job_id, %error, "Job failed");
            }
            WorkerEvent::JobCancelled { job_id } => {
                tracing::info!(%job_id, "Job cancelled");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// How an attempt-failure was resolved.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    /// Retry scheduled; run the next attempt.
    Continue,
    /// Job reached a terminal state or the worker is shutting down.
    Stop,
}

/// Worker that polls the job queue and drives scrape jobs through the
/// fetch pipeline.
pub struct WorkerService<Q, F, P, S>
where
    Q: JobQueue,
    F: Fetcher,
    P: Parser,
    S: ResultStore,
{
    queue: Q,
    fetcher: F,
    parser: P,
    store: S,
    ctx: PipelineContext,
    config: WorkerConfig,
}

impl<Q, F, P, S> WorkerService<Q, F, P, S>
where
    Q: JobQueue,
    F: Fetcher,
    P: Parser,
    S: ResultStore,
{
    pub fn new(
        queue: Q,
        fetcher: F,
        parser: P,
        store: S,
        ctx: PipelineContext,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            fetcher,
            parser,
            store,
            ctx,
            config,
        }
    }

    /// Run the worker loop until cancellation.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling);

            match self.queue.claim_job(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    reporter.report(WorkerEvent::JobClaimed { job: &job });
                    // The job id doubles as the correlation id on every
                    // log line below this span.
                    let span =
                        tracing::info_span!("job", job_id = %job.id, key = %job.limiter_key());
                    self.process_job(job, reporter, &cancel_token)
                        .instrument(span)
                        .await;
                }
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Graceful shutdown: release claimed jobs back to pending.
        let released = self
            .queue
            .release_worker_jobs(&self.config.worker_id)
            .await
            .unwrap_or(0);

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Drive one claimed job to a terminal state (or release it on
    /// worker shutdown).
    async fn process_job<WR: WorkerReporter>(
        &self,
        job: ScrapeJob,
        reporter: &WR,
        cancel_token: &CancellationToken,
    ) {
        let key = job.limiter_key();
        if let Some(policy) = &job.rate_limit {
            self.ctx.rate_limiter.configure_key(&key, policy.clone());
        }

        // Per-key concurrency bound; held for the whole job.
        let _permit = self.ctx.concurrency.acquire(&key).await;
        self.ctx.metrics.job_started();

        let mut current_url = job.url.clone();
        let mut retry_count = job.retry_count;
        let mut pages = 0u32;
        let mut records_stored = 0u64;
        let mut records_dropped = 0u64;

        loop {
            // Cooperative cancellation, checked between attempts only.
            if self.queue.cancel_requested(job.id).await.unwrap_or(false) {
                let _ = self.queue.mark_cancelled(job.id).await;
                self.ctx.metrics.job_cancelled();
                reporter.report(WorkerEvent::JobCancelled { job_id: job.id });
                return;
            }

            // Breaker before limiter: open rejections must not consume tokens.
            if let Admission::Rejected { retry_after } = self.ctx.breakers.before_call(&key) {
                let err = AppError::CircuitOpen {
                    key: key.clone(),
                    retry_after,
                };
                match self
                    .handle_failure(&job, &mut retry_count, err, reporter, cancel_token)
                    .await
                {
                    Flow::Continue => continue,
                    Flow::Stop => return,
                }
            }

            // Limiter admission: waiting here consumes no attempt.
            match self.ctx.rate_limiter.acquire(&key, job.institution) {
                Acquire::Denied { retry_after } => {
                    self.ctx.metrics.rate_limit_hit();
                    reporter.report(WorkerEvent::RateLimitWait {
                        job_id: job.id,
                        key: &key,
                        wait: retry_after,
                    });
                    if self
                        .wait(retry_after.max(MIN_ADMISSION_WAIT), cancel_token)
                        .await
                    {
                        self.ctx.metrics.job_released();
                        return;
                    }
                    continue;
                }
                Acquire::Granted => {}
            }

            reporter.report(WorkerEvent::AttemptStarted {
                job_id: job.id,
                url: &current_url,
                attempt: retry_count,
            });
            self.ctx.metrics.request_sent();

            let outcome = match self.fetcher.fetch(&current_url).await {
                Ok(body) => {
                    self.ctx.breakers.on_result(&key, true);
                    self.parser.parse(&body, &job.selector)
                }
                Err(e) => {
                    // A response that merely displeased us still proves the
                    // endpoint is reachable.
                    self.ctx.breakers.on_result(&key, !e.should_trip_circuit());
                    if let AppError::RateLimited { retry_after } = &e {
                        self.ctx.rate_limiter.impose_cooldown(&key, *retry_after);
                    }
                    Err(e)
                }
            };

            let parsed = match outcome {
                Ok(parsed) => parsed,
                Err(e) => {
                    match self
                        .handle_failure(&job, &mut retry_count, e, reporter, cancel_token)
                        .await
                    {
                        Flow::Continue => continue,
                        Flow::Stop => return,
                    }
                }
            };

            // Per-record validation: failing records are dropped and
            // counted, the job keeps going.
            let mut batch = Vec::with_capacity(parsed.records.len());
            for draft in parsed.records {
                match draft.validate(&job.validation) {
                    Ok(()) => batch.push(ScrapedRecord::from_draft(
                        draft,
                        &job.url,
                        job.institution,
                        job.id,
                    )),
                    Err(reason) => {
                        records_dropped += 1;
                        self.ctx.metrics.record_error("validation");
                        tracing::warn!(%reason, "Dropping record failing validation");
                    }
                }
            }
            for reason in &parsed.errors {
                records_dropped += 1;
                tracing::warn!(%reason, "Parser could not extract record");
            }

            if !batch.is_empty() {
                match self.store.append(job.id, batch).await {
                    Ok(n) => records_stored += n,
                    Err(e) => {
                        match self
                            .handle_failure(&job, &mut retry_count, e, reporter, cancel_token)
                            .await
                        {
                            Flow::Continue => continue,
                            Flow::Stop => return,
                        }
                    }
                }
            }

            pages += 1;
            reporter.report(WorkerEvent::PageStored {
                job_id: job.id,
                page: pages,
                stored: records_stored,
                dropped: records_dropped,
            });

            match parsed.next_page {
                Some(next) if pages < self.config.max_pages_per_job => {
                    current_url = next;
                    continue;
                }
                Some(_) => {
                    tracing::warn!(
                        cap = self.config.max_pages_per_job,
                        "Remote pagination cap reached, completing early"
                    );
                }
                None => {}
            }

            // A cancellation that arrived during the final fetch still wins
            // over completion; stored records are retained.
            if self.queue.cancel_requested(job.id).await.unwrap_or(false) {
                let _ = self.queue.mark_cancelled(job.id).await;
                self.ctx.metrics.job_cancelled();
                reporter.report(WorkerEvent::JobCancelled { job_id: job.id });
                return;
            }

            // Source exhausted. Partial results from earlier pages were
            // already committed; completion clears last_error.
            if let Err(e) = self
                .queue
                .complete_job(job.id, pages, records_stored, records_dropped)
                .await
            {
                tracing::error!(error = %e, "Failed to mark job completed");
            }
            self.ctx.metrics.job_completed();
            reporter.report(WorkerEvent::JobCompleted {
                job_id: job.id,
                pages,
                records: records_stored,
            });
            return;
        }
    }

    /// Run one failed attempt through the retry controller and act on the
    /// decision.
    async fn handle_failure<WR: WorkerReporter>(
        &self,
        job: &ScrapeJob,
        retry_count: &mut u32,
        error: AppError,
        reporter: &WR,
        cancel_token: &CancellationToken,
    ) -> Flow {
        self.ctx.metrics.record_error(error.kind());
        let job_error = JobError::from(&error);

        match job.retry.decide(*retry_count, &error) {
            RetryDecision::Retry { after } => {
                *retry_count += 1;
                if let Err(e) = self
                    .queue
                    .record_attempt(job.id, *retry_count, &job_error)
                    .await
                {
                    tracing::error!(error = %e, "Failed to record attempt");
                }
                reporter.report(WorkerEvent::JobRetrying {
                    job_id: job.id,
                    error: &job_error.message,
                    attempt: *retry_count,
                    delay: after,
                });
                if self.wait(after, cancel_token).await {
                    // Worker shutdown mid-backoff; the job is released by
                    // the run loop and keeps its retry count.
                    self.ctx.metrics.job_released();
                    return Flow::Stop;
                }
                Flow::Continue
            }
            RetryDecision::GiveUp => {
                if let Err(e) = self.queue.fail_job(job.id, &job_error).await {
                    tracing::error!(error = %e, "Failed to mark job as failed");
                }
                self.ctx.metrics.job_failed();
                reporter.report(WorkerEvent::JobFailed {
                    job_id: job.id,
                    error: &job_error.message,
                });
                Flow::Stop
            }
        }
    }

    /// Sleep unless the worker is shutting down. Returns true on shutdown.
    async fn wait(&self, duration: Duration, cancel_token: &CancellationToken) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => false,
            () = cancel_token.cancelled() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::job::JobStatus;
    use crate::memory::{InMemoryJobQueue, InMemoryResultStore};
    use crate::rate_limit::RateLimitPolicy;
    use crate::retry::RetryPolicy;
    use crate::store::ResultStore;
    use crate::testutil::{
        MockFetcher, MockParser, MockReporter, make_test_job, outcome_with_records,
    };

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_millis(10),
            jitter: Duration::ZERO,
            max_parse_retries: max_attempts,
        }
    }

    fn context() -> PipelineContext {
        PipelineContext::new(
            crate::rate_limit::RateLimitProfiles::default(),
            CircuitBreakerConfig {
                failure_threshold: 5,
                reset_timeout: Duration::from_secs(60),
            },
            2,
        )
    }

    fn service(
        queue: InMemoryJobQueue,
        fetcher: MockFetcher,
        parser: MockParser,
        store: InMemoryResultStore,
        ctx: PipelineContext,
    ) -> WorkerService<InMemoryJobQueue, MockFetcher, MockParser, InMemoryResultStore> {
        WorkerService::new(
            queue,
            fetcher,
            parser,
            store,
            ctx,
            WorkerConfig::default().with_worker_id("test-worker"),
        )
    }

    async fn claim(queue: &InMemoryJobQueue) -> ScrapeJob {
        queue.claim_job("test-worker").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn completes_job_and_stores_records() {
        let queue = InMemoryJobQueue::new();
        let store = InMemoryResultStore::new();
        let mut job = make_test_job();
        job.retry = fast_retry(3);
        queue.insert_job(job.clone()).await.unwrap();

        let fetcher = MockFetcher::new("<doc>listings</doc>");
        let parser = MockParser::with_outcomes(vec![Ok(outcome_with_records(&["A", "B"], None))]);
        let svc = service(queue.clone(), fetcher, parser, store.clone(), context());

        let claimed = claim(&queue).await;
        svc.process_job(claimed, &MockReporter::new(), &CancellationToken::new())
            .await;

        let done = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.records_stored, 2);
        assert_eq!(done.retry_count, 0);
        assert!(done.last_error.is_none());
        assert_eq!(store.total(job.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn follows_remote_pagination_until_exhausted() {
        let queue = InMemoryJobQueue::new();
        let store = InMemoryResultStore::new();
        let mut job = make_test_job();
        job.retry = fast_retry(3);
        queue.insert_job(job.clone()).await.unwrap();

        let fetcher = MockFetcher::with_responses(vec![
            Ok("page one".into()),
            Ok("page two".into()),
        ]);
        let parser = MockParser::with_outcomes(vec![
            Ok(outcome_with_records(
                &["A"],
                Some("https://tto.example.edu/listings?page=2"),
            )),
            Ok(outcome_with_records(&["B"], None)),
        ]);
        let svc = service(queue.clone(), fetcher.clone(), parser, store.clone(), context());

        let claimed = claim(&queue).await;
        svc.process_job(claimed, &MockReporter::new(), &CancellationToken::new())
            .await;

        let done = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.pages_fetched, 2);
        assert_eq!(done.records_stored, 2);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_complete() {
        let queue = InMemoryJobQueue::new();
        let store = InMemoryResultStore::new();
        let mut job = make_test_job();
        job.retry = fast_retry(5);
        queue.insert_job(job.clone()).await.unwrap();

        let fetcher = MockFetcher::with_responses(vec![
            Err(AppError::ConnectionReset("peer".into())),
            Err(AppError::ConnectionReset("peer".into())),
            Err(AppError::ConnectionReset("peer".into())),
            Ok("finally".into()),
        ]);
        let parser = MockParser::with_outcomes(vec![Ok(outcome_with_records(&["A"], None))]);
        let svc = service(queue.clone(), fetcher, parser, store, context());

        let claimed = claim(&queue).await;
        svc.process_job(claimed, &MockReporter::new(), &CancellationToken::new())
            .await;

        let done = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.retry_count, 3);
        assert!(done.last_error.is_none(), "success clears last_error");
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_the_job() {
        let queue = InMemoryJobQueue::new();
        let mut job = make_test_job();
        job.retry = fast_retry(2);
        queue.insert_job(job.clone()).await.unwrap();

        let fetcher = MockFetcher::with_responses(vec![
            Err(AppError::Timeout(30)),
            Err(AppError::Timeout(30)),
            Err(AppError::Timeout(30)),
        ]);
        let parser = MockParser::never_called();
        let svc = service(queue.clone(), fetcher, parser, InMemoryResultStore::new(), context());

        let claimed = claim(&queue).await;
        svc.process_job(claimed, &MockReporter::new(), &CancellationToken::new())
            .await;

        let done = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.retry_count, 2, "retry_count never exceeds max_attempts");
        assert_eq!(done.last_error.as_ref().unwrap().kind, "timeout");
    }

    #[tokio::test]
    async fn security_error_fails_without_retry() {
        let queue = InMemoryJobQueue::new();
        let mut job = make_test_job();
        job.retry = fast_retry(5);
        queue.insert_job(job.clone()).await.unwrap();

        let fetcher =
            MockFetcher::with_responses(vec![Err(AppError::Security("encrypted pdf".into()))]);
        let svc = service(
            queue.clone(),
            fetcher.clone(),
            MockParser::never_called(),
            InMemoryResultStore::new(),
            context(),
        );

        let claimed = claim(&queue).await;
        svc.process_job(claimed, &MockReporter::new(), &CancellationToken::new())
            .await;

        let done = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.retry_count, 0, "terminal errors consume no retries");
        assert_eq!(done.last_error.as_ref().unwrap().kind, "security");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn breaker_opens_and_rejects_without_network_attempt() {
        let queue = InMemoryJobQueue::new();
        let mut job = make_test_job();
        job.retry = fast_retry(5);
        queue.insert_job(job.clone()).await.unwrap();

        // Five timeouts trip the threshold-5 breaker; the sixth attempt is
        // rejected before any fetch.
        let fetcher = MockFetcher::with_responses(vec![
            Err(AppError::Timeout(30)),
            Err(AppError::Timeout(30)),
            Err(AppError::Timeout(30)),
            Err(AppError::Timeout(30)),
            Err(AppError::Timeout(30)),
        ]);
        let ctx = context();
        let svc = service(
            queue.clone(),
            fetcher.clone(),
            MockParser::never_called(),
            InMemoryResultStore::new(),
            ctx.clone(),
        );

        let claimed = claim(&queue).await;
        svc.process_job(claimed, &MockReporter::new(), &CancellationToken::new())
            .await;

        let done = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.last_error.as_ref().unwrap().kind, "circuit_open");
        assert_eq!(fetcher.calls(), 5, "rejected attempt must not hit the network");
        assert_eq!(ctx.breakers.state("us_university"), CircuitState::Open);
    }

    #[tokio::test]
    async fn cancel_request_is_honored_between_attempts() {
        let queue = InMemoryJobQueue::new();
        let mut job = make_test_job();
        job.retry = fast_retry(5);
        queue.insert_job(job.clone()).await.unwrap();

        let claimed = claim(&queue).await;
        // Intent arrives while the job is running.
        queue.cancel_job(job.id).await.unwrap();

        let fetcher = MockFetcher::new("never fetched");
        let svc = service(
            queue.clone(),
            fetcher.clone(),
            MockParser::never_called(),
            InMemoryResultStore::new(),
            context(),
        );
        svc.process_job(claimed, &MockReporter::new(), &CancellationToken::new())
            .await;

        let done = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_records_dropped_without_failing_the_job() {
        let queue = InMemoryJobQueue::new();
        let store = InMemoryResultStore::new();
        let mut job = make_test_job();
        job.retry = fast_retry(3);
        queue.insert_job(job.clone()).await.unwrap();

        let mut outcome = outcome_with_records(&["Valid listing", ""], None);
        outcome.errors.push("item 7: missing title node".into());
        let parser = MockParser::with_outcomes(vec![Ok(outcome)]);
        let svc = service(
            queue.clone(),
            MockFetcher::new("doc"),
            parser,
            store.clone(),
            context(),
        );

        let claimed = claim(&queue).await;
        svc.process_job(claimed, &MockReporter::new(), &CancellationToken::new())
            .await;

        let done = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.records_stored, 1);
        assert_eq!(done.records_dropped, 2);
        assert_eq!(store.total(job.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rate_limit_denial_waits_without_consuming_attempts() {
        let queue = InMemoryJobQueue::new();
        let mut job = make_test_job();
        job.retry = fast_retry(1);
        // Burst of one with a fast refill: the second acquire within the
        // job (none here) would wait, but the first must too after the
        // bucket is drained externally.
        job.rate_limit = Some(RateLimitPolicy::new(20.0, 1.0));
        queue.insert_job(job.clone()).await.unwrap();

        let ctx = context();
        ctx.rate_limiter
            .configure_key("us_university", RateLimitPolicy::new(20.0, 1.0));
        // Drain the only token.
        assert!(
            ctx.rate_limiter
                .acquire("us_university", job.institution)
                .is_granted()
        );

        let parser = MockParser::with_outcomes(vec![Ok(outcome_with_records(&["A"], None))]);
        let svc = service(
            queue.clone(),
            MockFetcher::new("doc"),
            parser,
            InMemoryResultStore::new(),
            ctx.clone(),
        );

        let claimed = claim(&queue).await;
        svc.process_job(claimed, &MockReporter::new(), &CancellationToken::new())
            .await;

        let done = queue.get_job(job.id).await.unwrap().unwrap();
        // The admission delay did not consume the single retry attempt.
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.retry_count, 0);
        assert!(ctx.metrics.snapshot().rate_limit_hits >= 1);
    }

    #[tokio::test]
    async fn run_loop_claims_processes_and_shuts_down() {
        let queue = InMemoryJobQueue::new();
        let store = InMemoryResultStore::new();
        let mut job = make_test_job();
        job.retry = fast_retry(3);
        queue.insert_job(job.clone()).await.unwrap();

        let parser = MockParser::with_outcomes(vec![Ok(outcome_with_records(&["A"], None))]);
        let svc = service(
            queue.clone(),
            MockFetcher::new("doc"),
            parser,
            store,
            context(),
        );

        let cancel = CancellationToken::new();
        let reporter = MockReporter::new();
        let run = async {
            let _ = svc.run(cancel.clone(), &reporter).await;
        };
        let stop = async {
            // Give the worker a moment to claim and finish the job.
            for _ in 0..100 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let current = queue.get_job(job.id).await.unwrap().unwrap();
                if current.status.is_terminal() {
                    break;
                }
            }
            cancel.cancel();
        };
        tokio::join!(run, stop);

        let done = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let events = reporter.events.lock().unwrap().clone();
        assert!(events.contains(&"JobClaimed".to_string()));
        assert!(events.contains(&"JobCompleted".to_string()));
        assert!(events.contains(&"Stopped".to_string()));
    }
}
