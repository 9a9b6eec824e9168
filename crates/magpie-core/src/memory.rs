//! In-memory job queue and result store.
//!
//! These are the production implementations for a single-process
//! deployment. State does not survive a restart; that limitation is
//! deliberate and documented (see DESIGN.md). Swapping in a durable
//! backend means implementing [`JobQueue`] and [`ResultStore`] over it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobError, JobStatus, ScrapeJob};
use crate::job_queue::JobQueue;
use crate::record::ScrapedRecord;
use crate::store::{RecordPage, ResultStore, check_pagination};

/// In-memory [`JobQueue`]. One mutex over the job table: claim scans are
/// short and jobs are small, so finer locking buys nothing here.
#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    jobs: Arc<Mutex<Vec<ScrapeJob>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_jobs<T>(&self, f: impl FnOnce(&mut Vec<ScrapeJob>) -> T) -> T {
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut jobs)
    }
}

impl JobQueue for InMemoryJobQueue {
    async fn insert_job(&self, job: ScrapeJob) -> Result<(), AppError> {
        self.with_jobs(|jobs| jobs.push(job));
        Ok(())
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<ScrapeJob>, AppError> {
        Ok(self.with_jobs(|jobs| {
            // Insertion order doubles as created_at order.
            let pos = jobs.iter().position(|j| j.status == JobStatus::Pending)?;
            let job = &mut jobs[pos];
            job.status = JobStatus::Running;
            job.worker_id = Some(worker_id.to_string());
            job.started_at = Some(Utc::now());
            job.updated_at = Utc::now();
            Some(job.clone())
        }))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        pages_fetched: u32,
        records_stored: u64,
        records_dropped: u64,
    ) -> Result<(), AppError> {
        self.with_jobs(|jobs| {
            if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
                job.status = JobStatus::Completed;
                job.pages_fetched = pages_fetched;
                job.records_stored = records_stored;
                job.records_dropped = records_dropped;
                job.last_error = None;
                job.worker_id = None;
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
            }
        });
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error: &JobError) -> Result<(), AppError> {
        self.with_jobs(|jobs| {
            if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
                job.status = JobStatus::Failed;
                job.last_error = Some(error.clone());
                job.worker_id = None;
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
            }
        });
        Ok(())
    }

    async fn record_attempt(
        &self,
        job_id: Uuid,
        retry_count: u32,
        error: &JobError,
    ) -> Result<(), AppError> {
        self.with_jobs(|jobs| {
            if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
                job.retry_count = retry_count;
                job.last_error = Some(error.clone());
                job.updated_at = Utc::now();
            }
        });
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<JobStatus, AppError> {
        self.with_jobs(|jobs| {
            let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
                return Err(AppError::NotFound(format!("job {job_id}")));
            };
            match job.status {
                JobStatus::Pending => {
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    job.updated_at = Utc::now();
                }
                JobStatus::Running => {
                    job.cancel_requested = true;
                    job.updated_at = Utc::now();
                }
                // Terminal: idempotent, leave as-is.
                _ => {}
            }
            Ok(job.status)
        })
    }

    async fn cancel_requested(&self, job_id: Uuid) -> Result<bool, AppError> {
        self.with_jobs(|jobs| {
            jobs.iter()
                .find(|j| j.id == job_id)
                .map(|j| j.cancel_requested)
                .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
        })
    }

    async fn mark_cancelled(&self, job_id: Uuid) -> Result<(), AppError> {
        self.with_jobs(|jobs| {
            if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id)
                && job.status == JobStatus::Running
            {
                job.status = JobStatus::Cancelled;
                job.worker_id = None;
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
            }
        });
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ScrapeJob>, AppError> {
        Ok(self.with_jobs(|jobs| jobs.iter().find(|j| j.id == job_id).cloned()))
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<ScrapeJob>, AppError> {
        Ok(self.with_jobs(|jobs| {
            jobs.iter()
                .filter(|j| status.is_none_or(|s| j.status == s))
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        Ok(self.with_jobs(|jobs| jobs.iter().filter(|j| j.status == status).count() as i64))
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        Ok(self.with_jobs(|jobs| {
            let mut count = 0u64;
            for job in jobs.iter_mut() {
                if job.worker_id.as_deref() == Some(worker_id) && job.status == JobStatus::Running {
                    job.status = JobStatus::Pending;
                    job.worker_id = None;
                    job.started_at = None;
                    job.updated_at = Utc::now();
                    count += 1;
                }
            }
            count
        }))
    }
}

/// Per-job record set: insertion order plus a natural-key index for
/// upserts.
#[derive(Default)]
struct JobRecords {
    order: Vec<ScrapedRecord>,
    by_key: HashMap<String, usize>,
}

impl JobRecords {
    fn upsert(&mut self, record: ScrapedRecord) {
        match self.by_key.get(&record.natural_key) {
            Some(&pos) => {
                // Supersede in place: the slot keeps its pagination position
                // and its original discovery time.
                let discovered_at = self.order[pos].discovered_at;
                let mut record = record;
                record.discovered_at = discovered_at;
                self.order[pos] = record;
            }
            None => {
                self.by_key.insert(record.natural_key.clone(), self.order.len());
                self.order.push(record);
            }
        }
    }
}

/// In-memory [`ResultStore`]. Appends from different jobs touch different
/// map entries; the outer lock is held only to locate the entry.
#[derive(Clone, Default)]
pub struct InMemoryResultStore {
    records: Arc<RwLock<HashMap<Uuid, Arc<Mutex<JobRecords>>>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, job_id: Uuid) -> Arc<Mutex<JobRecords>> {
        {
            let records = self.records.read().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = records.get(&job_id) {
                return entry.clone();
            }
        }
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        records.entry(job_id).or_default().clone()
    }

    fn existing(&self, job_id: Uuid) -> Option<Arc<Mutex<JobRecords>>> {
        let records = self.records.read().unwrap_or_else(|p| p.into_inner());
        records.get(&job_id).cloned()
    }
}

impl ResultStore for InMemoryResultStore {
    async fn append(&self, job_id: Uuid, records: Vec<ScrapedRecord>) -> Result<u64, AppError> {
        let entry = self.entry(job_id);
        let mut set = entry.lock().unwrap_or_else(|p| p.into_inner());
        let written = records.len() as u64;
        for record in records {
            set.upsert(record);
        }
        Ok(written)
    }

    async fn page(&self, job_id: Uuid, page: u32, page_size: u32) -> Result<RecordPage, AppError> {
        let (page, page_size) = check_pagination(page, page_size)?;

        let Some(entry) = self.existing(job_id) else {
            return Ok(RecordPage {
                records: vec![],
                total: 0,
                page,
                page_size,
            });
        };
        let set = entry.lock().unwrap_or_else(|p| p.into_inner());

        let start = (page as usize - 1).saturating_mul(page_size as usize);
        let slice = set
            .order
            .iter()
            .skip(start)
            .take(page_size as usize)
            .cloned()
            .collect();

        Ok(RecordPage {
            records: slice,
            total: set.order.len() as u64,
            page,
            page_size,
        })
    }

    async fn total(&self, job_id: Uuid) -> Result<u64, AppError> {
        Ok(self
            .existing(job_id)
            .map(|entry| entry.lock().unwrap_or_else(|p| p.into_inner()).order.len() as u64)
            .unwrap_or(0))
    }
}
