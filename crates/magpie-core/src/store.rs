use std::future::Future;

use uuid::Uuid;

use crate::error::{AppError, ValidationFailure};
use crate::record::ScrapedRecord;

/// Server-side ceiling on `page_size`; larger requests are clamped, not
/// rejected.
pub const MAX_PAGE_SIZE: u32 = 100;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// One page of results plus the total committed at query time.
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<ScrapedRecord>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl RecordPage {
    /// Number of pages the current total spans.
    pub fn page_count(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.total.div_ceil(self.page_size as u64)
        }
    }
}

/// Validate and clamp pagination parameters: `page < 1` is a validation
/// error, `page_size` is clamped into `[1, MAX_PAGE_SIZE]`.
pub fn check_pagination(page: u32, page_size: u32) -> Result<(u32, u32), AppError> {
    if page < 1 {
        let mut failure = ValidationFailure::default();
        failure.push("page", "page number must be >= 1");
        return Err(AppError::Validation(failure));
    }
    Ok((page, page_size.clamp(1, MAX_PAGE_SIZE)))
}

/// Stores validated records and serves stable offset-based pages.
///
/// `append` upserts by the record's natural key so re-scrapes supersede
/// rather than duplicate. Pagination is deterministic for a fixed
/// dataset: records are ordered by insertion and repeated queries over an
/// unchanged set return identical pages. Reads tolerate an
/// eventually-consistent `total` while another job appends.
pub trait ResultStore: Send + Sync + Clone {
    /// Append (upsert) records for a job. Returns how many were written.
    fn append(
        &self,
        job_id: Uuid,
        records: Vec<ScrapedRecord>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Read one page of a job's records. `page` is 1-based.
    fn page(
        &self,
        job_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<RecordPage, AppError>> + Send;

    /// Records committed for a job at query time.
    fn total(&self, job_id: Uuid) -> impl Future<Output = Result<u64, AppError>> + Send;
}
