use std::future::Future;

use crate::error::AppError;
use crate::job::SelectorConfig;
use crate::record::RecordDraft;

/// Fetches one raw document from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Output of one parse step: extracted records, per-record extraction
/// errors, and the next remote page when the source paginates.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub records: Vec<RecordDraft>,
    /// Items the parser could locate but not extract. These drop the
    /// record, never the job.
    pub errors: Vec<String>,
    pub next_page: Option<String>,
}

/// Extracts structured listing fields from a raw document.
///
/// Content extraction is a collaborator with its own subsystem; the
/// pipeline depends only on this interface.
pub trait Parser: Send + Sync + Clone {
    fn parse(&self, raw: &str, selector: &SelectorConfig) -> Result<ParseOutcome, AppError>;
}
