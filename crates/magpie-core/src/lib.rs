pub mod circuit_breaker;
pub mod error;
pub mod institution;
pub mod job;
pub mod job_queue;
pub mod memory;
pub mod metrics;
pub mod rate_limit;
pub mod record;
pub mod retry;
pub mod store;
pub mod submit;
pub mod testutil;
pub mod traits;
pub mod worker;

pub use error::{AppError, ValidationFailure, Violation};
pub use institution::InstitutionType;
pub use job::{JobError, JobRequest, JobStatus, ScrapeJob, SelectorConfig, ValidationRules};
pub use record::{RecordDraft, ScrapedRecord};
pub use traits::{Fetcher, ParseOutcome, Parser};
