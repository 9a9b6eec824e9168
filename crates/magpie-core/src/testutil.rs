//! Test utilities: mock implementations of the collaborator traits.
//!
//! Handwritten mocks for dependency injection in unit tests. Mocks use
//! `Arc<Mutex<_>>` interior mutability so tests can assert on recorded
//! calls after handing clones to the code under test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::institution::InstitutionType;
use crate::job::{JobRequest, JobStatus, ScrapeJob, SelectorConfig, ValidationRules};
use crate::record::{RecordDraft, ScrapedRecord, natural_key};
use crate::retry::RetryPolicy;
use crate::traits::{Fetcher, ParseOutcome, Parser};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that pops from a queue of configured responses and counts
/// calls (so tests can assert "no network attempt happened").
#[derive(Clone)]
pub struct MockFetcher {
    responses: Arc<Mutex<Vec<Result<String, AppError>>>>,
    calls: Arc<AtomicUsize>,
}

impl MockFetcher {
    pub fn new(body: &str) -> Self {
        Self::with_responses(vec![Ok(body.to_string())])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of fetches performed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("<doc>default</doc>".to_string())
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockParser
// ---------------------------------------------------------------------------

/// Mock parser that pops from a queue of configured outcomes.
#[derive(Clone)]
pub struct MockParser {
    outcomes: Arc<Mutex<Vec<Result<ParseOutcome, AppError>>>>,
}

impl MockParser {
    pub fn with_outcomes(outcomes: Vec<Result<ParseOutcome, AppError>>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes)),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_outcomes(vec![Err(error)])
    }

    /// For tests where the fetch is expected to fail first; parses to an
    /// empty outcome if reached anyway.
    pub fn never_called() -> Self {
        Self::with_outcomes(vec![])
    }
}

impl Parser for MockParser {
    fn parse(&self, _raw: &str, _selector: &SelectorConfig) -> Result<ParseOutcome, AppError> {
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            Ok(ParseOutcome::default())
        } else {
            outcomes.remove(0)
        }
    }
}

/// Build a [`ParseOutcome`] with one draft per title.
pub fn outcome_with_records(titles: &[&str], next_page: Option<&str>) -> ParseOutcome {
    ParseOutcome {
        records: titles
            .iter()
            .map(|title| RecordDraft {
                title: (*title).to_string(),
                description: format!("Description of {title}"),
                category: None,
                country: None,
            })
            .collect(),
        errors: vec![],
        next_page: next_page.map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Worker reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl crate::worker::WorkerReporter for MockReporter {
    fn report(&self, event: crate::worker::WorkerEvent<'_>) {
        use crate::worker::WorkerEvent;
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling => "Polling",
            WorkerEvent::JobClaimed { .. } => "JobClaimed",
            WorkerEvent::AttemptStarted { .. } => "AttemptStarted",
            WorkerEvent::RateLimitWait { .. } => "RateLimitWait",
            WorkerEvent::PageStored { .. } => "PageStored",
            WorkerEvent::JobRetrying { .. } => "JobRetrying",
            WorkerEvent::JobCompleted { .. } => "JobCompleted",
            WorkerEvent::JobFailed { .. } => "JobFailed",
            WorkerEvent::JobCancelled { .. } => "JobCancelled",
            WorkerEvent::ShuttingDown { .. } => "ShuttingDown",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// Selector config pointing at a typical listing page.
pub fn make_test_selector() -> SelectorConfig {
    let mut fields = HashMap::new();
    fields.insert("title".to_string(), ".listing h3".to_string());
    fields.insert("description".to_string(), ".listing .abstract".to_string());
    SelectorConfig {
        item_selector: ".listing".to_string(),
        fields,
        next_page_selector: Some("a.next".to_string()),
    }
}

/// A pending job for a US university listing page.
pub fn make_test_job() -> ScrapeJob {
    let now = Utc::now();
    ScrapeJob {
        id: Uuid::new_v4(),
        url: "https://tto.example.edu/listings".to_string(),
        institution: InstitutionType::UsUniversity,
        instance_key: None,
        selector: make_test_selector(),
        rate_limit: None,
        retry: RetryPolicy::default(),
        validation: ValidationRules::default(),
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
    }
}

/// A well-formed submission request.
pub fn make_test_request() -> JobRequest {
    JobRequest::new(
        "https://tto.example.edu/listings",
        "us_university",
        make_test_selector(),
    )
}

/// A stored record for result-store tests.
pub fn make_test_record(source_job_id: Uuid, title: &str) -> ScrapedRecord {
    let now = Utc::now();
    ScrapedRecord {
        natural_key: natural_key("https://tto.example.edu/listings", title),
        title: title.to_string(),
        description: format!("Description of {title}"),
        institution: InstitutionType::UsUniversity,
        category: Some("materials".to_string()),
        country: Some("US".to_string()),
        discovered_at: now,
        updated_at: now,
        source_job_id,
    }
}
