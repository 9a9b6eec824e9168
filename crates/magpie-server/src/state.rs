use magpie_core::memory::{InMemoryJobQueue, InMemoryResultStore};
use magpie_core::submit::JobSubmitter;
use magpie_core::worker::PipelineContext;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub queue: InMemoryJobQueue,
    pub results: InMemoryResultStore,
    pub submitter: JobSubmitter<InMemoryJobQueue>,
    pub ctx: PipelineContext,
    /// Admin API key for protecting the scraper endpoints (None = endpoints disabled).
    pub admin_token: Option<String>,
}
