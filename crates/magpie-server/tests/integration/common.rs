use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use magpie_core::circuit_breaker::CircuitBreakerConfig;
use magpie_core::memory::{InMemoryJobQueue, InMemoryResultStore};
use magpie_core::rate_limit::RateLimitProfiles;
use magpie_core::submit::{JobSubmitter, SubmissionLimits};
use magpie_core::worker::PipelineContext;
use magpie_server::routes;
use magpie_server::state::AppState;

pub const TEST_API_KEY: &str = "test-admin-key";

pub struct TestApp {
    pub router: Router,
    pub queue: InMemoryJobQueue,
    pub results: InMemoryResultStore,
    pub ctx: PipelineContext,
}

fn build_app(admin_token: Option<String>) -> TestApp {
    let ctx = PipelineContext::new(
        RateLimitProfiles::default(),
        CircuitBreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        },
        2,
    );
    let queue = InMemoryJobQueue::new();
    let results = InMemoryResultStore::new();
    let submitter = JobSubmitter::new(
        queue.clone(),
        SubmissionLimits::default(),
        ctx.metrics.clone(),
    );

    let state = Arc::new(AppState {
        queue: queue.clone(),
        results: results.clone(),
        submitter,
        ctx: ctx.clone(),
        admin_token,
    });

    TestApp {
        router: routes::router(state),
        queue,
        results,
        ctx,
    }
}

pub fn setup_test_app() -> TestApp {
    build_app(Some(TEST_API_KEY.to_string()))
}

pub fn setup_test_app_no_auth() -> TestApp {
    build_app(None)
}

/// A well-formed submission body.
pub fn submit_body() -> serde_json::Value {
    serde_json::json!({
        "url": "https://tto.example.edu/listings",
        "institution": "us_university",
        "selector": {
            "item_selector": "/listings",
            "fields": {
                "title": "/name",
                "description": "/summary"
            },
            "next_page_selector": "/next"
        }
    })
}
