use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use magpie_client::{JsonListingParser, ReqwestFetcher};
use magpie_core::circuit_breaker::CircuitBreakerConfig;
use magpie_core::job::WorkerConfig;
use magpie_core::memory::{InMemoryJobQueue, InMemoryResultStore};
use magpie_core::rate_limit::RateLimitProfiles;
use magpie_core::submit::{JobSubmitter, SubmissionLimits};
use magpie_core::worker::{PipelineContext, TracingWorkerReporter, WorkerService};
use magpie_server::routes;
use magpie_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("magpie=info".parse()?))
        .with_target(false)
        .init();

    let admin_token = std::env::var("MAGPIE_ADMIN_TOKEN").ok();
    if admin_token.is_none() {
        tracing::warn!("MAGPIE_ADMIN_TOKEN not set; scraper endpoints are disabled");
    }
    let port = std::env::var("MAGPIE_PORT").unwrap_or_else(|_| "3000".to_string());
    let workers: usize = std::env::var("MAGPIE_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    let per_key: usize = std::env::var("MAGPIE_MAX_CONCURRENCY_PER_KEY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    let addr = format!("0.0.0.0:{port}");

    let ctx = PipelineContext::new(
        RateLimitProfiles::default(),
        CircuitBreakerConfig::default(),
        per_key,
    );
    let queue = InMemoryJobQueue::new();
    let results = InMemoryResultStore::new();
    let submitter = JobSubmitter::new(
        queue.clone(),
        SubmissionLimits::default(),
        ctx.metrics.clone(),
    );

    // Single-process deployment: jobs and results are held in memory and
    // do not survive a restart.
    tracing::info!("State is in-memory; pending jobs and results are lost on restart");

    let cancel = CancellationToken::new();
    let fetcher = ReqwestFetcher::new()?;
    for i in 0..workers {
        let service = WorkerService::new(
            queue.clone(),
            fetcher.clone(),
            JsonListingParser::new(),
            results.clone(),
            ctx.clone(),
            WorkerConfig::default().with_worker_id(format!("worker-{i}")),
        );
        let token = cancel.clone();
        tokio::spawn(async move {
            let _ = service.run(token, &TracingWorkerReporter).await;
        });
    }

    let state = Arc::new(AppState {
        queue,
        results,
        submitter,
        ctx,
        admin_token,
    });

    // Caller-facing submission limit (HTTP 429 for the submitting client),
    // distinct from the per-institution job limiter.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(5)
            .burst_size(20)
            .finish()
            .context("invalid governor configuration")?,
    );

    let app = routes::router(state)
        .layer(GovernorLayer::new(governor_conf))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel))
    .await?;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
