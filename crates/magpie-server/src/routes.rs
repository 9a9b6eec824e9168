use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use magpie_core::error::AppError;
use magpie_core::job::JobStatus;
use magpie_core::job_queue::JobQueue;
use magpie_core::store::{DEFAULT_PAGE_SIZE, ResultStore};

use crate::auth::require_api_key;
use crate::dto::{
    CancelJobResponse, HealthResponse, JobLinks, JobStatusResponse, MetricsResponse,
    RecordResponse, ResultsQuery, ResultsResponse, PaginationMeta, SubmitJobRequest,
    SubmitJobResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/scraper/jobs", post(submit_job))
        .route("/scraper/jobs/{id}/status", get(job_status))
        .route("/scraper/jobs/{id}", delete(cancel_job))
        .route("/scraper/jobs/{id}/results", get(job_results))
        .route("/scraper/metrics", get(metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/scraper/jobs",
    request_body = SubmitJobRequest,
    responses(
        (status = 202, description = "Job admitted for asynchronous execution", body = SubmitJobResponse),
        (status = 400, description = "Validation failed; every violation listed", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
        (status = 429, description = "Submitting caller is rate limited"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.submitter.submit(body.into()).await?;

    let response = SubmitJobResponse {
        job_id: job.id,
        status: "scheduled".to_string(),
        links: JobLinks {
            self_link: format!("/scraper/jobs/{}/status", job.id),
            results: format!("/scraper/jobs/{}/results", job.id),
        },
    };

    Ok((StatusCode::ACCEPTED, axum::Json(response)))
}

#[utoipa::path(
    get,
    path = "/scraper/jobs/{id}/status",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Current job status", body = JobStatusResponse),
        (status = 404, description = "Unknown job id", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .queue
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;

    Ok(axum::Json(JobStatusResponse::from(job)))
}

#[utoipa::path(
    delete,
    path = "/scraper/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Cancellation accepted (idempotent on terminal jobs)", body = CancelJobResponse),
        (status = 404, description = "Unknown job id", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.queue.cancel_job(id).await?;

    Ok(axum::Json(CancelJobResponse {
        job_id: id,
        status: status.to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/scraper/jobs/{id}/results",
    params(
        ("id" = Uuid, Path, description = "Job ID"),
        ResultsQuery,
    ),
    responses(
        (status = 200, description = "One page of extracted records", body = ResultsResponse),
        (status = 400, description = "Invalid pagination parameters", body = crate::dto::ErrorResponse),
        (status = 404, description = "Unknown job id", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn job_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ResultsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if state.queue.get_job(id).await?.is_none() {
        return Err(AppError::NotFound(format!("job {id}")).into());
    }

    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let result = state.results.page(id, page, limit).await?;

    let response = ResultsResponse {
        pagination: PaginationMeta {
            page: result.page,
            limit: result.page_size,
            total: result.total,
            pages: result.page_count(),
        },
        data: result.records.into_iter().map(RecordResponse::from).collect(),
    };

    Ok(axum::Json(response))
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/scraper/metrics",
    responses(
        (status = 200, description = "Aggregate pipeline counters", body = MetricsResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.ctx.metrics.snapshot();
    let breakers = state.ctx.breakers.stats();
    axum::Json(MetricsResponse::new(snapshot, breakers))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pending = state
        .queue
        .count_by_status(JobStatus::Pending)
        .await
        .unwrap_or(-1);

    axum::Json(HealthResponse {
        status: "healthy",
        pending_jobs: pending,
    })
}
