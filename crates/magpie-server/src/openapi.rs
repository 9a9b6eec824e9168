use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Magpie API",
        version = "0.1.0",
        description = "Technology-transfer listing aggregator: rate-limited scraping jobs with circuit-broken fetching."
    ),
    paths(
        crate::routes::submit_job,
        crate::routes::job_status,
        crate::routes::cancel_job,
        crate::routes::job_results,
        crate::routes::metrics,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::SubmitJobRequest,
        crate::dto::SelectorConfigDto,
        crate::dto::RateLimitDto,
        crate::dto::RetryDto,
        crate::dto::ValidationRulesDto,
        crate::dto::SubmitJobResponse,
        crate::dto::JobLinks,
        crate::dto::JobStatusResponse,
        crate::dto::JobErrorDto,
        crate::dto::CancelJobResponse,
        crate::dto::RecordResponse,
        crate::dto::PaginationMeta,
        crate::dto::ResultsResponse,
        crate::dto::MetricsResponse,
        crate::dto::BreakerDto,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
        crate::dto::ViolationDto,
    )),
    tags(
        (name = "jobs", description = "Scrape job management"),
        (name = "system", description = "Health and pipeline metrics"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Admin API key. Set via MAGPIE_ADMIN_TOKEN environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
