use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

use magpie_core::testutil::make_test_record;

use crate::integration::common::{
    TEST_API_KEY, setup_test_app, setup_test_app_no_auth, submit_body,
};

fn authed(request: axum::http::request::Builder) -> axum::http::request::Builder {
    request.header("authorization", format!("Bearer {TEST_API_KEY}"))
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            Request::get("/scraper/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_api_key_returns_401() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            Request::get("/scraper/metrics")
                .header("authorization", "Bearer wrong-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn no_admin_token_returns_403() {
    let app = setup_test_app_no_auth();

    let response = app
        .router
        .oneshot(
            Request::get("/scraper/metrics")
                .header("authorization", "Bearer any-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = json_body(response).await;
    assert_eq!(json["error"], "forbidden");
}

#[tokio::test]
async fn submit_job_returns_202_with_links() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            authed(Request::post("/scraper/jobs"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&submit_body()).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    assert_eq!(json["status"], "scheduled");
    let job_id = json["job_id"].as_str().unwrap();
    assert_eq!(
        json["_links"]["self"],
        format!("/scraper/jobs/{job_id}/status")
    );
    assert_eq!(
        json["_links"]["results"],
        format!("/scraper/jobs/{job_id}/results")
    );
}

#[tokio::test]
async fn invalid_submission_lists_every_violation() {
    let app = setup_test_app();

    let body = serde_json::json!({
        "url": "http://insecure.example.edu",
        "institution": "community_college",
        "selector": {
            "item_selector": "",
            "fields": {}
        }
    });

    let response = app
        .router
        .oneshot(
            authed(Request::post("/scraper/jobs"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["error"], "validation_error");
    let violations = json["violations"].as_array().unwrap();
    assert!(violations.len() >= 3, "expected all violations listed: {violations:?}");
    let fields: Vec<_> = violations
        .iter()
        .map(|v| v["field"].as_str().unwrap().to_string())
        .collect();
    assert!(fields.contains(&"url".to_string()));
    assert!(fields.contains(&"institution".to_string()));
    assert!(fields.contains(&"selector.item_selector".to_string()));
}

#[tokio::test]
async fn submitted_job_is_queryable_as_pending() {
    let app = setup_test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::post("/scraper/jobs"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&submit_body()).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let job_id = json_body(response).await["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .router
        .oneshot(
            authed(Request::get(format!("/scraper/jobs/{job_id}/status")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "pending");
    assert_eq!(json["retry_count"], 0);
    assert_eq!(json["institution"], "us_university");
}

#[tokio::test]
async fn unknown_job_status_returns_404() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            authed(Request::get(format!("/scraper/jobs/{}/status", Uuid::new_v4())))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = json_body(response).await;
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn cancel_is_idempotent_on_terminal_jobs() {
    let app = setup_test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::post("/scraper/jobs"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&submit_body()).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let job_id = json_body(response).await["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    // First cancel: pending -> cancelled.
    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::delete(format!("/scraper/jobs/{job_id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "cancelled");

    // Second cancel: still 200, still cancelled.
    let response = app
        .router
        .oneshot(
            authed(Request::delete(format!("/scraper/jobs/{job_id}")))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "cancelled");
}

#[tokio::test]
async fn cancel_unknown_job_returns_404() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            authed(Request::delete(format!("/scraper/jobs/{}", Uuid::new_v4())))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn results_paginate_with_clamped_limit() {
    let app = setup_test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::post("/scraper/jobs"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&submit_body()).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let job_id: Uuid = json_body(response).await["job_id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    use magpie_core::store::ResultStore;
    let records: Vec<_> = (0..30)
        .map(|i| make_test_record(job_id, &format!("listing {i:02}")))
        .collect();
    app.results.append(job_id, records).await.unwrap();

    // Page 2 of 25: the last 5 records.
    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::get(format!(
                "/scraper/jobs/{job_id}/results?page=2&limit=25"
            )))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["pagination"]["page"], 2);
    assert_eq!(json["pagination"]["limit"], 25);
    assert_eq!(json["pagination"]["total"], 30);
    assert_eq!(json["pagination"]["pages"], 2);
    assert_eq!(json["data"].as_array().unwrap().len(), 5);
    assert_eq!(json["data"][0]["title"], "listing 25");

    // Oversized limit is clamped to the server maximum.
    let response = app
        .router
        .oneshot(
            authed(Request::get(format!(
                "/scraper/jobs/{job_id}/results?limit=10000"
            )))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    let json = json_body(response).await;
    assert_eq!(json["pagination"]["limit"], 100);
}

#[tokio::test]
async fn page_below_one_returns_400() {
    let app = setup_test_app();

    let response = app
        .router
        .clone()
        .oneshot(
            authed(Request::post("/scraper/jobs"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&submit_body()).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let job_id = json_body(response).await["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .router
        .oneshot(
            authed(Request::get(format!(
                "/scraper/jobs/{job_id}/results?page=0"
            )))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn results_for_unknown_job_return_404() {
    let app = setup_test_app();

    let response = app
        .router
        .oneshot(
            authed(Request::get(format!(
                "/scraper/jobs/{}/results",
                Uuid::new_v4()
            )))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn metrics_report_submissions() {
    let app = setup_test_app();

    app.router
        .clone()
        .oneshot(
            authed(Request::post("/scraper/jobs"))
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&submit_body()).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(
            authed(Request::get("/scraper/metrics"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["jobs_submitted"], 1);
    assert_eq!(json["requests_total"], 0);
    assert!(json["errors_by_kind"].is_object());
    assert!(json["breakers"].is_array());
}
