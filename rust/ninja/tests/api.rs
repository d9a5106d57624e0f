mod support;

use axum::http::{header, StatusCode};
use ninja::quota::plan::PlanLimits;
use pretty_assertions::assert_eq;
use serde_json::json;
use support::{get, get_as, offline_config, offline_router, read_json, read_text, send};

#[tokio::test]
async fn health_is_ok() {
    let router = offline_router(offline_config());
    let (status, body) = read_json(send(&router, get("/healthz")).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn root_document_points_at_the_base_url() {
    let router = offline_router(offline_config());
    let response = send(&router, get("/")).await;
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json;charset=UTF-8"
    );
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["documentation"], json!("http://ninja.test/apispec"));
    assert!(!body.to_string().contains("__URL__"));
}

#[tokio::test]
async fn apispec_is_served_as_yaml_with_the_host_url() {
    let router = offline_router(offline_config());
    let response = send(&router, get("/apispec")).await;
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/yaml;charset=UTF-8"
    );
    let (status, text) = read_text(response).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("- url: https://mobility.ninja.test"));
    assert!(!text.contains("__ODH_SERVER_URL__"));
}

#[tokio::test]
async fn unknown_representation_is_404() {
    let router = offline_router(offline_config());
    let (status, body) = read_json(send(&router, get("/table/ParkingStation")).await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["info"]["kind"], json!("WrongRepresentation"));
    assert_eq!(body["code"], json!(404));
    assert_eq!(body["error"], json!("Not Found"));
}

#[tokio::test]
async fn too_many_segments_is_404() {
    let router = offline_router(offline_config());
    let (status, body) = read_json(send(&router, get("/flat/a/b/c/d/e")).await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["info"]["kind"], json!("NotFound"));

    let (status, _) = read_json(send(&router, get("/flat/a/b/c")).await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn broken_filter_is_rejected_before_the_database() {
    let router = offline_router(offline_config());
    let (status, body) =
        read_json(send(&router, get("/flat/ParkingStation?where=and(sname.eq.a")).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["info"]["kind"], json!("FilterSyntaxError"));
    assert_eq!(body["description"], json!("Syntax error in WHERE-clause"));
    assert!(body["hint"].as_str().unwrap().contains("escape"));
}

#[tokio::test]
async fn unknown_select_attribute_is_400() {
    let router = offline_router(offline_config());
    let (status, body) =
        read_json(send(&router, get("/flat/ParkingStation?select=nosuchthing")).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["info"]["kind"], json!("UnknownAttribute"));
}

#[tokio::test]
async fn recipe_must_match_the_dataset() {
    let router = offline_router(offline_config());
    let (status, body) = read_json(send(&router, get("/flat,edge/LinkStation/length")).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["info"]["kind"], json!("MethodNotAllowed"));
    assert_eq!(
        body["message"],
        json!("DATA FETCHING ERROR: Method 'fetchStationsAndTypes' not allowed with flat,edge representation.")
    );
}

#[tokio::test]
async fn malformed_dates_are_400() {
    let router = offline_router(offline_config());
    let (status, body) =
        read_json(send(&router, get("/flat/ParkingStation/occupied/2024-13-01/2024-02-01")).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["info"]["kind"], json!("DateParseError"));

    let (status, body) = read_json(send(&router, get("/flat,event/A22/soon")).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["info"]["kind"], json!("DateParseError"));
}

#[tokio::test]
async fn invalid_query_parameter_is_400() {
    let router = offline_router(offline_config());
    let (status, body) = read_json(send(&router, get("/flat/ParkingStation?limit=many")).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["info"]["kind"], json!("InvalidParameter"));
}

#[tokio::test]
async fn eleventh_anonymous_request_gets_429() {
    let mut config = offline_config();
    config.quota.guest = PlanLimits::new(10, 30);
    let router = offline_router(config);

    for _ in 0..10 {
        let response = send(&router, get("/flat,edge/LinkStation/length")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["x-rate-limit-policy"], "Anonymous");
        assert_eq!(response.headers()["x-rate-limit-limit"], "10");
    }

    let response = send(&router, get("/flat,edge/LinkStation/length")).await;
    assert_eq!(response.headers()["x-rate-limit-remaining"], "0");
    assert_eq!(response.headers()["x-rate-limit-policy"], "Anonymous");
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["policy"], json!("Anonymous"));
    assert_eq!(body["info"]["kind"], json!("RateLimited"));
    assert!(body["hint"].is_string());
}

#[tokio::test]
async fn health_is_outside_the_quota() {
    let mut config = offline_config();
    config.quota.guest = PlanLimits::new(1, 30);
    let router = offline_router(config);

    for _ in 0..3 {
        let response = send(&router, get("/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-rate-limit-policy").is_none());
    }
}

#[tokio::test]
async fn admin_is_unrestricted_and_only_gets_the_policy_header() {
    let mut config = offline_config();
    config.quota.guest = PlanLimits::new(1, 30);
    let router = offline_router(config);
    let admin = json!({"sub": "ops", "realm_access": {"roles": ["ODH_ROLE_ADMIN"]}});

    for _ in 0..3 {
        let response = send(&router, get_as("/flat,edge/LinkStation/length", &admin)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["x-rate-limit-policy"], "No Restriction");
        assert!(response.headers().get("x-rate-limit-remaining").is_none());
    }
}

#[tokio::test]
async fn basic_plan_history_range_is_limited() {
    let mut config = offline_config();
    config.quota.basic = PlanLimits::new(200, 30);
    let router = offline_router(config);
    let basic = json!({"sub": "alice", "realm_access": {"roles": ["ODH_ROLE_GUEST"]}});

    let response = send(
        &router,
        get_as("/flat/ParkingStation/occupied/2024-01-01/2024-03-01", &basic),
    )
    .await;
    assert_eq!(response.headers()["x-rate-limit-policy"], "Authenticated Basic");
    let (status, body) = read_json(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["info"]["kind"], json!("HistoricRangeExceeded"));
    assert_eq!(body["policy"], json!("Authenticated Basic"));
    assert_eq!(
        body["message"],
        json!("You have exceeded the date range limit of 30 days")
    );
}

#[tokio::test]
async fn metadata_history_range_is_limited_for_guests() {
    let router = offline_router(offline_config());
    let (status, body) = read_json(
        send(
            &router,
            get("/flat/ParkingStation/metadata/history?from=2020-01-01&to=2024-01-01"),
        )
        .await,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["info"]["kind"], json!("HistoricRangeExceeded"));
    assert_eq!(body["policy"], json!("Anonymous"));
}

#[tokio::test]
async fn cors_preflight_allows_get() {
    let router = offline_router(offline_config());
    let request = axum::http::Request::builder()
        .method(axum::http::Method::OPTIONS)
        .uri("/flat")
        .header(header::ORIGIN, "https://app.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let methods = response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
        .to_str()
        .unwrap()
        .to_string();
    assert!(methods.contains("GET"), "{methods}");
}
