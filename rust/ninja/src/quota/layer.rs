use super::{plan::PricingPlan, RateLimit};
use crate::{auth::Caller, error::ServiceError, state::AppState};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

pub const HEADER_POLICY: &str = "x-rate-limit-policy";
pub const HEADER_RESET: &str = "x-rate-limit-reset";
pub const HEADER_LIMIT: &str = "x-rate-limit-limit";
pub const HEADER_REMAINING: &str = "x-rate-limit-remaining";

const UNLIMITED_PATHS: &[&str] = &["/healthz"];

/// Identifies the caller, resolves its plan and charges the request to its
/// bucket. The [`Caller`] and [`PricingPlan`] are left in the request
/// extensions for the handlers.
pub async fn enforce(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let caller = Caller::from_request(request.headers(), request.uri());
    let plan = PricingPlan::resolve(
        &caller.roles,
        caller.subject.as_deref(),
        caller.referer.as_deref(),
    );
    let path = request.uri().path().to_string();
    let ip = client_ip(&request);
    let owner = caller.user_or_referer().to_string();
    request.extensions_mut().insert(caller);
    request.extensions_mut().insert(plan);

    if UNLIMITED_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    match state.quota.check(plan, &owner, &ip, &path) {
        None => {
            let mut response = next.run(request).await;
            insert_header(response.headers_mut(), HEADER_POLICY, plan.name());
            response
        }
        Some(limit) if !limit.probe.consumed => {
            let mut response = ServiceError::RateLimited {
                policy: plan.name().to_string(),
            }
            .into_response();
            rate_headers(response.headers_mut(), &limit);
            response
        }
        Some(limit) => {
            let mut response = next.run(request).await;
            rate_headers(response.headers_mut(), &limit);
            response
        }
    }
}

fn rate_headers(headers: &mut HeaderMap, limit: &RateLimit) {
    let reset = limit.probe.reset_in.as_millis().div_ceil(1000);
    insert_header(headers, HEADER_POLICY, limit.plan.name());
    insert_header(headers, HEADER_RESET, &reset.to_string());
    insert_header(headers, HEADER_LIMIT, &limit.limit.to_string());
    insert_header(headers, HEADER_REMAINING, &limit.probe.remaining.to_string());
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Socket peer when served with connect info, else the first forwarded hop.
fn client_ip(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown")
        .to_string()
}
