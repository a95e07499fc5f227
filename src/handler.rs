use crate::app_state::HttpServerState;
use crate::metrics;
use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tracing::{debug, warn};

/// Forwards `/.well-known/nostr.json` to the community backend.
pub async fn handle_nostr_json(
    State(state): State<Arc<HttpServerState>>,
    RawQuery(query): RawQuery,
) -> Response {
    let url = state.upstream_url(query.as_deref());
    debug!("Proxying nostr.json to {}", url);

    let upstream = match state
        .http
        .get(&url)
        .header(header::ACCEPT, "application/json")
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!("nostr.json upstream unreachable: {}", e);
            return upstream_failure();
        }
    };

    let status = upstream.status();
    metrics::nip05_proxy_requests(status.as_u16()).increment(1);

    let body = Body::from_stream(upstream.bytes_stream());
    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    if let Ok(value) = HeaderValue::from_str(&state.cache_control()) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    response
}

fn upstream_failure() -> Response {
    metrics::nip05_proxy_requests(StatusCode::BAD_GATEWAY.as_u16()).increment(1);
    (
        StatusCode::BAD_GATEWAY,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        r#"{"error":"upstream unavailable"}"#,
    )
        .into_response()
}

/// CORS preflight for the proxy.
pub async fn handle_nostr_json_preflight() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "*"),
        ],
    )
        .into_response()
}

pub async fn handle_health() -> &'static str {
    "OK"
}

pub async fn handle_metrics(State(metrics_handle): State<PrometheusHandle>) -> impl IntoResponse {
    metrics_handle.render()
}
