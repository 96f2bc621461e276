use crate::config::GatewaySettings;
use crate::error::GatewayError;
use crate::proxy::{Gateway, GatewayResponse, RequestMeta};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub settings: GatewaySettings,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([axum::http::HeaderName::from_static(REQUEST_ID_HEADER)]);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Always minted here: the id is the billing idempotency key.
    let request_id = format!("req-{}", uuid::Uuid::new_v4().simple());
    let meta = RequestMeta {
        request_id: request_id.clone(),
        authorization: headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        client_ip: client_ip(
            &headers,
            peer.map(|ConnectInfo(addr)| addr),
            &state.settings.trusted_proxies,
        ),
    };

    let response = match state.gateway.handle(meta, &body).await {
        Ok(GatewayResponse::Json(completion)) => Json(completion).into_response(),
        Ok(GatewayResponse::Stream(rx)) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(ReceiverStream::new(rx)))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => {
            if !e.is_internal() {
                tracing::info!(request_id = %request_id, code = e.code(), error = %e, "request rejected");
            }
            e.into_response()
        }
    };

    with_request_id(response, &request_id)
}

async fn handle_models(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(
        &headers,
        peer.map(|ConnectInfo(addr)| addr),
        &state.settings.trusted_proxies,
    );
    if let Some(ref ip) = ip {
        if !state.gateway.allow_ip(ip).await {
            return GatewayError::RateLimitExceeded {
                limit: state.settings.ip_rate_limit_per_minute,
                window_secs: state.settings.rate_limit_window_secs,
            }
            .into_response();
        }
    }

    match state.gateway.list_models().await {
        Ok(models) => {
            let data: Vec<serde_json::Value> = models
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "id": m.model_id,
                        "object": "model",
                        "created": 0,
                        "owned_by": "llm-gateway",
                    })
                })
                .collect();
            Json(serde_json::json!({ "object": "list", "data": data })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Caller address. The socket peer, unless the peer is a trusted proxy, in
/// which case the first `X-Forwarded-For` hop, then `X-Real-IP`, win.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted_proxies: &[IpAddr]) -> Option<String> {
    let peer_ip = peer.map(|addr| addr.ip());
    if !peer_ip.is_some_and(|ip| trusted_proxies.contains(&ip)) {
        return peer_ip.map(|ip| ip.to_string());
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(first.to_string());
    }
    if let Some(real) = header("x-real-ip") {
        return Some(real.to_string());
    }
    peer_ip.map(|ip| ip.to_string())
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_precedence_behind_trusted_proxy() {
        let peer: SocketAddr = "192.0.2.9:5555".parse().unwrap();
        let trusted = [peer.ip()];
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer), &trusted).as_deref(), Some("192.0.2.9"));
        assert_eq!(client_ip(&headers, None, &trusted), None);

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(client_ip(&headers, Some(peer), &trusted).as_deref(), Some("198.51.100.4"));

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, Some(peer), &trusted).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_forwarding_headers_ignored_from_untrusted_peer() {
        let peer: SocketAddr = "192.0.2.9:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));

        assert_eq!(client_ip(&headers, Some(peer), &[]).as_deref(), Some("192.0.2.9"));
        let other_proxy: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            client_ip(&headers, Some(peer), &[other_proxy]).as_deref(),
            Some("192.0.2.9")
        );
        // Without a socket peer there is nothing to trust.
        assert_eq!(client_ip(&headers, None, &[other_proxy]), None);
    }
}
