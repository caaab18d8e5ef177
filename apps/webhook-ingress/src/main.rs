//! WhatsApp webhook ingress: verifies the handshake and authenticates
//! inbound webhooks (C4), rate-limits them (C11), and hands the parsed body
//! to the event dispatcher (C5), which drives the inbound pipeline (C6),
//! ACK state machine (C7), poll reconciler (C8), and realtime emitter (C9).
//!
//! This binary owns the only `axum` dependency in the workspace: every
//! pipeline and security crate it calls is transport-agnostic, so this file
//! is where typed errors get mapped onto HTTP per §6/§7.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use leadengine_wa_core::ErrorBody;
use leadengine_wa_normalizer::NormalizerOverrides;
use leadengine_wa_pipeline::{dispatch_webhook_body, PipelineDeps, PipelineState};
use leadengine_wa_security::{
    verify, verify_handshake, webhook_key, AuthError, Headers, RateLimitDecision, RateLimiter, RateLimiterConfig,
    WebhookAuthConfig,
};
use leadengine_wa_telemetry::{init_telemetry, record_counter, TelemetryConfig, TelemetryLabels};
use serde::Deserialize;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

const SERVICE_NAME: &str = "leadengine-wa-webhook-ingress";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

struct AppState {
    deps: PipelineDeps,
    pipeline: Arc<PipelineState>,
    auth: WebhookAuthConfig,
    /// `None` outside production: the global limiter is a production-only
    /// guard per §4.11, not something dev/test traffic should trip over.
    global_limiter: Option<Arc<RateLimiter>>,
    webhook_limiter: Arc<RateLimiter>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            deps: self.deps.clone(),
            pipeline: self.pipeline.clone(),
            auth: self.auth.clone(),
            global_limiter: self.global_limiter.clone(),
            webhook_limiter: self.webhook_limiter.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry_cfg = TelemetryConfig::from_env(SERVICE_NAME, SERVICE_VERSION);
    init_telemetry(telemetry_cfg)?;

    let auth = auth_config_from_env();
    let global_limiter = is_production().then(|| {
        Arc::new(RateLimiter::new(RateLimiterConfig::new(
            env_duration_ms("RATE_LIMIT_WINDOW_MS", 900_000),
            env_u32("RATE_LIMIT_MAX_REQUESTS", 100),
        )))
    });
    let webhook_limiter = Arc::new(RateLimiter::new(RateLimiterConfig::new(
        env_duration_ms("WEBHOOK_RATE_LIMIT_WINDOW_MS", 60_000),
        env_u32("WEBHOOK_RATE_LIMIT_MAX_REQUESTS", 120),
    )));

    // No `DATABASE_URL` means the degraded mode from §6: reads are still
    // served from the same in-memory map the test suite uses, but writes are
    // rejected with `StoreError::Unavailable` rather than silently applied.
    let harness = leadengine_wa_testkit::TestHarness::new();
    let store: leadengine_wa_core::SharedStore = if std::env::var("DATABASE_URL").is_err() {
        tracing::warn!("DATABASE_URL not set; running with read-only in-memory degraded storage");
        Arc::new(leadengine_wa_testkit::DegradedStore::new(harness.store.clone()))
    } else {
        harness.shared_store()
    };
    let deps = PipelineDeps {
        store,
        broker: harness.shared_broker(),
        media_store: harness.shared_media_store(),
        realtime: harness.shared_realtime(),
        provisioner: harness.shared_provisioner(),
        allocator: harness.shared_allocator(),
        dlq: Arc::new(leadengine_wa_dlq::LoggingDlqSink),
    };

    let state = AppState {
        deps,
        pipeline: Arc::new(PipelineState::new()),
        auth,
        global_limiter,
        webhook_limiter,
    };

    let cors = cors_layer_from_env();

    let app: Router = Router::new()
        .route(
            "/api/integrations/whatsapp/webhook",
            get(verify_handler).post(receive_handler),
        )
        .route("/api/webhooks/whatsapp", get(verify_handler).post(receive_handler))
        .route("/healthz", get(healthz))
        .layer(ServiceBuilder::new().layer(cors).layer(tower::timeout::TimeoutLayer::new(REQUEST_TIMEOUT)))
        .with_state(state);

    let addr: SocketAddr = std::env::var("BIND")
        .ok()
        .or_else(|| std::env::var("PORT").ok().map(|p| format!("0.0.0.0:{p}")))
        .unwrap_or_else(|| "0.0.0.0:8088".to_string())
        .parse()?;

    tracing::info!(%addr, "webhook-ingress listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

fn auth_config_from_env() -> WebhookAuthConfig {
    let trusted_ips = std::env::var("WHATSAPP_WEBHOOK_TRUSTED_IPS")
        .ok()
        .map(|raw| raw.split(',').filter_map(|s| s.trim().parse::<IpAddr>().ok()).collect())
        .unwrap_or_default();
    WebhookAuthConfig {
        api_key: std::env::var("WHATSAPP_WEBHOOK_API_KEY").ok(),
        trusted_ips,
        signature_secret: std::env::var("WHATSAPP_WEBHOOK_SIGNATURE_SECRET").ok(),
        signature_required: std::env::var("WHATSAPP_WEBHOOK_SIGNATURE_SECRET").is_ok(),
        verify_token: std::env::var("WHATSAPP_WEBHOOK_VERIFY_TOKEN").ok(),
    }
}

/// Reads `NODE_ENV`, falling back to `APP_ENV`, to tag the deployment
/// environment; the global rate limiter is gated on this per §4.11
/// ("production only").
fn is_production() -> bool {
    std::env::var("NODE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .map(|v| v.eq_ignore_ascii_case("production"))
        .unwrap_or(false)
}

fn cors_layer_from_env() -> CorsLayer {
    let raw = std::env::var("CORS_ALLOWED_ORIGINS")
        .or_else(|_| std::env::var("FRONTEND_URL"))
        .unwrap_or_default();
    let layer = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any);

    if raw.trim() == "*" || raw.trim().is_empty() {
        layer.allow_origin(tower_http::cors::Any)
    } else {
        let origins: Vec<_> = raw
            .split(',')
            .filter_map(|o| o.trim().parse::<axum::http::HeaderValue>().ok())
            .collect();
        layer.allow_origin(origins)
    }
}

fn env_duration_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default_ms))
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Deserialize)]
struct VerifyQs {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    token: Option<String>,
}

async fn verify_handler(State(state): State<AppState>, Query(q): Query<VerifyQs>) -> impl IntoResponse {
    if q.mode.as_deref() == Some("subscribe") {
        if let Some(challenge) = verify_handshake(&state.auth, q.token.as_deref(), q.challenge.as_deref()) {
            return (StatusCode::OK, challenge.to_string());
        }
    }
    (StatusCode::OK, "LeadEngine WhatsApp webhook".to_string())
}

fn headers_to_auth_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = ErrorBody::new(code, message, uuid::Uuid::new_v4().to_string());
    (status, axum::Json(body)).into_response()
}

async fn receive_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let remote_ip = remote.ip();

    if let Some(global_limiter) = &state.global_limiter {
        let global_decision = global_limiter.check(&remote_ip.to_string(), Instant::now());
        if let RateLimitDecision::Limited { retry_after_secs, limit, reset_secs } = global_decision {
            return rate_limited_response(limit, retry_after_secs, reset_secs);
        }
    }

    let auth_headers = headers_to_auth_headers(&headers);
    let verified = match verify(&state.auth, &auth_headers, &body, Some(remote_ip)) {
        Ok(verified) => verified,
        Err(err) => {
            record_counter(
                "webhook_auth_rejected",
                1,
                &TelemetryLabels { extra: vec![("reason".to_string(), err.reason().to_string())], ..TelemetryLabels::new("unknown") },
            );
            return auth_error_response(err);
        }
    };

    let refresh_hint = auth_headers.get("x-refresh");
    let key = webhook_key(&remote_ip.to_string(), Some(verified.tenant_id.as_str()), refresh_hint);
    let webhook_decision = state.webhook_limiter.check(&key, Instant::now());
    if let RateLimitDecision::Limited { retry_after_secs, limit, reset_secs } = webhook_decision {
        return rate_limited_response(limit, retry_after_secs, reset_secs);
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return with_rate_limit_headers(
                error_response(StatusCode::BAD_REQUEST, "INVALID_WEBHOOK_JSON", "request body is not valid JSON"),
                webhook_decision,
            );
        }
    };

    let overrides = NormalizerOverrides {
        tenant_id: Some(verified.tenant_id.clone()),
        ..Default::default()
    };

    let response = match dispatch_webhook_body(&state.deps, state.pipeline.as_ref(), &overrides, &payload).await {
        Ok(_summary) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(StatusCode::BAD_REQUEST, "INVALID_WEBHOOK_JSON", &err.to_string()),
    };
    with_rate_limit_headers(response, webhook_decision)
}

fn auth_error_response(err: AuthError) -> Response {
    error_response(StatusCode::UNAUTHORIZED, err.code(), &err.to_string())
}

fn rate_limited_response(limit: u32, retry_after_secs: u64, reset_secs: u64) -> Response {
    let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", "rate limit exceeded");
    let headers = response.headers_mut();
    if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
        headers.insert("Retry-After", value);
    }
    insert_rate_limit_headers(headers, limit, 0, reset_secs);
    response
}

/// Attaches `X-RateLimit-{Limit,Remaining,Reset}` per §4.11. Applied to every
/// response the webhook limiter had a say in, success or failure alike.
fn with_rate_limit_headers(mut response: Response, decision: RateLimitDecision) -> Response {
    if let RateLimitDecision::Allowed { limit, remaining, reset_secs } = decision {
        insert_rate_limit_headers(response.headers_mut(), limit, remaining, reset_secs);
    }
    response
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_secs: u64) {
    if let Ok(value) = axum::http::HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = axum::http::HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = axum::http::HeaderValue::from_str(&reset_secs.to_string()) {
        headers.insert("X-RateLimit-Reset", value);
    }
}

async fn healthz() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadengine_wa_security::Headers as AuthHeaders;

    #[test]
    fn verify_handshake_echoes_challenge_when_token_matches() {
        let config = WebhookAuthConfig {
            verify_token: Some("secret".to_string()),
            ..Default::default()
        };
        assert_eq!(
            verify_handshake(&config, Some("secret"), Some("chal-1")),
            Some("chal-1")
        );
        assert_eq!(verify_handshake(&config, Some("wrong"), Some("chal-1")), None);
    }

    #[test]
    fn headers_to_auth_headers_lowercases_names() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Tenant-Id", axum::http::HeaderValue::from_static("tenant-A"));
        let converted = headers_to_auth_headers(&headers);
        assert_eq!(converted.get("x-tenant-id"), Some("tenant-A"));
    }

    #[test]
    fn cors_layer_allows_any_when_unconfigured() {
        std::env::remove_var("CORS_ALLOWED_ORIGINS");
        std::env::remove_var("FRONTEND_URL");
        let _layer = cors_layer_from_env();
    }

    #[test]
    fn is_production_defaults_to_false() {
        std::env::remove_var("NODE_ENV");
        std::env::remove_var("APP_ENV");
        assert!(!is_production());
    }

    #[test]
    fn is_production_reads_node_env_case_insensitively() {
        std::env::remove_var("APP_ENV");
        std::env::set_var("NODE_ENV", "Production");
        assert!(is_production());
        std::env::set_var("NODE_ENV", "staging");
        assert!(!is_production());
        std::env::remove_var("NODE_ENV");
    }

    #[test]
    fn is_production_falls_back_to_app_env() {
        std::env::remove_var("NODE_ENV");
        std::env::set_var("APP_ENV", "production");
        assert!(is_production());
        std::env::remove_var("APP_ENV");
    }

    #[tokio::test]
    async fn global_rate_limiter_blocks_after_threshold() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_secs(60), 1));
        assert!(limiter.check("1.2.3.4", Instant::now()).allowed());
        assert!(!limiter.check("1.2.3.4", Instant::now()).allowed());
    }

    #[test]
    fn auth_error_maps_to_unauthorized() {
        let response = auth_error_response(AuthError::MissingTenant);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn allowed_decision_sets_rate_limit_headers() {
        let response = with_rate_limit_headers(
            (StatusCode::OK, "ok").into_response(),
            RateLimitDecision::Allowed { limit: 120, remaining: 119, reset_secs: 60 },
        );
        let headers = response.headers();
        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "120");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "119");
        assert_eq!(headers.get("X-RateLimit-Reset").unwrap(), "60");
    }

    #[test]
    fn rate_limited_response_sets_retry_after_and_zero_remaining() {
        let response = rate_limited_response(120, 5, 5);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get("Retry-After").unwrap(), "5");
        assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
    }

    #[allow(dead_code)]
    fn assert_headers_type(_: &AuthHeaders) {}
}
