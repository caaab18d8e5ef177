//! Webhook authentication (C4) and rate limiting (C11). Both modules are
//! pure/transport-agnostic; `apps/webhook-ingress` is the only crate that
//! knows about `axum` and maps these types onto HTTP.

mod auth;
mod rate_limit;

pub use auth::{AuthError, Headers, VerifiedRequest, WebhookAuthConfig, verify, verify_handshake};
pub use rate_limit::{RateLimitDecision, RateLimiter, RateLimiterConfig, webhook_key};
