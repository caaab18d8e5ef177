//! Webhook Authenticator (C4). Pure functions over an explicit
//! [`Headers`] map and raw body bytes — no `axum` dependency here so this
//! crate stays usable from any transport; `apps/webhook-ingress` builds
//! [`Headers`] from its own request and maps [`AuthError`] onto the §6 HTTP
//! responses at its outermost boundary.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Case-insensitive header lookup. Callers insert whatever headers their
/// transport exposes; lookups are always lower-cased.
#[derive(Debug, Clone, Default)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebhookAuthConfig {
    pub api_key: Option<String>,
    pub trusted_ips: HashSet<IpAddr>,
    pub signature_secret: Option<String>,
    pub signature_required: bool,
    pub verify_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRequest {
    pub tenant_id: String,
    pub signature_verified: bool,
}

/// One variant per `Auth.*` error kind named in §7.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingAuthorization,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("could not resolve tenant id")]
    MissingTenant,
    #[error("invalid webhook signature")]
    InvalidSignature,
}

impl AuthError {
    /// Machine-readable reason, used both for the §7 JSON error body and the
    /// `{...,reason}` counter label in §4.5 step 4.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingAuthorization => "missing_authorization",
            AuthError::InvalidApiKey => "invalid_api_key",
            AuthError::MissingTenant => "missing_tenant",
            AuthError::InvalidSignature => "invalid_signature",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingAuthorization => "MISSING_AUTHORIZATION",
            AuthError::InvalidApiKey => "INVALID_API_KEY",
            AuthError::MissingTenant => "MISSING_TENANT",
            AuthError::InvalidSignature => "INVALID_SIGNATURE",
        }
    }
}

/// §4.4 steps 1-4. `raw_body` must be the untouched request body, captured
/// before any JSON parsing, so the HMAC check sees exactly what the sender
/// signed.
pub fn verify(
    config: &WebhookAuthConfig,
    headers: &Headers,
    raw_body: &[u8],
    remote_ip: Option<IpAddr>,
) -> Result<VerifiedRequest, AuthError> {
    let bearer = extract_bearer(headers).ok_or(AuthError::MissingAuthorization)?;

    let ip_trusted = remote_ip
        .map(|ip| config.trusted_ips.contains(&ip))
        .unwrap_or(false);
    if !ip_trusted {
        if let Some(expected) = &config.api_key {
            let candidate = headers
                .get("x-webhook-token")
                .or_else(|| headers.get("x-api-key"))
                .unwrap_or(bearer.as_str());
            if !constant_time_eq_str(expected, candidate) {
                return Err(AuthError::InvalidApiKey);
            }
        }
    }

    let tenant_id = resolve_tenant(headers, &bearer).ok_or(AuthError::MissingTenant)?;

    let mut signature_verified = false;
    if config.signature_required {
        let secret = config
            .signature_secret
            .as_deref()
            .ok_or(AuthError::InvalidSignature)?;
        let provided = headers
            .get("x-webhook-signature")
            .or_else(|| headers.get("x-hub-signature-256"))
            .ok_or(AuthError::InvalidSignature)?;
        if !verify_hmac_hex(secret, raw_body, provided) {
            return Err(AuthError::InvalidSignature);
        }
        signature_verified = true;
    }

    Ok(VerifiedRequest {
        tenant_id,
        signature_verified,
    })
}

/// `GET` verification handshake (§6): compares `hub.verify_token` against
/// the configured value in constant time and echoes `hub.challenge` on
/// success.
pub fn verify_handshake<'a>(
    config: &WebhookAuthConfig,
    provided_token: Option<&str>,
    challenge: Option<&'a str>,
) -> Option<&'a str> {
    let expected = config.verify_token.as_deref()?;
    let provided = provided_token?;
    let challenge = challenge?;
    if constant_time_eq_str(expected, provided) {
        Some(challenge)
    } else {
        None
    }
}

fn extract_bearer(headers: &Headers) -> Option<String> {
    let raw = headers
        .get("authorization")
        .or_else(|| headers.get("x-authorization"))?;
    let trimmed = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// §4.4 step 3 cascade: `X-Tenant-Id` header, then JWT claims
/// (`tenantId|tenant|subTenant`), then a `tenant:<id>` segment embedded in
/// the token itself.
fn resolve_tenant(headers: &Headers, bearer: &str) -> Option<String> {
    if let Some(tenant) = headers.get("x-tenant-id") {
        if !tenant.is_empty() {
            return Some(tenant.to_string());
        }
    }
    if let Some(claims) = decode_jwt_claims_unverified(bearer) {
        for key in ["tenantId", "tenant", "subTenant"] {
            if let Some(value) = claims.get(key).and_then(|v| v.as_str()) {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    resolve_tenant_from_token_suffix(bearer)
}

/// `tenant:<id>` may appear anywhere in the token, separated by `:` or `/`
/// from the rest (e.g. `abc123:tenant:acme`, `abc123/tenant:acme`).
fn resolve_tenant_from_token_suffix(token: &str) -> Option<String> {
    let idx = token.find("tenant:")?;
    let rest = &token[idx + "tenant:".len()..];
    let end = rest.find([':', '/']).unwrap_or(rest.len());
    let value = &rest[..end];
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Decodes a JWT's payload segment without verifying its signature — this
/// is only used to read an already-trusted bearer token's claims for tenant
/// resolution, not to authenticate the request.
fn decode_jwt_claims_unverified(token: &str) -> Option<serde_json::Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    use base64::Engine as _;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    serde_json::from_slice(&decoded).ok()
}

fn verify_hmac_hex(secret: &str, body: &[u8], provided: &str) -> bool {
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    let Ok(provided_bytes) = hex::decode(provided) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();
    computed.as_slice().ct_eq(&provided_bytes).into()
}

fn constant_time_eq_str(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_authorization_is_rejected() {
        let config = WebhookAuthConfig::default();
        let headers = Headers::new();
        let err = verify(&config, &headers, b"{}", None).unwrap_err();
        assert_eq!(err, AuthError::MissingAuthorization);
        assert_eq!(err.reason(), "missing_authorization");
    }

    #[test]
    fn invalid_api_key_is_rejected_when_not_trusted() {
        let config = WebhookAuthConfig {
            api_key: Some("expected-key".to_string()),
            ..Default::default()
        };
        let headers = headers_with(&[("authorization", "Bearer tok"), ("x-api-key", "wrong")]);
        let err = verify(&config, &headers, b"{}", None).unwrap_err();
        assert_eq!(err, AuthError::InvalidApiKey);
    }

    #[test]
    fn trusted_ip_skips_api_key_check() {
        let config = WebhookAuthConfig {
            api_key: Some("expected-key".to_string()),
            trusted_ips: [("10.0.0.5".parse().unwrap())].into_iter().collect(),
            ..Default::default()
        };
        let headers = headers_with(&[
            ("authorization", "Bearer tok"),
            ("x-tenant-id", "tenant-A"),
        ]);
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let verified = verify(&config, &headers, b"{}", Some(ip)).unwrap();
        assert_eq!(verified.tenant_id, "tenant-A");
    }

    #[test]
    fn tenant_resolved_from_header() {
        let config = WebhookAuthConfig::default();
        let headers = headers_with(&[
            ("authorization", "Bearer tok"),
            ("x-tenant-id", "tenant-A"),
        ]);
        let verified = verify(&config, &headers, b"{}", None).unwrap();
        assert_eq!(verified.tenant_id, "tenant-A");
        assert!(!verified.signature_verified);
    }

    #[test]
    fn tenant_resolved_from_token_suffix_when_no_header() {
        let config = WebhookAuthConfig::default();
        let headers = headers_with(&[("authorization", "Bearer abc123:tenant:acme")]);
        let verified = verify(&config, &headers, b"{}", None).unwrap();
        assert_eq!(verified.tenant_id, "acme");
    }

    #[test]
    fn missing_tenant_is_rejected() {
        let config = WebhookAuthConfig::default();
        let headers = headers_with(&[("authorization", "Bearer opaque-token")]);
        let err = verify(&config, &headers, b"{}", None).unwrap_err();
        assert_eq!(err, AuthError::MissingTenant);
    }

    #[test]
    fn signature_required_checks_hmac_over_raw_body() {
        let body = br#"{"hello":"world"}"#;
        let mut mac = HmacSha256::new_from_slice(b"shh").unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        let config = WebhookAuthConfig {
            signature_secret: Some("shh".to_string()),
            signature_required: true,
            ..Default::default()
        };
        let headers = headers_with(&[
            ("authorization", "Bearer tok"),
            ("x-tenant-id", "tenant-A"),
            ("x-webhook-signature", sig.as_str()),
        ]);
        let verified = verify(&config, &headers, body, None).unwrap();
        assert!(verified.signature_verified);
    }

    #[test]
    fn tampered_body_fails_signature_check() {
        let mut mac = HmacSha256::new_from_slice(b"shh").unwrap();
        mac.update(b"original");
        let sig = hex::encode(mac.finalize().into_bytes());

        let config = WebhookAuthConfig {
            signature_secret: Some("shh".to_string()),
            signature_required: true,
            ..Default::default()
        };
        let headers = headers_with(&[
            ("authorization", "Bearer tok"),
            ("x-tenant-id", "tenant-A"),
            ("x-webhook-signature", sig.as_str()),
        ]);
        let err = verify(&config, &headers, b"tampered", None).unwrap_err();
        assert_eq!(err, AuthError::InvalidSignature);
    }

    #[test]
    fn handshake_echoes_challenge_on_matching_token() {
        let config = WebhookAuthConfig {
            verify_token: Some("secret-token".to_string()),
            ..Default::default()
        };
        assert_eq!(
            verify_handshake(&config, Some("secret-token"), Some("challenge-1")),
            Some("challenge-1")
        );
        assert_eq!(verify_handshake(&config, Some("wrong"), Some("challenge-1")), None);
    }
}
