//! Deterministic identifier helpers.
//!
//! The normalizer falls back to a random UUID only when a broker payload
//! truly carries no message id (§4.2 step 5, "Build messageId"). Everywhere
//! else ids are either supplied by the broker or derived deterministically
//! so tests stay reproducible.

use uuid::Uuid;

/// Random v4 UUID prefixed the way the normalizer prefixes its fallback
/// message id (`"wamid-" + uuid()`).
pub fn random_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4())
}

/// Deterministic id derived from a dedupe string, used for entities whose
/// identity should be stable across re-runs (e.g. test fixtures) without
/// depending on wall-clock randomness.
pub fn deterministic_id(prefix: &str, seed: &str) -> String {
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes());
    format!("{prefix}{digest}")
}
