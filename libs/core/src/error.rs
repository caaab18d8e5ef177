use thiserror::Error;

/// Errors raised by a [`crate::Store`] implementation.
///
/// `Conflict` and `NotFound` are recoverable by callers (re-read the
/// existing row, or auto-provision); `Unavailable` models the in-memory
/// degraded mode entered when `DATABASE_URL` is absent, which rejects writes
/// with a well-known error rather than silently dropping them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {entity}: {detail}")]
    Conflict {
        entity: &'static str,
        detail: String,
        existing_id: Option<String>,
    },
    #[error("{entity} not found: {detail}")]
    NotFound { entity: &'static str, detail: String },
    #[error("store is in degraded (in-memory, read-only) mode: {0}")]
    Unavailable(String),
    #[error("persistence error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn conflict(entity: &'static str, detail: impl Into<String>) -> Self {
        StoreError::Conflict {
            entity,
            detail: detail.into(),
            existing_id: None,
        }
    }

    pub fn conflict_with(
        entity: &'static str,
        detail: impl Into<String>,
        existing_id: impl Into<String>,
    ) -> Self {
        StoreError::Conflict {
            entity,
            detail: detail.into(),
            existing_id: Some(existing_id.into()),
        }
    }

    pub fn not_found(entity: &'static str, detail: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            detail: detail.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// The single user-visible JSON error shape mandated by §7: every HTTP
/// rejection the webhook app emits serializes to this envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: ErrorDetail,
    pub meta: ErrorMeta,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMeta {
    pub trace_id: String,
    pub timestamp: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        let timestamp = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
        ErrorBody {
            success: false,
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
            meta: ErrorMeta {
                trace_id: trace_id.into(),
                timestamp,
            },
        }
    }
}
