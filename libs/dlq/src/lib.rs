//! Dead-letter sink for `Fatal.PersistenceError` (§7): the inbound pipeline
//! (C6 step 9) routes a message here when the store rejects a persist that
//! isn't a recoverable conflict, and the media retry worker (C10) routes a
//! job here after its fifth failed attempt.
//!
//! ```
//! use leadengine_wa_dlq::{DlqError, DlqRecord, DlqSink, LoggingDlqSink};
//!
//! # fn main() -> anyhow::Result<()> {
//! # let rt = tokio::runtime::Runtime::new()?;
//! rt.block_on(async {
//!     let sink = LoggingDlqSink::default();
//!     sink.publish(DlqRecord::new(
//!         "tenant-A",
//!         "inbound_pipeline",
//!         "wamid-1",
//!         0,
//!         DlqError { code: "E_PERSIST".into(), message: "store unavailable".into(), stage: None },
//!         serde_json::json!({"chatId": "5511999999999"}),
//!     ))
//!     .await
//! })
//! # }
//! ```

use async_trait::async_trait;
use leadengine_wa_telemetry::{TelemetryLabels, record_counter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::error;

/// Error metadata stored alongside each DLQ entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub stage: Option<String>,
}

/// One dead-lettered item. `envelope` keeps the original normalized/raw
/// payload so an operator (or a future replay tool) can re-derive the full
/// context without re-fetching it from the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub tenant_id: String,
    pub stage: String,
    pub msg_id: String,
    pub retries: u32,
    pub timestamp: String,
    pub error: DlqError,
    pub envelope: Value,
}

impl DlqRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        stage: impl Into<String>,
        msg_id: impl Into<String>,
        retries: u32,
        error: DlqError,
        envelope: Value,
    ) -> Self {
        let stage = stage.into();
        Self {
            tenant_id: tenant_id.into(),
            stage: stage.clone(),
            msg_id: msg_id.into(),
            retries,
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string()),
            error: DlqError {
                stage: Some(stage),
                ..error
            },
            envelope,
        }
    }
}

/// Abstraction over wherever dead-lettered records actually land (a queue, a
/// table, a log aggregator). Kept out-of-scope per §1; this crate only
/// defines the contract and a logging fallback.
#[async_trait]
pub trait DlqSink: Send + Sync {
    async fn publish(&self, record: DlqRecord) -> anyhow::Result<()>;
}

pub type SharedDlqSink = std::sync::Arc<dyn DlqSink>;

/// Default sink: structured log line plus a `dlq_published` counter. Used
/// whenever no richer sink (a real queue, a table-backed one in
/// `leadengine-wa-testkit`) is wired up.
#[derive(Debug, Clone, Default)]
pub struct LoggingDlqSink;

#[async_trait]
impl DlqSink for LoggingDlqSink {
    async fn publish(&self, record: DlqRecord) -> anyhow::Result<()> {
        error!(
            tenant_id = %record.tenant_id,
            stage = %record.stage,
            msg_id = %record.msg_id,
            retries = record.retries,
            code = %record.error.code,
            message = %record.error.message,
            "dlq entry published"
        );
        let labels = TelemetryLabels {
            tenant: record.tenant_id.clone(),
            platform: None,
            chat_id: None,
            msg_id: Some(record.msg_id.clone()),
            extra: vec![
                ("stage".to_string(), record.stage.clone()),
                ("code".to_string(), record.error.code.clone()),
            ],
        };
        record_counter("dlq_published", 1, &labels);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_sink_accepts_record() {
        let sink = LoggingDlqSink;
        let record = DlqRecord::new(
            "tenant-A",
            "inbound_pipeline",
            "wamid-1",
            2,
            DlqError {
                code: "E_PERSIST".into(),
                message: "store unavailable".into(),
                stage: None,
            },
            serde_json::json!({"chatId": "5511999999999"}),
        );
        assert_eq!(record.error.stage.as_deref(), Some("inbound_pipeline"));
        sink.publish(record).await.unwrap();
    }

    #[test]
    fn record_roundtrips_json() {
        let record = DlqRecord::new(
            "tenant-A",
            "media_retry_worker",
            "job-1",
            5,
            DlqError {
                code: "E_MEDIA_DOWNLOAD".into(),
                message: "broker timeout".into(),
                stage: None,
            },
            serde_json::json!({"mediaKey": "abc"}),
        );
        let serialized = serde_json::to_string(&record).unwrap();
        let parsed: DlqRecord = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed.msg_id, "job-1");
        assert_eq!(parsed.retries, 5);
        assert_eq!(parsed.error.code, "E_MEDIA_DOWNLOAD");
    }
}
