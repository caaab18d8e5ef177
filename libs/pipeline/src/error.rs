//! Typed errors for every pipeline stage. Each carries the fields needed for
//! the structured log line; the webhook app maps these onto the §6 HTTP
//! responses and the §7 JSON error shape at its outermost boundary only.

use thiserror::Error;

/// Raised by the ACK state machine (C7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("message {message_id} not found for tenant {tenant_id}")]
    MessageNotFound { tenant_id: String, message_id: String },
    #[error("ack regression: incoming rank {incoming_rank} < current rank {current_rank}")]
    Regression { incoming_rank: u8, current_rank: u8 },
    #[error("ack late: received_at precedes stored last_ack by more than the allowed threshold")]
    Late,
    #[error("store error: {0}")]
    Store(#[from] leadengine_wa_core::StoreError),
}

impl AckError {
    pub fn reason(&self) -> &'static str {
        match self {
            AckError::MessageNotFound { .. } => "ack_unknown_message",
            AckError::Regression { .. } => "ack_regression",
            AckError::Late => "ack_late",
            AckError::Store(_) => "ack_store_error",
        }
    }
}

/// Raised by the poll reconciler (C8).
#[derive(Debug, Error)]
pub enum PollError {
    #[error("store error: {0}")]
    Store(#[from] leadengine_wa_core::StoreError),
}

impl PollError {
    pub fn reason(&self) -> &'static str {
        match self {
            PollError::Store(_) => "poll_store_error",
        }
    }
}

/// Raised by the inbound pipeline (C6).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no instance could be resolved or auto-provisioned")]
    InstanceUnresolved,
    #[error("inbound queue for tenant {tenant_id} could not be resolved")]
    QueueUnresolved { tenant_id: String },
    #[error("persistence failed while creating the message: {0}")]
    PersistenceFailed(leadengine_wa_core::StoreError),
    #[error("store error: {0}")]
    Store(#[from] leadengine_wa_core::StoreError),
}

impl PipelineError {
    pub fn reason(&self) -> &'static str {
        match self {
            PipelineError::InstanceUnresolved => "instance_unresolved",
            PipelineError::QueueUnresolved { .. } => "queue_unresolved",
            PipelineError::PersistenceFailed(_) => "persistence_failed",
            PipelineError::Store(_) => "store_error",
        }
    }
}

/// Raised by the event dispatcher (C5).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("event body is not a JSON object or array")]
    InvalidShape,
}

impl DispatchError {
    pub fn reason(&self) -> &'static str {
        match self {
            DispatchError::InvalidShape => "invalid_webhook_json",
        }
    }
}

/// Raised by the media retry worker's pipeline-side collaborators (C10).
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("broker download failed: {0}")]
    DownloadFailed(String),
    #[error("store error: {0}")]
    Store(#[from] leadengine_wa_core::StoreError),
}

impl MediaError {
    pub fn reason(&self) -> &'static str {
        match self {
            MediaError::DownloadFailed(_) => "media_download_failed",
            MediaError::Store(_) => "media_store_error",
        }
    }
}
