//! ACK state machine (C7). Enforces monotone delivery-status transitions on
//! outbound messages and drops stale or out-of-order updates rather than
//! applying them, per §4.7.

use leadengine_wa_core::{AckUpdate, Message, MessageStatus, RealtimeBus, Store};
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};

use crate::error::AckError;
use crate::realtime::{self, EVENT_MESSAGE_UPDATED};

/// An ACK is dropped when its `received_at` precedes the stored
/// `last_ack.received_at` by more than this much — see §8's "order
/// independence of ACKs" property.
pub const LATE_ACK_THRESHOLD: Duration = Duration::minutes(10);

/// One inbound delivery-status update, already resolved to a `(tenant_id,
/// external_id)` pair by the event dispatcher (C5). `fromMe == true` on the
/// source key is assumed to have been checked upstream: only outbound
/// messages are ever looked up by `find_outbound_message_by_external_id`.
#[derive(Debug, Clone)]
pub struct IncomingAck {
    pub external_id: String,
    pub status: MessageStatus,
    pub metadata: Value,
    pub instance_id: Option<String>,
    pub delivered_at: Option<OffsetDateTime>,
    pub read_at: Option<OffsetDateTime>,
    pub received_at: OffsetDateTime,
}

/// Runs the C7 algorithm, applying `ack` to the outbound message it targets.
/// Returns the error reason when the ACK is dropped; the caller counts and
/// logs it, never re-raising (§4.5 step 4).
pub async fn apply_ack(
    store: &dyn Store,
    realtime: &dyn RealtimeBus,
    tenant_id: &str,
    ack: IncomingAck,
) -> Result<Message, AckError> {
    let message = store
        .find_outbound_message_by_external_id(tenant_id, &ack.external_id)
        .await?
        .ok_or_else(|| AckError::MessageNotFound {
            tenant_id: tenant_id.to_string(),
            message_id: ack.external_id.clone(),
        })?;

    if let Some(last) = store.last_ack(tenant_id, &message.id).await? {
        if ack.received_at < last.received_at - LATE_ACK_THRESHOLD {
            return Err(AckError::Late);
        }
    }

    let current_rank = message.status.rank();
    let incoming_rank = ack.status.rank();
    if ack.status != MessageStatus::Failed && incoming_rank < current_rank {
        return Err(AckError::Regression { incoming_rank, current_rank });
    }

    let prior_status = message.status;
    let updated = store
        .apply_broker_ack(
            tenant_id,
            &message.id,
            AckUpdate {
                status: ack.status,
                metadata: ack.metadata,
                instance_id: ack.instance_id,
                delivered_at: ack.delivered_at,
                read_at: ack.read_at,
            },
        )
        .await?;

    let payload = json!({
        "tenantId": tenant_id,
        "ticketId": updated.ticket_id,
        "message": updated,
        "priorStatus": prior_status,
    });
    realtime::emit(realtime, tenant_id, Some(&updated.ticket_id), None, EVENT_MESSAGE_UPDATED, payload).await;

    Ok(updated)
}
