//! Realtime emitter (C9). Wraps a [`RealtimeBus`] with a bounded timeout so
//! a slow or blocked subscriber transport never stalls the inbound
//! pipeline; timeouts and send failures are logged and counted but never
//! propagated as pipeline errors (§4.9).

use std::time::Duration;

use leadengine_wa_core::RealtimeBus;
use leadengine_wa_telemetry::{record_counter, TelemetryLabels};
use serde_json::Value;
use tracing::warn;

/// Default bound on how long a single emission may take before it is
/// abandoned (not retried — the bus is fire-and-forget by contract).
pub const DEFAULT_EMIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Closed set of realtime event names this crate ever emits (§4.9, §6).
pub const EVENT_TICKET_MESSAGES_NEW: &str = "ticketMessages.new";
pub const EVENT_TICKETS_NEW: &str = "tickets.new";
pub const EVENT_TICKETS_UPDATED: &str = "tickets.updated";
pub const EVENT_LEAD_ACTIVITIES_NEW: &str = "leadActivities.new";
pub const EVENT_LEAD_ALLOCATIONS_NEW: &str = "leadAllocations.new";
pub const EVENT_LEADS_UPDATED: &str = "leads.updated";
pub const EVENT_MESSAGE_UPDATED: &str = "messageUpdated";

async fn bounded<F: std::future::Future<Output = ()>>(event: &str, fut: F) {
    match tokio::time::timeout(DEFAULT_EMIT_TIMEOUT, fut).await {
        Ok(()) => {}
        Err(_) => {
            warn!(event, "realtime emit timed out");
            record_counter("realtime_emit_timeout", 1, &TelemetryLabels::new("unknown"));
        }
    }
}

/// Emits `event` to the tenant, ticket, and (when present) agreement
/// channels, each independently bounded by [`DEFAULT_EMIT_TIMEOUT`].
pub async fn emit(
    bus: &dyn RealtimeBus,
    tenant_id: &str,
    ticket_id: Option<&str>,
    agreement_id: Option<&str>,
    event: &str,
    payload: Value,
) {
    bounded(event, bus.emit_to_tenant(tenant_id, event, payload.clone())).await;
    if let Some(ticket_id) = ticket_id {
        bounded(event, bus.emit_to_ticket(ticket_id, event, payload.clone())).await;
    }
    if let Some(agreement_id) = agreement_id {
        bounded(event, bus.emit_to_agreement(agreement_id, event, payload)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadengine_wa_testkit::InMemoryRealtimeBus;

    #[tokio::test]
    async fn emit_fans_out_to_every_channel() {
        let bus = InMemoryRealtimeBus::new();
        emit(
            &bus,
            "tenant-A",
            Some("ticket-1"),
            Some("agreement-1"),
            EVENT_MESSAGE_UPDATED,
            serde_json::json!({"ok": true}),
        )
        .await;
        assert_eq!(bus.events().await.len(), 3);
    }
}
