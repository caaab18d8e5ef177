//! Event dispatcher (C5): the single entry point the webhook app calls with
//! a parsed JSON body. Unwraps the envelope, branches on event type, and
//! fans each entry out to the ACK machine (C7), poll reconciler (C8), or
//! normalizer + inbound pipeline (C2 + C6), per §4.5.

use leadengine_wa_core::MessageStatus;
use leadengine_wa_normalizer::{normalize_upsert, NormalizerOverrides};
use leadengine_wa_telemetry::{record_counter, TelemetryLabels};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;

use crate::ack::{self, IncomingAck};
use crate::error::DispatchError;
use crate::inbound;
use crate::poll::{self, IncomingPollChoice};
use crate::state::PipelineState;
use crate::PipelineDeps;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Accepted,
    Ignored,
    Rejected,
    Failed,
}

#[derive(Debug, Clone)]
pub struct EventOutcome {
    pub result: DispatchResult,
    pub reason: &'static str,
}

/// Summary returned to the webhook app so it can answer `200
/// {ok:true,received,persisted}` (or just `204`) per §6.
#[derive(Debug, Default, Clone)]
pub struct DispatchSummary {
    pub received: usize,
    pub persisted: usize,
    pub outcomes: Vec<EventOutcome>,
}

impl DispatchSummary {
    fn record(&mut self, outcome: EventOutcome) {
        if outcome.result == DispatchResult::Accepted {
            self.persisted += 1;
        }
        self.outcomes.push(outcome);
    }
}

/// Runs the C5 algorithm over an entire webhook body (one event, or an
/// array of events). Never fails once the body's outer shape is valid: per
/// §4.5 step 5, every per-entry failure is counted and logged, never
/// re-raised, so the caller can always answer with a success status.
pub async fn dispatch_webhook_body(
    deps: &PipelineDeps,
    state: &PipelineState,
    overrides: &NormalizerOverrides,
    body: &Value,
) -> Result<DispatchSummary, DispatchError> {
    let events = extract_events(body).ok_or(DispatchError::InvalidShape)?;
    let mut summary = DispatchSummary::default();
    for event in &events {
        summary.received += 1;
        for outcome in dispatch_event(deps, state, overrides, event).await {
            record_counter(
                "webhook_event",
                1,
                &TelemetryLabels {
                    extra: vec![
                        ("result".to_string(), format!("{:?}", outcome.result)),
                        ("reason".to_string(), outcome.reason.to_string()),
                    ],
                    ..TelemetryLabels::new(overrides.tenant_id.clone().unwrap_or_else(|| "unknown".to_string()))
                },
            );
            summary.record(outcome);
        }
    }
    Ok(summary)
}

fn extract_events(body: &Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(entries) => Some(entries.clone()),
        Value::Object(_) => Some(vec![body.clone()]),
        _ => None,
    }
}

async fn dispatch_event(
    deps: &PipelineDeps,
    state: &PipelineState,
    overrides: &NormalizerOverrides,
    event: &Value,
) -> Vec<EventOutcome> {
    let event_type = event
        .get("type")
        .and_then(Value::as_str)
        .or_else(|| event.get("event").and_then(Value::as_str));

    match event_type {
        Some("WHATSAPP_MESSAGES_UPDATE") => dispatch_ack(deps, overrides, event).await,
        Some("POLL_CHOICE") => vec![dispatch_poll_choice(deps, state, overrides, event).await],
        Some("MESSAGE_INBOUND") | Some("MESSAGE_OUTBOUND") => {
            // Open Question 3 (§9): contract events and raw upsert events are
            // unified after the normalizer, so they share the C2 code path.
            let mut contract_event = event.clone();
            contract_event["type"] = Value::String("WHATSAPP_MESSAGES_UPSERT".to_string());
            dispatch_upsert(deps, state, overrides, &contract_event, event).await
        }
        Some("WHATSAPP_MESSAGES_UPSERT") | None => dispatch_upsert(deps, state, overrides, event, event).await,
        Some(_other) => vec![EventOutcome { result: DispatchResult::Ignored, reason: "unsupported_event" }],
    }
}

async fn dispatch_upsert(
    deps: &PipelineDeps,
    state: &PipelineState,
    overrides: &NormalizerOverrides,
    normalizer_event: &Value,
    raw_event: &Value,
) -> Vec<EventOutcome> {
    let outcome = normalize_upsert(normalizer_event, overrides);
    let mut outcomes = Vec::with_capacity(outcome.messages.len() + outcome.ignored.len());
    for ignored in &outcome.ignored {
        outcomes.push(EventOutcome { result: DispatchResult::Ignored, reason: ignored.reason });
    }
    for message in &outcome.messages {
        let inbound_outcome = inbound::process_inbound_message(deps, state, message, raw_event).await;
        let result = if inbound_outcome.reason == "message_duplicate" {
            DispatchResult::Ignored
        } else if inbound_outcome.persisted {
            DispatchResult::Accepted
        } else {
            DispatchResult::Failed
        };
        outcomes.push(EventOutcome { result, reason: inbound_outcome.reason });
    }
    outcomes
}

async fn dispatch_ack(deps: &PipelineDeps, overrides: &NormalizerOverrides, event: &Value) -> Vec<EventOutcome> {
    let Some(tenant_id) = event
        .get("tenantId")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| overrides.tenant_id.clone())
    else {
        return vec![EventOutcome { result: DispatchResult::Rejected, reason: "missing_tenant" }];
    };

    let updates = event
        .get("updates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_else(|| vec![event.clone()]);

    let mut outcomes = Vec::with_capacity(updates.len());
    for update in &updates {
        let Some(ack) = extract_ack(update) else {
            outcomes.push(EventOutcome { result: DispatchResult::Rejected, reason: "invalid_webhook_json" });
            continue;
        };
        match ack::apply_ack(deps.store.as_ref(), deps.realtime.as_ref(), &tenant_id, ack).await {
            Ok(_) => outcomes.push(EventOutcome { result: DispatchResult::Accepted, reason: "ack_applied" }),
            Err(err) => {
                warn!(tenant_id, reason = err.reason(), "ack dropped");
                outcomes.push(EventOutcome { result: DispatchResult::Rejected, reason: err.reason() });
            }
        }
    }
    outcomes
}

async fn dispatch_poll_choice(
    deps: &PipelineDeps,
    state: &PipelineState,
    overrides: &NormalizerOverrides,
    event: &Value,
) -> EventOutcome {
    let Some(choice) = extract_poll_choice(event, overrides.tenant_id.as_deref()) else {
        return EventOutcome { result: DispatchResult::Rejected, reason: "invalid_webhook_json" };
    };
    match poll::reconcile_poll_choice(deps.store.as_ref(), deps.realtime.as_ref(), state, choice).await {
        Ok(true) => EventOutcome { result: DispatchResult::Accepted, reason: "poll_reconciled" },
        Ok(false) => EventOutcome { result: DispatchResult::Ignored, reason: "poll_vote_message_not_found" },
        Err(err) => {
            warn!(reason = err.reason(), "poll reconciliation failed");
            EventOutcome { result: DispatchResult::Failed, reason: err.reason() }
        }
    }
}

fn extract_ack(event: &Value) -> Option<IncomingAck> {
    let external_id = event
        .get("externalId")
        .and_then(Value::as_str)
        .or_else(|| event.get("key").and_then(|k| k.get("id")).and_then(Value::as_str))?
        .to_string();
    let status = event.get("status").and_then(Value::as_str).and_then(parse_status)?;
    let received_at = parse_timestamp(event.get("receivedAt").or_else(|| event.get("timestamp")))
        .unwrap_or_else(OffsetDateTime::now_utc);

    Some(IncomingAck {
        external_id,
        status,
        metadata: event.get("metadata").cloned().unwrap_or_else(|| serde_json::json!({})),
        instance_id: event.get("instanceId").and_then(Value::as_str).map(String::from),
        delivered_at: parse_timestamp(event.get("deliveredAt")),
        read_at: parse_timestamp(event.get("readAt")),
        received_at,
    })
}

fn extract_poll_choice(event: &Value, tenant_hint: Option<&str>) -> Option<IncomingPollChoice> {
    let tenant_id = event
        .get("tenantId")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| tenant_hint.map(String::from))?;
    let poll_id = event.get("pollId").and_then(Value::as_str)?.to_string();
    let voter_jid = event
        .get("voterJid")
        .and_then(Value::as_str)
        .or_else(|| event.get("participant").and_then(Value::as_str))?
        .to_string();
    let option_ids = event
        .get("optionIds")
        .or_else(|| event.get("selectedOptions"))
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();
    let message_id = event.get("messageId").and_then(Value::as_str).unwrap_or_default().to_string();
    let timestamp = parse_timestamp(event.get("timestamp")).unwrap_or_else(OffsetDateTime::now_utc);
    let chat_id = event.get("chatId").and_then(Value::as_str).map(String::from);
    let encrypted = event.get("encrypted").and_then(Value::as_bool).unwrap_or(false);

    Some(IncomingPollChoice { tenant_id, poll_id, chat_id, voter_jid, option_ids, message_id, timestamp, encrypted })
}

fn parse_status(raw: &str) -> Option<MessageStatus> {
    match raw.to_ascii_uppercase().as_str() {
        "PENDING" => Some(MessageStatus::Pending),
        "SENT" => Some(MessageStatus::Sent),
        "DELIVERED" => Some(MessageStatus::Delivered),
        "READ" => Some(MessageStatus::Read),
        "FAILED" => Some(MessageStatus::Failed),
        _ => None,
    }
}

fn parse_timestamp(value: Option<&Value>) -> Option<OffsetDateTime> {
    match value {
        Some(Value::Number(n)) => n.as_i64().and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok()),
        Some(Value::String(s)) => OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadengine_wa_testkit::TestHarness;
    use serde_json::json;
    use std::sync::Arc;

    fn deps(h: &TestHarness) -> PipelineDeps {
        PipelineDeps {
            store: h.shared_store(),
            broker: h.shared_broker(),
            media_store: h.shared_media_store(),
            realtime: h.shared_realtime(),
            provisioner: h.shared_provisioner(),
            allocator: h.shared_allocator(),
            dlq: Arc::new(leadengine_wa_dlq::LoggingDlqSink),
        }
    }

    #[tokio::test]
    async fn inbound_text_message_is_dispatched_and_persisted() {
        let h = TestHarness::new();
        let d = deps(&h);
        let state = PipelineState::new();
        let overrides = NormalizerOverrides::default();

        let body = json!({
            "type": "WHATSAPP_MESSAGES_UPSERT",
            "instanceId": "inst-1",
            "tenantId": "tenant-A",
            "messages": [
                {
                    "key": { "remoteJid": "5511999999999@s.whatsapp.net", "fromMe": false, "id": "WAID1" },
                    "message": { "conversation": "Ol\u{00e1}" },
                    "messageTimestamp": 1_700_000_000,
                }
            ],
        });

        let summary = dispatch_webhook_body(&d, &state, &overrides, &body).await.unwrap();
        assert_eq!(summary.received, 1);
        assert_eq!(summary.persisted, 1);
        assert_eq!(h.store.message_count(), 1);
        assert_eq!(h.store.ticket_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_upsert_is_suppressed() {
        let h = TestHarness::new();
        let d = deps(&h);
        let state = PipelineState::new();
        let overrides = NormalizerOverrides::default();

        let body = json!({
            "type": "WHATSAPP_MESSAGES_UPSERT",
            "instanceId": "inst-1",
            "tenantId": "tenant-A",
            "messages": [
                {
                    "key": { "remoteJid": "5511999999999@s.whatsapp.net", "fromMe": false, "id": "WAID-dup" },
                    "message": { "conversation": "hi" },
                }
            ],
        });

        dispatch_webhook_body(&d, &state, &overrides, &body).await.unwrap();
        let second = dispatch_webhook_body(&d, &state, &overrides, &body).await.unwrap();

        assert_eq!(h.store.message_count(), 1);
        assert_eq!(second.outcomes[0].reason, "message_duplicate");
    }

    #[tokio::test]
    async fn unsupported_event_type_is_ignored() {
        let h = TestHarness::new();
        let d = deps(&h);
        let state = PipelineState::new();
        let overrides = NormalizerOverrides::default();

        let body = json!({ "type": "SOMETHING_ELSE" });
        let summary = dispatch_webhook_body(&d, &state, &overrides, &body).await.unwrap();
        assert_eq!(summary.outcomes[0].reason, "unsupported_event");
    }

    #[tokio::test]
    async fn non_object_non_array_body_is_rejected() {
        let h = TestHarness::new();
        let d = deps(&h);
        let state = PipelineState::new();
        let overrides = NormalizerOverrides::default();

        let body = json!("not an event");
        let err = dispatch_webhook_body(&d, &state, &overrides, &body).await.unwrap_err();
        assert_eq!(err.reason(), "invalid_webhook_json");
    }
}
