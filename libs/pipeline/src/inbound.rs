//! Inbound pipeline (C6): takes one normalized message and an instance of
//! its raw event, and carries it through instance/tenant/queue/contact/
//! ticket resolution, media handling, dedupe, persistence, realtime
//! fan-out, lead sync, and campaign allocation, per §4.6's thirteen stages.

use std::time::Duration;

use leadengine_wa_core::{
    Allocation, Contact, ContactAttrs, DownloadedMedia, Instance, LeadActivityKind, MediaJob,
    MediaJobState, Message, MessageDirection, MessageStatus, MessageType, NewMessage, Queue,
    StoreError, Ticket, TicketStatus,
};
use leadengine_wa_dedupe::{idempotency_key, DEFAULT_TTL};
use leadengine_wa_dlq::DlqRecord;
use leadengine_wa_normalizer::NormalizedMessage;
use leadengine_wa_telemetry::{record_counter, TelemetryLabels};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::warn;

use crate::realtime::{
    self, EVENT_LEAD_ACTIVITIES_NEW, EVENT_LEAD_ALLOCATIONS_NEW, EVENT_LEADS_UPDATED, EVENT_TICKETS_NEW,
    EVENT_TICKETS_UPDATED, EVENT_TICKET_MESSAGES_NEW,
};
use crate::state::PipelineState;
use crate::PipelineDeps;

/// Outcome of running the C6 algorithm on one normalized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundOutcome {
    pub persisted: bool,
    pub reason: &'static str,
}

impl InboundOutcome {
    fn accepted(reason: &'static str) -> Self {
        Self { persisted: true, reason }
    }

    fn parked(reason: &'static str) -> Self {
        Self { persisted: false, reason }
    }
}

/// Runs the C6 algorithm end to end. Never returns an error: every failure
/// mode is logged, counted, and folded into the returned [`InboundOutcome`]
/// (§4.5 step 5, §4.6 "Failure semantics").
pub async fn process_inbound_message(
    deps: &PipelineDeps,
    state: &PipelineState,
    message: &NormalizedMessage,
    raw_event: &Value,
) -> InboundOutcome {
    let Some(instance) = resolve_instance(deps, message).await else {
        warn!(instance_id = %message.instance_id, "could not resolve or auto-provision an instance");
        return InboundOutcome::parked("instance_unresolved");
    };

    let tenant_id = instance.tenant_id.clone();

    let Some(queue) = resolve_queue(deps, state, &tenant_id).await else {
        warn!(tenant_id, "could not resolve an inbound queue");
        return InboundOutcome::parked("queue_unresolved");
    };

    let contact = match resolve_contact(deps, &tenant_id, message).await {
        Ok(contact) => contact,
        Err(err) => {
            warn!(tenant_id, error = %err, "failed to resolve contact");
            return InboundOutcome::parked("contact_unresolved");
        }
    };

    let (ticket, ticket_is_new) = match resolve_ticket(deps, state, &tenant_id, &contact, &queue, message).await {
        Ok(result) => result,
        Err(err) => {
            warn!(tenant_id, error = %err, "failed to resolve ticket");
            return InboundOutcome::parked("ticket_unresolved");
        }
    };

    if message.message_type == MessageType::Poll {
        if let Err(err) = record_poll_creation(deps, &tenant_id, &instance, message).await {
            warn!(tenant_id, error = %err, "poll-creation side effect failed, continuing anyway");
        }
    }

    let media = resolve_media(deps, &tenant_id, &instance, message).await;

    let key = idempotency_key(&tenant_id, &instance.id, &message.message_id, message.message_index);
    if state.dedupe.skip(&key, DEFAULT_TTL).await {
        record_counter("message_ignored", 1, &TelemetryLabels::new(tenant_id.clone()));
        return InboundOutcome::parked("message_duplicate");
    }

    let mut metadata = message.metadata.clone();
    if media.pending {
        metadata["media_pending"] = Value::Bool(true);
    }

    let new_message = NewMessage {
        direction: MessageDirection::Inbound,
        kind: message.message_type,
        content: message.text.clone(),
        media_url: media.media_url.clone(),
        mime_type: media.mime_type.clone(),
        file_size: media.file_size,
        external_id: Some(message.message_id.clone()),
        instance_id: Some(instance.id.clone()),
        status: MessageStatus::Delivered,
        metadata,
    };

    let persisted = match deps.store.create_message(&tenant_id, &ticket.id, new_message).await {
        Ok(persisted) => persisted,
        Err(StoreError::Conflict { existing_id: Some(existing_id), .. }) => {
            match deps.store.get_message(&tenant_id, &existing_id).await {
                Ok(Some(existing)) => existing,
                _ => match deps.store.find_message_by_external_id(&tenant_id, &message.message_id).await {
                    Ok(Some(existing)) => existing,
                    _ => {
                        warn!(tenant_id, message_id = %message.message_id, "conflict on create_message but existing row could not be loaded");
                        return InboundOutcome::parked("persistence_failed");
                    }
                },
            }
        }
        Err(err) => {
            send_to_dlq(deps, &tenant_id, message, raw_event, &err).await;
            return InboundOutcome::parked("persistence_failed");
        }
    };

    if media.pending {
        enqueue_media_job(deps, &tenant_id, &instance, message, &persisted, &media).await;
    }

    emit_realtime(deps, &tenant_id, &ticket, ticket_is_new, &instance, &persisted, message).await;
    sync_lead(deps, &tenant_id, &contact, &ticket, &persisted).await;

    state.dedupe.register(&key, DEFAULT_TTL).await;

    allocate(deps, state, &tenant_id, &instance, &contact).await;

    record_counter("message_accepted", 1, &TelemetryLabels::new(tenant_id.clone()));
    InboundOutcome::accepted("persisted")
}

async fn resolve_instance(deps: &PipelineDeps, message: &NormalizedMessage) -> Option<Instance> {
    if let Some(tenant_id) = &message.tenant_id {
        if let Ok(Some(instance)) = deps.store.find_instance_by_id(tenant_id, &message.instance_id).await {
            return Some(instance);
        }
    }
    if let Some(broker_id) = &message.broker_id {
        if let Ok(Some(instance)) = deps.store.find_instance_by_broker_id(broker_id).await {
            return Some(instance);
        }
        if let Some(tenant_id) = &message.tenant_id {
            if let Ok(Some(instance)) = deps.store.find_instance_by_tenant_and_broker(tenant_id, broker_id).await {
                return Some(instance);
            }
        }
    }
    if let Some(tenant_id) = &message.tenant_id {
        if let Ok(Some(instance)) = deps.store.find_any_instance_for_tenant(tenant_id).await {
            return Some(instance);
        }
    }

    let tenant_id = message.tenant_id.clone().unwrap_or_else(|| message.instance_id.clone());
    let broker_id = message.broker_id.clone().unwrap_or_else(|| message.instance_id.clone());
    deps.provisioner.auto_provision_instance(&tenant_id, &broker_id).await.ok()
}

async fn resolve_queue(deps: &PipelineDeps, state: &PipelineState, tenant_id: &str) -> Option<Queue> {
    if let Some(queue) = state.queues.get(tenant_id) {
        return Some(queue);
    }
    let queue = deps.provisioner.ensure_inbound_queue(tenant_id).await.ok()?;
    state.queues.put(tenant_id, queue.clone());
    Some(queue)
}

async fn resolve_contact(
    deps: &PipelineDeps,
    tenant_id: &str,
    message: &NormalizedMessage,
) -> Result<Contact, StoreError> {
    let phone = message.participant.clone().unwrap_or_else(|| message.chat_id.clone());
    let push_name = message
        .metadata
        .get("contact")
        .and_then(|c| c.get("pushName"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let dedupe_id = format!("{}:{}", message.instance_id, phone);
    deps.store
        .find_or_create_contact(
            tenant_id,
            &dedupe_id,
            ContactAttrs {
                display_name: push_name,
                primary_phone: Some(phone),
                document: None,
            },
        )
        .await
}

async fn resolve_ticket(
    deps: &PipelineDeps,
    state: &PipelineState,
    tenant_id: &str,
    contact: &Contact,
    queue: &Queue,
    message: &NormalizedMessage,
) -> Result<(Ticket, bool), StoreError> {
    if let Some(existing) = deps.store.find_open_ticket_by_chat(tenant_id, &message.chat_id).await? {
        return Ok((existing, false));
    }

    let ticket = Ticket {
        id: leadengine_wa_core::random_id("ticket-"),
        tenant_id: tenant_id.to_string(),
        contact_id: contact.id.clone(),
        queue_id: queue.id.clone(),
        chat_id: message.chat_id.clone(),
        status: TicketStatus::Open,
        agreement_id: None,
        metadata: json!({}),
        updated_at: OffsetDateTime::now_utc(),
        last_message_at: None,
        last_message_preview: None,
    };

    match deps.store.insert_ticket(ticket).await {
        Ok(created) => Ok((created, true)),
        Err(StoreError::Conflict { existing_id: Some(existing_id), .. }) => {
            match deps.store.get_ticket(tenant_id, &existing_id).await? {
                Some(existing) => Ok((existing, false)),
                None => Err(StoreError::not_found("ticket", existing_id)),
            }
        }
        Err(StoreError::NotFound { entity: "queue", .. }) => {
            state.queues.invalidate(tenant_id);
            let queue = deps.provisioner.ensure_inbound_queue(tenant_id).await?;
            state.queues.put(tenant_id, queue.clone());
            let retry = Ticket {
                id: leadengine_wa_core::random_id("ticket-"),
                tenant_id: tenant_id.to_string(),
                contact_id: contact.id.clone(),
                queue_id: queue.id.clone(),
                chat_id: message.chat_id.clone(),
                status: TicketStatus::Open,
                agreement_id: None,
                metadata: json!({}),
                updated_at: OffsetDateTime::now_utc(),
                last_message_at: None,
                last_message_preview: None,
            };
            Ok((deps.store.insert_ticket(retry).await?, true))
        }
        Err(other) => Err(other),
    }
}

async fn record_poll_creation(
    deps: &PipelineDeps,
    tenant_id: &str,
    instance: &Instance,
    message: &NormalizedMessage,
) -> Result<(), StoreError> {
    let poll = &message.raw["pollCreationMessage"];
    let question = poll
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let options: Vec<leadengine_wa_core::PollOption> = poll
        .get("options")
        .and_then(Value::as_array)
        .map(|opts| {
            opts.iter()
                .enumerate()
                .map(|(index, opt)| leadengine_wa_core::PollOption {
                    id: index.to_string(),
                    index: index as u32,
                    title: opt.get("optionName").and_then(Value::as_str).unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    let allow_multiple_answers = poll
        .get("selectableOptionsCount")
        .and_then(Value::as_u64)
        .map(|n| n != 1)
        .unwrap_or(false);

    deps.store
        .upsert_poll_metadata(leadengine_wa_core::PollMetadata {
            poll_id: message.message_id.clone(),
            tenant_id: tenant_id.to_string(),
            instance_id: Some(instance.id.clone()),
            question,
            options,
            allow_multiple_answers,
            creation_message_id: message.message_id.clone(),
            creation_message_key: poll.get("encKey").and_then(Value::as_str).map(String::from),
            message_secret: poll.get("messageSecret").and_then(Value::as_str).map(String::from),
            message_secret_version: poll.get("messageSecretVersion").and_then(Value::as_u64).map(|v| v as u32),
        })
        .await
}

#[derive(Debug, Default, Clone)]
struct MediaOutcome {
    media_url: Option<String>,
    mime_type: Option<String>,
    file_size: Option<i64>,
    pending: bool,
    last_error: Option<String>,
}

const DIRECT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5);
const BROKER_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(8);
const MEDIA_SIGNED_URL_TTL: Duration = Duration::from_secs(3600);

/// §4.6 step 7: try a direct broker download first, fall back to a
/// broker-mediated one, and park for the retry worker (C10) on failure.
async fn resolve_media(deps: &PipelineDeps, tenant_id: &str, instance: &Instance, message: &NormalizedMessage) -> MediaOutcome {
    let Some(media) = &message.media else {
        return MediaOutcome::default();
    };
    if media.media_key.is_none() && media.direct_path.is_none() {
        return MediaOutcome {
            mime_type: media.mime_type.clone(),
            file_size: media.file_length,
            ..Default::default()
        };
    }

    let direct = deps
        .broker
        .download_direct(
            tenant_id,
            &instance.id,
            media.media_key.as_deref(),
            media.direct_path.as_deref(),
            DIRECT_DOWNLOAD_TIMEOUT,
        )
        .await;

    let downloaded: anyhow::Result<DownloadedMedia> = match direct {
        Ok(downloaded_media) => Ok(downloaded_media),
        Err(direct_err) => {
            deps.broker
                .download_via_broker(
                    tenant_id,
                    message.broker_id.as_deref(),
                    media.media_key.as_deref(),
                    media.direct_path.as_deref(),
                    BROKER_DOWNLOAD_TIMEOUT,
                )
                .await
                .map_err(|broker_err| anyhow::anyhow!("direct: {direct_err}; broker: {broker_err}"))
        }
    };

    match downloaded {
        Ok(downloaded_media) => {
            let key = format!("{}/{}", message.message_id, media.file_name.clone().unwrap_or_else(|| "media".into()));
            match deps.media_store.put(tenant_id, &key, &downloaded_media).await {
                Ok(stored_key) => {
                    let url = deps
                        .media_store
                        .sign(&stored_key, MEDIA_SIGNED_URL_TTL)
                        .await
                        .unwrap_or_default();
                    MediaOutcome {
                        media_url: Some(url),
                        mime_type: downloaded_media.mime_type.or_else(|| media.mime_type.clone()),
                        file_size: media.file_length,
                        pending: false,
                        last_error: None,
                    }
                }
                Err(err) => MediaOutcome {
                    mime_type: media.mime_type.clone(),
                    file_size: media.file_length,
                    pending: true,
                    last_error: Some(err.to_string()),
                    ..Default::default()
                },
            }
        }
        Err(err) => MediaOutcome {
            mime_type: media.mime_type.clone(),
            file_size: media.file_length,
            pending: true,
            last_error: Some(err.to_string()),
            ..Default::default()
        },
    }
}

async fn enqueue_media_job(
    deps: &PipelineDeps,
    tenant_id: &str,
    instance: &Instance,
    message: &NormalizedMessage,
    persisted: &Message,
    media: &MediaOutcome,
) {
    let Some(media_info) = &message.media else { return };
    let job = MediaJob {
        id: leadengine_wa_core::random_id("media-job-"),
        tenant_id: tenant_id.to_string(),
        message_id: persisted.id.clone(),
        message_external_id: Some(message.message_id.clone()),
        instance_id: Some(instance.id.clone()),
        broker_id: message.broker_id.clone(),
        media_type: message.message_type,
        media_key: media_info.media_key.clone(),
        direct_path: media_info.direct_path.clone(),
        metadata: json!({ "last_error": media.last_error }),
        attempts: 0,
        next_retry_at: OffsetDateTime::now_utc() + time::Duration::seconds(60),
        state: MediaJobState::Pending,
    };
    if let Err(err) = deps.store.insert_media_job(job).await {
        warn!(tenant_id, error = %err, "failed to enqueue media retry job");
    }
}

async fn send_to_dlq(deps: &PipelineDeps, tenant_id: &str, message: &NormalizedMessage, raw_event: &Value, err: &StoreError) {
    let record = DlqRecord::new(
        tenant_id,
        "inbound_pipeline.create_message",
        &message.message_id,
        0,
        leadengine_wa_dlq::DlqError {
            code: "E_PERSIST".to_string(),
            message: err.to_string(),
            stage: None,
        },
        json!({ "normalized": message.message_id, "raw": raw_event }),
    );
    if let Err(publish_err) = deps.dlq.publish(record).await {
        warn!(tenant_id, error = %publish_err, "failed to publish to DLQ after persistence failure");
    }
}

async fn emit_realtime(
    deps: &PipelineDeps,
    tenant_id: &str,
    ticket: &Ticket,
    ticket_is_new: bool,
    instance: &Instance,
    persisted: &Message,
    message: &NormalizedMessage,
) {
    let ticket_payload = json!({
        "tenantId": tenant_id,
        "ticket": { "id": ticket.id, "agreementId": ticket.agreement_id },
        "message": persisted,
        "providerMessageId": message.message_id,
        "instanceId": instance.id,
    });
    realtime::emit(
        deps.realtime.as_ref(),
        tenant_id,
        Some(&ticket.id),
        ticket.agreement_id.as_deref(),
        EVENT_TICKET_MESSAGES_NEW,
        ticket_payload,
    )
    .await;

    let ticket_event = if ticket_is_new { EVENT_TICKETS_NEW } else { EVENT_TICKETS_UPDATED };
    let ticket_state_payload = json!({
        "tenantId": tenant_id,
        "ticketId": ticket.id,
        "agreementId": ticket.agreement_id,
        "instanceId": instance.id,
        "messageId": persisted.id,
        "providerMessageId": message.message_id,
        "ticketStatus": ticket.status,
        "ticketUpdatedAt": ticket.updated_at,
        "ticket": ticket,
    });
    realtime::emit(
        deps.realtime.as_ref(),
        tenant_id,
        Some(&ticket.id),
        ticket.agreement_id.as_deref(),
        ticket_event,
        ticket_state_payload,
    )
    .await;
}

async fn sync_lead(deps: &PipelineDeps, tenant_id: &str, contact: &Contact, ticket: &Ticket, persisted: &Message) {
    let lead = match deps.store.upsert_lead(tenant_id, &contact.id, &ticket.id).await {
        Ok(lead) => lead,
        Err(err) => {
            warn!(tenant_id, error = %err, "lead sync failed");
            return;
        }
    };
    match deps
        .store
        .append_lead_activity(tenant_id, &lead.id, LeadActivityKind::LeadActivity, &persisted.id)
        .await
    {
        Ok(Some(activity)) => {
            let payload = json!({
                "tenantId": tenant_id,
                "ticketId": ticket.id,
                "instanceId": persisted.instance_id,
                "providerMessageId": persisted.external_id,
                "message": persisted,
                "lead": lead,
                "leadActivity": activity,
            });
            realtime::emit(
                deps.realtime.as_ref(),
                tenant_id,
                Some(&ticket.id),
                ticket.agreement_id.as_deref(),
                EVENT_LEAD_ACTIVITIES_NEW,
                payload.clone(),
            )
            .await;
            // The activity append also advances the lead record itself, so
            // §6's `leads.updated` envelope goes out alongside `leadActivities.new`
            // rather than only on some separate lead-mutation path.
            realtime::emit(deps.realtime.as_ref(), tenant_id, Some(&ticket.id), ticket.agreement_id.as_deref(), EVENT_LEADS_UPDATED, payload).await;
        }
        Ok(None) => {}
        Err(err) => warn!(tenant_id, error = %err, "lead activity append failed"),
    }
}

async fn allocate(deps: &PipelineDeps, state: &PipelineState, tenant_id: &str, instance: &Instance, contact: &Contact) {
    let campaigns = state.campaigns.active_campaigns(tenant_id);
    let targets: Vec<Option<String>> = if campaigns.is_empty() {
        vec![None]
    } else {
        campaigns.into_iter().map(Some).collect()
    };

    for campaign_id in targets {
        let dedupe_key = format!(
            "{}|{}|{}",
            tenant_id,
            campaign_id.as_deref().unwrap_or("instance"),
            contact.id
        );
        let allocation = Allocation {
            id: leadengine_wa_core::random_id("allocation-"),
            tenant_id: tenant_id.to_string(),
            campaign_id: campaign_id.clone(),
            agreement_id: None,
            instance_id: instance.id.clone(),
            dedupe_key,
        };
        match deps.allocator.add_allocation(allocation).await {
            Ok(Some(allocation)) => {
                let payload = json!({
                    "tenantId": tenant_id,
                    "campaignId": campaign_id,
                    "agreementId": allocation.agreement_id,
                    "instanceId": instance.id,
                    "allocation": allocation,
                    "summary": { "instanceId": instance.id, "contactId": contact.id },
                });
                realtime::emit(deps.realtime.as_ref(), tenant_id, None, allocation.agreement_id.as_deref(), EVENT_LEAD_ALLOCATIONS_NEW, payload).await;
            }
            Ok(None) => {}
            Err(err) => warn!(tenant_id, error = %err, "allocation failed"),
        }
    }
}
