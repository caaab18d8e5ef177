//! Poll reconciler (C8). Merges one `POLL_CHOICE` vote into the persisted
//! `PollChoiceState` and mirrors the recomputed aggregates onto the poll
//! message's `metadata.poll`, per §4.8.

use std::collections::BTreeMap;

use leadengine_wa_core::{
    Message, PollAggregates, PollChoiceState, PollContext, PollVote, RealtimeBus, Store,
};
use serde_json::json;
use time::OffsetDateTime;
use tracing::warn;

use crate::error::PollError;
use crate::realtime::{self, EVENT_MESSAGE_UPDATED};
use crate::state::PipelineState;

/// One incoming vote, already unwrapped from the webhook envelope by the
/// event dispatcher (C5).
#[derive(Debug, Clone)]
pub struct IncomingPollChoice {
    pub tenant_id: String,
    pub poll_id: String,
    pub chat_id: Option<String>,
    pub voter_jid: String,
    pub option_ids: Vec<String>,
    pub message_id: String,
    pub timestamp: OffsetDateTime,
    pub encrypted: bool,
}

/// Runs the C8 algorithm. Returns `Ok(false)` (not an error) when no
/// containing poll vote message can be located — logged, not propagated.
pub async fn reconcile_poll_choice(
    store: &dyn Store,
    realtime: &dyn RealtimeBus,
    state: &PipelineState,
    choice: IncomingPollChoice,
) -> Result<bool, PollError> {
    let lock = state.poll_locks.lock_for(&choice.poll_id);
    let _guard = lock.lock().await;

    let Some(message) = store
        .find_poll_vote_message_candidate(&choice.tenant_id, &choice.poll_id, choice.chat_id.as_deref())
        .await?
    else {
        warn!(poll_id = %choice.poll_id, "no poll vote message candidate found, dropping choice");
        return Ok(false);
    };

    let poll_metadata = store.get_poll_metadata(&choice.tenant_id, &choice.poll_id).await?;
    let mut choice_state = store
        .get_poll_choice_state(&choice.poll_id)
        .await?
        .unwrap_or_else(|| fresh_choice_state(&choice, &message, poll_metadata.as_ref()));

    if choice_state.options.is_empty() {
        if let Some(meta) = &poll_metadata {
            choice_state.options = meta.options.clone();
        }
    }
    if choice_state.context.question.is_none() {
        if let Some(meta) = &poll_metadata {
            choice_state.context.question = Some(meta.question.clone());
        }
    }

    choice_state.votes.insert(
        choice.voter_jid.clone(),
        PollVote {
            option_ids: choice.option_ids.clone(),
            message_id: choice.message_id.clone(),
            timestamp: choice.timestamp,
            encrypted: choice.encrypted,
        },
    );

    recompute_aggregates(&mut choice_state);
    choice_state.updated_at = OffsetDateTime::now_utc();

    store.upsert_poll_choice_state(choice_state.clone()).await?;

    let question = choice_state
        .context
        .question
        .clone()
        .or_else(|| message.metadata.get("poll").and_then(|p| p.get("question")).and_then(|q| q.as_str()).map(String::from));

    let poll_payload = json!({
        "question": question,
        "options": choice_state.options.iter().map(|opt| {
            let votes = choice_state.aggregates.option_totals.get(&opt.id).copied().unwrap_or(0);
            json!({ "id": opt.id, "index": opt.index, "title": opt.title, "votes": votes })
        }).collect::<Vec<_>>(),
        "totalVoters": choice_state.aggregates.total_voters,
        "totalVotes": choice_state.aggregates.total_votes,
    });

    let mut updated_message = message.clone();
    let mut metadata = updated_message.metadata.clone();
    metadata["poll"] = poll_payload;
    updated_message.metadata = metadata;
    let prior_status = updated_message.status;
    store.update_message(updated_message.clone()).await?;

    emit_message_updated(realtime, &choice.tenant_id, &updated_message, prior_status).await;

    Ok(true)
}

fn fresh_choice_state(
    choice: &IncomingPollChoice,
    message: &Message,
    poll_metadata: Option<&leadengine_wa_core::PollMetadata>,
) -> PollChoiceState {
    PollChoiceState {
        poll_id: choice.poll_id.clone(),
        options: poll_metadata.map(|m| m.options.clone()).unwrap_or_default(),
        votes: BTreeMap::new(),
        aggregates: PollAggregates {
            total_voters: 0,
            total_votes: 0,
            option_totals: BTreeMap::new(),
        },
        updated_at: choice.timestamp,
        context: PollContext {
            tenant_id: choice.tenant_id.clone(),
            creation_message_id: poll_metadata
                .map(|m| m.creation_message_id.clone())
                .unwrap_or_else(|| message.id.clone()),
            creation_message_key: poll_metadata.and_then(|m| m.creation_message_key.clone()),
            question: poll_metadata.map(|m| m.question.clone()),
        },
    }
}

/// Recomputes `aggregates` from `votes`, the authoritative source of truth.
/// Every known option id (from `options`, seeded with 0) plus every id that
/// appears in a vote contributes to `option_totals`.
fn recompute_aggregates(state: &mut PollChoiceState) {
    let mut totals: BTreeMap<String, u32> = state.options.iter().map(|o| (o.id.clone(), 0)).collect();
    let mut total_votes = 0u32;
    for vote in state.votes.values() {
        for option_id in &vote.option_ids {
            *totals.entry(option_id.clone()).or_insert(0) += 1;
            total_votes += 1;
        }
    }
    let total_voters = state.votes.len() as u32;

    let sum: u32 = totals.values().sum();
    if sum != total_votes {
        warn!(poll_id = %state.poll_id, sum, total_votes, "poll aggregates mismatch, persisting per-vote data anyway");
    }

    state.aggregates = PollAggregates {
        total_voters,
        total_votes,
        option_totals: totals,
    };
}

async fn emit_message_updated(
    bus: &dyn RealtimeBus,
    tenant_id: &str,
    message: &Message,
    prior_status: leadengine_wa_core::MessageStatus,
) {
    let payload = json!({
        "tenantId": tenant_id,
        "ticketId": message.ticket_id,
        "message": message,
        "priorStatus": prior_status,
    });
    realtime::emit(bus, tenant_id, Some(&message.ticket_id), None, EVENT_MESSAGE_UPDATED, payload).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadengine_wa_core::{
        ContactAttrs, MessageDirection, MessageStatus, MessageType, NewMessage, PollMetadata, Queue, Ticket,
        TicketStatus,
    };
    use leadengine_wa_testkit::TestHarness;

    async fn seed_poll_message(h: &TestHarness, tenant_id: &str, poll_id: &str) -> Message {
        let queue = h
            .store
            .insert_queue(Queue { id: "queue-1".into(), tenant_id: tenant_id.to_string(), is_default: true })
            .await
            .unwrap();
        let contact = h
            .store
            .find_or_create_contact(tenant_id, "inst-1:5511999999999", ContactAttrs::default())
            .await
            .unwrap();
        let ticket = h
            .store
            .insert_ticket(Ticket {
                id: "ticket-poll".into(),
                tenant_id: tenant_id.to_string(),
                contact_id: contact.id,
                queue_id: queue.id,
                chat_id: "5511999999999".into(),
                status: TicketStatus::Open,
                agreement_id: None,
                metadata: serde_json::json!({}),
                updated_at: OffsetDateTime::now_utc(),
                last_message_at: None,
                last_message_preview: None,
            })
            .await
            .unwrap();

        h.store
            .upsert_poll_metadata(PollMetadata {
                poll_id: poll_id.to_string(),
                tenant_id: tenant_id.to_string(),
                instance_id: Some("inst-1".to_string()),
                question: "Favorite color?".to_string(),
                options: vec![
                    leadengine_wa_core::PollOption { id: "0".into(), index: 0, title: "Red".into() },
                    leadengine_wa_core::PollOption { id: "1".into(), index: 1, title: "Blue".into() },
                    leadengine_wa_core::PollOption { id: "2".into(), index: 2, title: "Green".into() },
                ],
                allow_multiple_answers: true,
                creation_message_id: poll_id.to_string(),
                creation_message_key: None,
                message_secret: None,
                message_secret_version: None,
            })
            .await
            .unwrap();

        h.store
            .create_message(
                tenant_id,
                &ticket.id,
                NewMessage {
                    direction: MessageDirection::Inbound,
                    kind: MessageType::Poll,
                    content: Some("Favorite color?".into()),
                    media_url: None,
                    mime_type: None,
                    file_size: None,
                    external_id: Some(poll_id.to_string()),
                    instance_id: Some("inst-1".into()),
                    status: MessageStatus::Delivered,
                    metadata: serde_json::json!({}),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn two_voters_aggregate_onto_the_poll_message() {
        let h = TestHarness::new();
        let state = PipelineState::new();
        let poll_message = seed_poll_message(&h, "tenant-A", "poll-1").await;

        reconcile_poll_choice(
            h.store.as_ref(),
            h.realtime.as_ref(),
            &state,
            IncomingPollChoice {
                tenant_id: "tenant-A".into(),
                poll_id: "poll-1".into(),
                chat_id: Some("5511999999999".into()),
                voter_jid: "voter-1".into(),
                option_ids: vec!["0".into()],
                message_id: "vote-1".into(),
                timestamp: OffsetDateTime::now_utc(),
                encrypted: false,
            },
        )
        .await
        .unwrap();

        let applied = reconcile_poll_choice(
            h.store.as_ref(),
            h.realtime.as_ref(),
            &state,
            IncomingPollChoice {
                tenant_id: "tenant-A".into(),
                poll_id: "poll-1".into(),
                chat_id: Some("5511999999999".into()),
                voter_jid: "voter-2".into(),
                option_ids: vec!["0".into(), "1".into()],
                message_id: "vote-2".into(),
                timestamp: OffsetDateTime::now_utc(),
                encrypted: false,
            },
        )
        .await
        .unwrap();
        assert!(applied);

        let state = h.store.get_poll_choice_state("poll-1").await.unwrap().unwrap();
        assert_eq!(state.aggregates.total_voters, 2);
        assert_eq!(state.aggregates.total_votes, 3);
        assert_eq!(state.aggregates.option_totals.get("0").copied(), Some(2));
        assert_eq!(state.aggregates.option_totals.get("1").copied(), Some(1));
        assert_eq!(state.aggregates.option_totals.get("2").copied(), Some(0));

        let stored_message = h.store.get_message("tenant-A", &poll_message.id).await.unwrap().unwrap();
        let poll_meta = stored_message.metadata.get("poll").unwrap();
        assert_eq!(poll_meta.get("totalVoters").and_then(|v| v.as_u64()), Some(2));
        assert_eq!(poll_meta.get("totalVotes").and_then(|v| v.as_u64()), Some(3));
        assert_eq!(poll_meta.get("question").and_then(|v| v.as_str()), Some("Favorite color?"));
    }

    #[tokio::test]
    async fn unknown_poll_id_is_reported_as_not_found_without_error() {
        let h = TestHarness::new();
        let state = PipelineState::new();
        let applied = reconcile_poll_choice(
            h.store.as_ref(),
            h.realtime.as_ref(),
            &state,
            IncomingPollChoice {
                tenant_id: "tenant-A".into(),
                poll_id: "does-not-exist".into(),
                chat_id: None,
                voter_jid: "voter-1".into(),
                option_ids: vec!["0".into()],
                message_id: "vote-1".into(),
                timestamp: OffsetDateTime::now_utc(),
                encrypted: false,
            },
        )
        .await
        .unwrap();
        assert!(!applied);
    }
}
