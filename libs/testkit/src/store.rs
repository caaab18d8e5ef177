//! In-memory [`Store`] fake: a `dashmap`-backed map standing in for a real
//! backend, covering the full relational surface the pipeline needs:
//! instances, queues, contacts, tickets, messages, ACKs, polls, media jobs,
//! leads.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use leadengine_wa_core::{
    AckUpdate, Allocation, Contact, ContactAttrs, Instance, LastAck, Lead, LeadActivity,
    LeadActivityKind, MediaJob, MediaJobState, Message, NewMessage, Queue, Store, StoreError,
    Ticket, TicketStatus,
};
use time::OffsetDateTime;

#[derive(Default)]
pub struct InMemoryStore {
    instances: DashMap<String, Instance>,
    instance_by_broker: DashMap<String, String>,
    queues: DashMap<String, Queue>,
    default_queue_by_tenant: DashMap<String, String>,
    contacts: DashMap<String, Contact>,
    contact_by_dedupe: DashMap<String, String>,
    tickets: DashMap<String, Ticket>,
    open_ticket_by_chat: DashMap<String, String>,
    messages: DashMap<String, Message>,
    message_by_external: DashMap<String, String>,
    last_ack: DashMap<String, LastAck>,
    poll_metadata: DashMap<String, leadengine_wa_core::PollMetadata>,
    poll_choice_state: DashMap<String, leadengine_wa_core::PollChoiceState>,
    media_jobs: DashMap<String, MediaJob>,
    media_job_lease: DashMap<String, ()>,
    leads_by_contact: DashMap<String, String>,
    leads: DashMap<String, Lead>,
    lead_activity_seen: DashMap<String, String>,
    allocations_by_dedupe: DashMap<String, String>,
    allocations: DashMap<String, Allocation>,
    ids: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.ids.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{n}")
    }

    /// Test helper: total message count, used by integration tests asserting
    /// idempotence ("processMany([E, E]) persists at most one message").
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    pub fn media_job_count(&self) -> usize {
        self.media_jobs.len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find_instance_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Instance>, StoreError> {
        Ok(self
            .instances
            .get(id)
            .filter(|i| i.tenant_id == tenant_id)
            .map(|i| i.clone()))
    }

    async fn find_instance_by_broker_id(&self, broker_id: &str) -> Result<Option<Instance>, StoreError> {
        let Some(id) = self.instance_by_broker.get(broker_id).map(|r| r.clone()) else {
            return Ok(None);
        };
        Ok(self.instances.get(&id).map(|i| i.clone()))
    }

    async fn find_instance_by_tenant_and_broker(
        &self,
        tenant_id: &str,
        broker_id: &str,
    ) -> Result<Option<Instance>, StoreError> {
        Ok(self
            .find_instance_by_broker_id(broker_id)
            .await?
            .filter(|i| i.tenant_id == tenant_id))
    }

    async fn find_any_instance_for_tenant(&self, tenant_id: &str) -> Result<Option<Instance>, StoreError> {
        Ok(self
            .instances
            .iter()
            .find(|entry| entry.value().tenant_id == tenant_id)
            .map(|entry| entry.value().clone()))
    }

    async fn insert_instance(&self, instance: Instance) -> Result<Instance, StoreError> {
        match self.instance_by_broker.entry(instance.broker_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let existing_id = existing.get().clone();
                Err(StoreError::conflict_with(
                    "instance",
                    format!("broker_id {} already provisioned", instance.broker_id),
                    existing_id,
                ))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(instance.id.clone());
                self.instances.insert(instance.id.clone(), instance.clone());
                Ok(instance)
            }
        }
    }

    async fn find_default_queue(&self, tenant_id: &str) -> Result<Option<Queue>, StoreError> {
        let Some(id) = self.default_queue_by_tenant.get(tenant_id).map(|r| r.clone()) else {
            return Ok(None);
        };
        Ok(self.queues.get(&id).map(|q| q.clone()))
    }

    async fn insert_queue(&self, queue: Queue) -> Result<Queue, StoreError> {
        if queue.is_default {
            match self.default_queue_by_tenant.entry(queue.tenant_id.clone()) {
                dashmap::mapref::entry::Entry::Occupied(existing) => {
                    let existing_id = existing.get().clone();
                    return Err(StoreError::conflict_with(
                        "queue",
                        format!("tenant {} already has a default queue", queue.tenant_id),
                        existing_id,
                    ));
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(queue.id.clone());
                }
            }
        }
        self.queues.insert(queue.id.clone(), queue.clone());
        Ok(queue)
    }

    async fn find_or_create_contact(
        &self,
        tenant_id: &str,
        dedupe_id: &str,
        attrs: ContactAttrs,
    ) -> Result<Contact, StoreError> {
        let key = format!("{tenant_id}|{dedupe_id}");
        if let Some(id) = self.contact_by_dedupe.get(&key).map(|r| r.clone()) {
            if let Some(contact) = self.contacts.get(&id) {
                return Ok(contact.clone());
            }
        }
        let contact = Contact {
            id: self.next_id("contact"),
            tenant_id: tenant_id.to_string(),
            display_name: attrs.display_name,
            primary_phone: attrs.primary_phone,
            document: attrs.document,
        };
        self.contact_by_dedupe.insert(key, contact.id.clone());
        self.contacts.insert(contact.id.clone(), contact.clone());
        Ok(contact)
    }

    async fn find_open_ticket_by_chat(
        &self,
        tenant_id: &str,
        chat_id: &str,
    ) -> Result<Option<Ticket>, StoreError> {
        let key = format!("{tenant_id}|{chat_id}");
        let Some(id) = self.open_ticket_by_chat.get(&key).map(|r| r.clone()) else {
            return Ok(None);
        };
        Ok(self.tickets.get(&id).map(|t| t.clone()))
    }

    async fn insert_ticket(&self, ticket: Ticket) -> Result<Ticket, StoreError> {
        if ticket.status == TicketStatus::Open {
            let key = format!("{}|{}", ticket.tenant_id, ticket.chat_id);
            match self.open_ticket_by_chat.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(existing) => {
                    let existing_id = existing.get().clone();
                    return Err(StoreError::conflict_with(
                        "ticket",
                        format!("open ticket already exists for chat {}", ticket.chat_id),
                        existing_id,
                    ));
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(ticket.id.clone());
                }
            }
        }
        self.tickets.insert(ticket.id.clone(), ticket.clone());
        Ok(ticket)
    }

    async fn get_ticket(&self, tenant_id: &str, id: &str) -> Result<Option<Ticket>, StoreError> {
        Ok(self
            .tickets
            .get(id)
            .filter(|t| t.tenant_id == tenant_id)
            .map(|t| t.clone()))
    }

    async fn set_ticket_status(
        &self,
        tenant_id: &str,
        id: &str,
        status: TicketStatus,
    ) -> Result<(), StoreError> {
        let mut ticket = self
            .tickets
            .get_mut(id)
            .filter(|t| t.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::not_found("ticket", id))?;
        if ticket.status == TicketStatus::Open && status != TicketStatus::Open {
            self.open_ticket_by_chat
                .remove(&format!("{tenant_id}|{}", ticket.chat_id));
        }
        ticket.status = status;
        ticket.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn find_message_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let key = format!("{tenant_id}|{external_id}");
        let Some(id) = self.message_by_external.get(&key).map(|r| r.clone()) else {
            return Ok(None);
        };
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn create_message(
        &self,
        tenant_id: &str,
        ticket_id: &str,
        new_message: NewMessage,
    ) -> Result<Message, StoreError> {
        if let Some(external_id) = &new_message.external_id {
            let key = format!("{tenant_id}|{external_id}");
            if self.message_by_external.contains_key(&key) {
                return Err(StoreError::conflict(
                    "message",
                    format!("external_id {external_id} already recorded"),
                ));
            }
        }

        let message = Message {
            id: self.next_id("msg"),
            tenant_id: tenant_id.to_string(),
            ticket_id: ticket_id.to_string(),
            direction: new_message.direction,
            kind: new_message.kind,
            content: new_message.content.clone(),
            media_url: new_message.media_url,
            mime_type: new_message.mime_type,
            file_size: new_message.file_size,
            external_id: new_message.external_id.clone(),
            instance_id: new_message.instance_id,
            status: new_message.status,
            metadata: new_message.metadata,
            created_at: OffsetDateTime::now_utc(),
        };

        if let Some(external_id) = &message.external_id {
            self.message_by_external
                .insert(format!("{tenant_id}|{external_id}"), message.id.clone());
        }
        self.messages.insert(message.id.clone(), message.clone());

        if let Some(mut ticket) = self.tickets.get_mut(ticket_id) {
            ticket.last_message_at = Some(message.created_at);
            ticket.last_message_preview = new_message.content;
            ticket.updated_at = message.created_at;
        }

        Ok(message)
    }

    async fn get_message(&self, tenant_id: &str, id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self
            .messages
            .get(id)
            .filter(|m| m.tenant_id == tenant_id)
            .map(|m| m.clone()))
    }

    async fn update_message(&self, message: Message) -> Result<Message, StoreError> {
        self.messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn find_outbound_message_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        Ok(self
            .find_message_by_external_id(tenant_id, external_id)
            .await?
            .filter(|m| m.direction == leadengine_wa_core::MessageDirection::Outbound))
    }

    async fn apply_broker_ack(
        &self,
        tenant_id: &str,
        message_id: &str,
        update: AckUpdate,
    ) -> Result<Message, StoreError> {
        let mut message = self
            .messages
            .get_mut(message_id)
            .filter(|m| m.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::not_found("message", message_id))?;
        message.status = update.status;
        message.metadata = update.metadata;
        if let Some(instance_id) = update.instance_id {
            message.instance_id = Some(instance_id);
        }
        let received_at = update
            .read_at
            .or(update.delivered_at)
            .unwrap_or_else(OffsetDateTime::now_utc);
        self.last_ack.insert(
            message_id.to_string(),
            LastAck {
                status: update.status,
                received_at,
            },
        );
        Ok(message.clone())
    }

    async fn last_ack(&self, _tenant_id: &str, message_id: &str) -> Result<Option<LastAck>, StoreError> {
        Ok(self.last_ack.get(message_id).map(|a| a.clone()))
    }

    async fn find_poll_vote_message_candidate(
        &self,
        tenant_id: &str,
        poll_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Option<Message>, StoreError> {
        // The poll-creation message's own `externalId` is the `messageId`
        // that `PollMetadata::poll_id` was derived from (§4.6 step 6), so a
        // `POLL_CHOICE` vote's `pollId` resolves back to that same
        // `externalId` rather than a dedicated field in the message metadata.
        if let Some(found) = self.find_message_by_external_id(tenant_id, poll_id).await? {
            return Ok(Some(found));
        }
        Ok(self
            .messages
            .iter()
            .find(|entry| {
                let m = entry.value();
                m.tenant_id == tenant_id
                    && m.metadata.get("pollId").and_then(|v| v.as_str()) == Some(poll_id)
                    && chat_id
                        .map(|chat| {
                            self.tickets
                                .get(&m.ticket_id)
                                .map(|t| t.chat_id == chat)
                                .unwrap_or(true)
                        })
                        .unwrap_or(true)
            })
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_poll_metadata(&self, metadata: leadengine_wa_core::PollMetadata) -> Result<(), StoreError> {
        self.poll_metadata
            .insert(format!("{}|{}", metadata.tenant_id, metadata.poll_id), metadata);
        Ok(())
    }

    async fn get_poll_metadata(
        &self,
        tenant_id: &str,
        poll_id: &str,
    ) -> Result<Option<leadengine_wa_core::PollMetadata>, StoreError> {
        Ok(self
            .poll_metadata
            .get(&format!("{tenant_id}|{poll_id}"))
            .map(|m| m.clone()))
    }

    async fn upsert_poll_choice_state(
        &self,
        state: leadengine_wa_core::PollChoiceState,
    ) -> Result<(), StoreError> {
        self.poll_choice_state.insert(state.poll_id.clone(), state);
        Ok(())
    }

    async fn get_poll_choice_state(
        &self,
        poll_id: &str,
    ) -> Result<Option<leadengine_wa_core::PollChoiceState>, StoreError> {
        Ok(self.poll_choice_state.get(poll_id).map(|s| s.clone()))
    }

    async fn insert_media_job(&self, job: MediaJob) -> Result<MediaJob, StoreError> {
        self.media_jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn find_pending_inbound_media_jobs(
        &self,
        limit: usize,
        now: OffsetDateTime,
    ) -> Result<Vec<MediaJob>, StoreError> {
        let mut jobs: Vec<MediaJob> = self
            .media_jobs
            .iter()
            .filter(|entry| {
                let job = entry.value();
                job.state == MediaJobState::Pending && job.next_retry_at <= now
            })
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|j| j.next_retry_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn mark_inbound_media_job_processing(&self, id: &str) -> Result<bool, StoreError> {
        match self.media_job_lease.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                if let Some(mut job) = self.media_jobs.get_mut(id) {
                    job.state = MediaJobState::Processing;
                }
                Ok(true)
            }
        }
    }

    async fn complete_inbound_media_job(&self, id: &str) -> Result<(), StoreError> {
        if let Some(mut job) = self.media_jobs.get_mut(id) {
            job.state = MediaJobState::Done;
        }
        self.media_job_lease.remove(id);
        Ok(())
    }

    async fn reschedule_inbound_media_job(
        &self,
        id: &str,
        next_retry_at: OffsetDateTime,
        error: &str,
    ) -> Result<(), StoreError> {
        if let Some(mut job) = self.media_jobs.get_mut(id) {
            job.attempts += 1;
            job.next_retry_at = next_retry_at;
            job.state = MediaJobState::Pending;
            job.metadata["last_error"] = serde_json::Value::String(error.to_string());
        }
        self.media_job_lease.remove(id);
        Ok(())
    }

    async fn fail_inbound_media_job(&self, id: &str, error: &str) -> Result<(), StoreError> {
        if let Some(mut job) = self.media_jobs.get_mut(id) {
            job.attempts += 1;
            job.state = MediaJobState::Failed;
            job.metadata["last_error"] = serde_json::Value::String(error.to_string());
        }
        self.media_job_lease.remove(id);
        Ok(())
    }

    async fn get_media_job(&self, tenant_id: &str, id: &str) -> Result<Option<MediaJob>, StoreError> {
        Ok(self
            .media_jobs
            .get(id)
            .filter(|j| j.tenant_id == tenant_id)
            .map(|j| j.clone()))
    }

    async fn media_job_state(&self, id: &str) -> Result<Option<MediaJobState>, StoreError> {
        Ok(self.media_jobs.get(id).map(|j| j.state))
    }

    async fn upsert_lead(&self, tenant_id: &str, contact_id: &str, ticket_id: &str) -> Result<Lead, StoreError> {
        let key = format!("{tenant_id}|{contact_id}");
        if let Some(id) = self.leads_by_contact.get(&key).map(|r| r.clone()) {
            if let Some(lead) = self.leads.get(&id) {
                return Ok(lead.clone());
            }
        }
        let lead = Lead {
            id: self.next_id("lead"),
            tenant_id: tenant_id.to_string(),
            contact_id: contact_id.to_string(),
            ticket_id: ticket_id.to_string(),
        };
        self.leads_by_contact.insert(key, lead.id.clone());
        self.leads.insert(lead.id.clone(), lead.clone());
        Ok(lead)
    }

    async fn append_lead_activity(
        &self,
        tenant_id: &str,
        lead_id: &str,
        kind: LeadActivityKind,
        message_id: &str,
    ) -> Result<Option<LeadActivity>, StoreError> {
        let seen_key = format!("{lead_id}|{message_id}");
        match self.lead_activity_seen.entry(seen_key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(None),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(message_id.to_string());
                Ok(Some(LeadActivity {
                    id: self.next_id("lead-activity"),
                    tenant_id: tenant_id.to_string(),
                    lead_id: lead_id.to_string(),
                    kind,
                    message_id: message_id.to_string(),
                    created_at: OffsetDateTime::now_utc(),
                }))
            }
        }
    }
}

impl InMemoryStore {
    /// Non-trait helper used by the allocator fake so allocation dedupe
    /// shares the same store instance tests construct.
    pub(crate) fn try_insert_allocation(&self, allocation: Allocation) -> Option<Allocation> {
        match self.allocations_by_dedupe.entry(allocation.dedupe_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(allocation.id.clone());
                self.allocations.insert(allocation.id.clone(), allocation.clone());
                Some(allocation)
            }
        }
    }

    pub fn next_id_for_test(&self, prefix: &str) -> String {
        self.next_id(prefix)
    }
}
