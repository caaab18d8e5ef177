//! Read-only wrapper over [`InMemoryStore`] for the no-`DATABASE_URL` startup
//! path: reads are served from the in-memory map exactly as the test harness
//! does, but every mutation returns [`StoreError::Unavailable`] instead of
//! silently succeeding. Without this, the documented degraded mode ("absence
//! of `DATABASE_URL` rejects writes with a well-known error") would be
//! indistinguishable from the full read-write fake the test suite uses.

use std::sync::Arc;

use async_trait::async_trait;
use leadengine_wa_core::{
    AckUpdate, Allocation, Contact, ContactAttrs, Instance, LastAck, Lead, LeadActivity,
    LeadActivityKind, MediaJob, MediaJobState, Message, NewMessage, Queue, Store, StoreError,
    Ticket, TicketStatus,
};
use time::OffsetDateTime;

use crate::store::InMemoryStore;

fn rejected<T>() -> Result<T, StoreError> {
    Err(StoreError::Unavailable(
        "DATABASE_URL is not set; store is in read-only degraded mode".to_string(),
    ))
}

pub struct DegradedStore {
    inner: Arc<InMemoryStore>,
}

impl DegradedStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Store for DegradedStore {
    async fn find_instance_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Instance>, StoreError> {
        self.inner.find_instance_by_id(tenant_id, id).await
    }

    async fn find_instance_by_broker_id(&self, broker_id: &str) -> Result<Option<Instance>, StoreError> {
        self.inner.find_instance_by_broker_id(broker_id).await
    }

    async fn find_instance_by_tenant_and_broker(
        &self,
        tenant_id: &str,
        broker_id: &str,
    ) -> Result<Option<Instance>, StoreError> {
        self.inner.find_instance_by_tenant_and_broker(tenant_id, broker_id).await
    }

    async fn find_any_instance_for_tenant(&self, tenant_id: &str) -> Result<Option<Instance>, StoreError> {
        self.inner.find_any_instance_for_tenant(tenant_id).await
    }

    async fn insert_instance(&self, _instance: Instance) -> Result<Instance, StoreError> {
        rejected()
    }

    async fn find_default_queue(&self, tenant_id: &str) -> Result<Option<Queue>, StoreError> {
        self.inner.find_default_queue(tenant_id).await
    }

    async fn insert_queue(&self, _queue: Queue) -> Result<Queue, StoreError> {
        rejected()
    }

    async fn find_or_create_contact(
        &self,
        _tenant_id: &str,
        _dedupe_id: &str,
        _attrs: ContactAttrs,
    ) -> Result<Contact, StoreError> {
        rejected()
    }

    async fn find_open_ticket_by_chat(&self, tenant_id: &str, chat_id: &str) -> Result<Option<Ticket>, StoreError> {
        self.inner.find_open_ticket_by_chat(tenant_id, chat_id).await
    }

    async fn insert_ticket(&self, _ticket: Ticket) -> Result<Ticket, StoreError> {
        rejected()
    }

    async fn get_ticket(&self, tenant_id: &str, id: &str) -> Result<Option<Ticket>, StoreError> {
        self.inner.get_ticket(tenant_id, id).await
    }

    async fn set_ticket_status(&self, _tenant_id: &str, _id: &str, _status: TicketStatus) -> Result<(), StoreError> {
        rejected()
    }

    async fn find_message_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        self.inner.find_message_by_external_id(tenant_id, external_id).await
    }

    async fn create_message(
        &self,
        _tenant_id: &str,
        _ticket_id: &str,
        _new_message: NewMessage,
    ) -> Result<Message, StoreError> {
        rejected()
    }

    async fn get_message(&self, tenant_id: &str, id: &str) -> Result<Option<Message>, StoreError> {
        self.inner.get_message(tenant_id, id).await
    }

    async fn update_message(&self, _message: Message) -> Result<Message, StoreError> {
        rejected()
    }

    async fn find_outbound_message_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        self.inner.find_outbound_message_by_external_id(tenant_id, external_id).await
    }

    async fn apply_broker_ack(&self, _tenant_id: &str, _message_id: &str, _update: AckUpdate) -> Result<Message, StoreError> {
        rejected()
    }

    async fn last_ack(&self, tenant_id: &str, message_id: &str) -> Result<Option<LastAck>, StoreError> {
        self.inner.last_ack(tenant_id, message_id).await
    }

    async fn find_poll_vote_message_candidate(
        &self,
        tenant_id: &str,
        poll_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Option<Message>, StoreError> {
        self.inner.find_poll_vote_message_candidate(tenant_id, poll_id, chat_id).await
    }

    async fn upsert_poll_metadata(&self, _metadata: leadengine_wa_core::PollMetadata) -> Result<(), StoreError> {
        rejected()
    }

    async fn get_poll_metadata(
        &self,
        tenant_id: &str,
        poll_id: &str,
    ) -> Result<Option<leadengine_wa_core::PollMetadata>, StoreError> {
        self.inner.get_poll_metadata(tenant_id, poll_id).await
    }

    async fn upsert_poll_choice_state(&self, _state: leadengine_wa_core::PollChoiceState) -> Result<(), StoreError> {
        rejected()
    }

    async fn get_poll_choice_state(
        &self,
        poll_id: &str,
    ) -> Result<Option<leadengine_wa_core::PollChoiceState>, StoreError> {
        self.inner.get_poll_choice_state(poll_id).await
    }

    async fn insert_media_job(&self, _job: MediaJob) -> Result<MediaJob, StoreError> {
        rejected()
    }

    async fn find_pending_inbound_media_jobs(&self, limit: usize, now: OffsetDateTime) -> Result<Vec<MediaJob>, StoreError> {
        self.inner.find_pending_inbound_media_jobs(limit, now).await
    }

    async fn mark_inbound_media_job_processing(&self, _id: &str) -> Result<bool, StoreError> {
        rejected()
    }

    async fn complete_inbound_media_job(&self, _id: &str) -> Result<(), StoreError> {
        rejected()
    }

    async fn reschedule_inbound_media_job(
        &self,
        _id: &str,
        _next_retry_at: OffsetDateTime,
        _error: &str,
    ) -> Result<(), StoreError> {
        rejected()
    }

    async fn fail_inbound_media_job(&self, _id: &str, _error: &str) -> Result<(), StoreError> {
        rejected()
    }

    async fn get_media_job(&self, tenant_id: &str, id: &str) -> Result<Option<MediaJob>, StoreError> {
        self.inner.get_media_job(tenant_id, id).await
    }

    async fn media_job_state(&self, id: &str) -> Result<Option<MediaJobState>, StoreError> {
        self.inner.media_job_state(id).await
    }

    async fn upsert_lead(&self, _tenant_id: &str, _contact_id: &str, _ticket_id: &str) -> Result<Lead, StoreError> {
        rejected()
    }

    async fn append_lead_activity(
        &self,
        _tenant_id: &str,
        _lead_id: &str,
        _kind: LeadActivityKind,
        _message_id: &str,
    ) -> Result<Option<LeadActivity>, StoreError> {
        rejected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_pass_through_writes_are_rejected() {
        let inner = InMemoryStore::shared();
        let degraded = DegradedStore::new(inner.clone());

        let found = degraded.find_instance_by_id("tenant-A", "missing").await.unwrap();
        assert_eq!(found, None);

        let err = degraded
            .insert_instance(Instance {
                id: "inst-1".into(),
                tenant_id: "tenant-A".into(),
                broker_id: "broker-1".into(),
                name: None,
                status: leadengine_wa_core::InstanceStatus::Pending,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn rejected_queue_insert_never_reaches_the_inner_store() {
        let inner = InMemoryStore::shared();
        let degraded = DegradedStore::new(inner.clone());

        let err = degraded
            .insert_queue(Queue { id: "queue-1".into(), tenant_id: "tenant-A".into(), is_default: true })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(inner.find_default_queue("tenant-A").await.unwrap().is_none());
    }
}
