//! Abstract collaborators consumed by the pipeline crate. Every trait here is
//! a boundary named in §1 as "out of scope": the relational store, the
//! realtime fan-out bus, the broker client, object storage for media, and
//! tenant/queue/campaign provisioning. `leadengine-wa-testkit` ships
//! in-memory implementations of each so the binaries run standalone in
//! dev/test with no external services required.

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::types::{
    Allocation, Contact, Instance, Lead, LeadActivity, LeadActivityKind, MediaJob, MediaJobState,
    Message, MessageStatus, Queue, Ticket, TicketStatus,
};

/// Fields applied by the ACK state machine (C7) to a stored outbound message.
#[derive(Debug, Clone)]
pub struct AckUpdate {
    pub status: MessageStatus,
    pub metadata: Value,
    pub instance_id: Option<String>,
    pub delivered_at: Option<OffsetDateTime>,
    pub read_at: Option<OffsetDateTime>,
}

/// Fields used to create a new inbound/outbound message. `external_id` is
/// checked for uniqueness within the tenant by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub direction: crate::types::MessageDirection,
    pub kind: crate::types::MessageType,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
    pub external_id: Option<String>,
    pub instance_id: Option<String>,
    pub status: MessageStatus,
    pub metadata: Value,
}

/// Attributes used to resolve-or-create a [`Contact`]. `displayName` picks
/// the first non-empty of `name, pushName, metadata.pushName` per §4.6 step 4;
/// that precedence is applied by the pipeline before calling this trait.
#[derive(Debug, Clone, Default)]
pub struct ContactAttrs {
    pub display_name: Option<String>,
    pub primary_phone: Option<String>,
    pub document: Option<String>,
}

/// The relational store. All queries and mutations are tenant-scoped; the
/// tenant id is the primary isolation axis and is passed explicitly rather
/// than implied by session state.
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_instance_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Instance>, StoreError>;
    async fn find_instance_by_broker_id(&self, broker_id: &str) -> Result<Option<Instance>, StoreError>;
    async fn find_instance_by_tenant_and_broker(
        &self,
        tenant_id: &str,
        broker_id: &str,
    ) -> Result<Option<Instance>, StoreError>;
    async fn find_any_instance_for_tenant(&self, tenant_id: &str) -> Result<Option<Instance>, StoreError>;
    /// Inserts a new instance, recovering from a unique-violation on
    /// `(tenant_id, broker_id)` by reading back the existing row rather than
    /// pre-checking with a `SELECT`.
    async fn insert_instance(&self, instance: Instance) -> Result<Instance, StoreError>;

    async fn find_default_queue(&self, tenant_id: &str) -> Result<Option<Queue>, StoreError>;
    async fn insert_queue(&self, queue: Queue) -> Result<Queue, StoreError>;

    async fn find_or_create_contact(
        &self,
        tenant_id: &str,
        dedupe_id: &str,
        attrs: ContactAttrs,
    ) -> Result<Contact, StoreError>;

    /// Finds the single `OPEN` ticket for `(tenant_id, chat_id)`, if any.
    async fn find_open_ticket_by_chat(
        &self,
        tenant_id: &str,
        chat_id: &str,
    ) -> Result<Option<Ticket>, StoreError>;
    /// Creates a new `OPEN` ticket. On a unique-violation against the
    /// `(tenant_id, chat_id, status=OPEN)` partial index, returns
    /// `StoreError::Conflict` carrying `existing_id` so the caller can reuse it.
    async fn insert_ticket(&self, ticket: Ticket) -> Result<Ticket, StoreError>;
    async fn get_ticket(&self, tenant_id: &str, id: &str) -> Result<Option<Ticket>, StoreError>;
    async fn set_ticket_status(
        &self,
        tenant_id: &str,
        id: &str,
        status: TicketStatus,
    ) -> Result<(), StoreError>;

    /// Finds an existing message by `external_id` within the tenant. Used to
    /// recover from a unique-violation during [`Store::create_message`].
    async fn find_message_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError>;
    /// Persists a message, updating `ticket.last_message_at` and
    /// `last_message_preview` atomically. On `external_id` conflict, returns
    /// `StoreError::Conflict`; the caller loads the existing message instead.
    async fn create_message(
        &self,
        tenant_id: &str,
        ticket_id: &str,
        new_message: NewMessage,
    ) -> Result<Message, StoreError>;
    async fn get_message(&self, tenant_id: &str, id: &str) -> Result<Option<Message>, StoreError>;
    async fn update_message(&self, message: Message) -> Result<Message, StoreError>;

    /// Locates the stored message an outbound ACK refers to by `(tenant_id,
    /// instance_id?, external_id)`. Only messages with `from_me == true`
    /// (i.e. outbound messages) are eligible targets.
    async fn find_outbound_message_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError>;
    /// Applies an ACK atomically, recording it as the new `last_ack`.
    async fn apply_broker_ack(
        &self,
        tenant_id: &str,
        message_id: &str,
        update: AckUpdate,
    ) -> Result<Message, StoreError>;
    async fn last_ack(&self, tenant_id: &str, message_id: &str) -> Result<Option<crate::types::LastAck>, StoreError>;

    /// Locates the message carrying a poll vote (the poll-creation message or
    /// a later vote message) by tenant, poll id, chat id, and any other
    /// identifiers the reconciler has available.
    async fn find_poll_vote_message_candidate(
        &self,
        tenant_id: &str,
        poll_id: &str,
        chat_id: Option<&str>,
    ) -> Result<Option<Message>, StoreError>;

    async fn upsert_poll_metadata(&self, metadata: crate::types::PollMetadata) -> Result<(), StoreError>;
    async fn get_poll_metadata(&self, tenant_id: &str, poll_id: &str) -> Result<Option<crate::types::PollMetadata>, StoreError>;

    /// Idempotent upsert keyed by `poll-state:<poll_id>`.
    async fn upsert_poll_choice_state(&self, state: crate::types::PollChoiceState) -> Result<(), StoreError>;
    async fn get_poll_choice_state(&self, poll_id: &str) -> Result<Option<crate::types::PollChoiceState>, StoreError>;

    async fn insert_media_job(&self, job: MediaJob) -> Result<MediaJob, StoreError>;
    async fn find_pending_inbound_media_jobs(
        &self,
        limit: usize,
        now: OffsetDateTime,
    ) -> Result<Vec<MediaJob>, StoreError>;
    /// Leases a job for processing; returns `false` if another worker already
    /// holds the lease (acts as at-most-one-processor-per-job).
    async fn mark_inbound_media_job_processing(&self, id: &str) -> Result<bool, StoreError>;
    async fn complete_inbound_media_job(&self, id: &str) -> Result<(), StoreError>;
    async fn reschedule_inbound_media_job(
        &self,
        id: &str,
        next_retry_at: OffsetDateTime,
        error: &str,
    ) -> Result<(), StoreError>;
    async fn fail_inbound_media_job(&self, id: &str, error: &str) -> Result<(), StoreError>;
    async fn get_media_job(&self, tenant_id: &str, id: &str) -> Result<Option<MediaJob>, StoreError>;
    async fn media_job_state(&self, id: &str) -> Result<Option<MediaJobState>, StoreError>;

    async fn upsert_lead(&self, tenant_id: &str, contact_id: &str, ticket_id: &str) -> Result<Lead, StoreError>;
    /// Appends a `LeadActivity` exactly once per `message_id`; repeats are a noop.
    async fn append_lead_activity(
        &self,
        tenant_id: &str,
        lead_id: &str,
        kind: LeadActivityKind,
        message_id: &str,
    ) -> Result<Option<LeadActivity>, StoreError>;
}

pub type SharedStore = std::sync::Arc<dyn Store>;

/// Deadline-bounded client for downloading inbound media from the broker.
/// The pipeline tries a direct Baileys download (5s deadline) first, falling
/// back to a broker-mediated download (8s deadline) when `direct_path` or
/// `media_key` is available.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn download_direct(
        &self,
        tenant_id: &str,
        instance_id: &str,
        media_key: Option<&str>,
        direct_path: Option<&str>,
        timeout: std::time::Duration,
    ) -> anyhow::Result<DownloadedMedia>;

    async fn download_via_broker(
        &self,
        tenant_id: &str,
        broker_id: Option<&str>,
        media_key: Option<&str>,
        direct_path: Option<&str>,
        timeout: std::time::Duration,
    ) -> anyhow::Result<DownloadedMedia>;
}

pub type SharedBroker = std::sync::Arc<dyn Broker>;

#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
}

/// Object storage for downloaded media. `put` stores bytes and returns a
/// stable key; `sign` mints a URL valid for the configured TTL.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn put(&self, tenant_id: &str, key: &str, media: &DownloadedMedia) -> anyhow::Result<String>;
    async fn sign(&self, stored_key: &str, ttl: std::time::Duration) -> anyhow::Result<String>;
}

pub type SharedMediaStore = std::sync::Arc<dyn MediaStore>;

/// Realtime fan-out bus (C9's downstream collaborator). Emission is
/// best-effort and must never block the caller for long; implementations
/// should apply their own bounded timeout internally.
#[async_trait]
pub trait RealtimeBus: Send + Sync {
    async fn emit_to_tenant(&self, tenant_id: &str, event: &str, payload: Value);
    async fn emit_to_ticket(&self, ticket_id: &str, event: &str, payload: Value);
    async fn emit_to_agreement(&self, agreement_id: &str, event: &str, payload: Value);
}

pub type SharedRealtimeBus = std::sync::Arc<dyn RealtimeBus>;

/// Tenant/queue/instance provisioning. Writes here use unique constraints to
/// survive concurrent inserts ("insert, catch unique, read"); queue
/// resolution is cached per tenant by the pipeline with single-flight
/// semantics to avoid a provisioning stampede.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn auto_provision_instance(
        &self,
        tenant_id: &str,
        broker_id: &str,
    ) -> Result<Instance, StoreError>;
    async fn ensure_inbound_queue(&self, tenant_id: &str) -> Result<Queue, StoreError>;
}

pub type SharedProvisioner = std::sync::Arc<dyn Provisioner>;

/// Campaign/agreement allocation. `add_allocation` shares the rest of the
/// provisioner surface's unique-violation-as-noop contract: a duplicate
/// dedupe key is treated as success, not an error.
#[async_trait]
pub trait Allocator: Send + Sync {
    async fn add_allocation(&self, allocation: Allocation) -> Result<Option<Allocation>, StoreError>;
}

pub type SharedAllocator = std::sync::Arc<dyn Allocator>;
