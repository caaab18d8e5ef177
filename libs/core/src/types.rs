use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Lifecycle state of a WhatsApp [`Instance`].
///
/// ```
/// use leadengine_wa_core::InstanceStatus;
/// assert_eq!(InstanceStatus::Connected.as_str(), "connected");
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Connected,
    Disconnected,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Connected => "connected",
            InstanceStatus::Disconnected => "disconnected",
        }
    }
}

/// A WhatsApp session owned by a tenant. Identified by `id`, by `broker_id`, or
/// by the `(tenant_id, broker_id)` pair; at most one instance may exist per pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: String,
    pub tenant_id: String,
    pub broker_id: String,
    pub name: Option<String>,
    pub status: InstanceStatus,
}

/// A person addressable by `primary_phone` or a deterministic identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Contact {
    pub id: String,
    pub tenant_id: String,
    pub display_name: Option<String>,
    pub primary_phone: Option<String>,
    pub document: Option<String>,
}

/// Routing target for tickets. Exactly one default queue per tenant is
/// guaranteed, auto-provisioned on first use by a [`crate::Provisioner`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Queue {
    pub id: String,
    pub tenant_id: String,
    pub is_default: bool,
}

/// Lifecycle state of a [`Ticket`]. Ranked loosely by how much agent attention
/// the conversation still needs; `OPEN` tickets are reused by
/// `find_or_create_open_ticket_by_chat`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TicketStatus {
    Open,
    Pending,
    Closed,
}

/// An open (or formerly open) conversation with a contact.
///
/// Invariant: at most one `OPEN` ticket exists per `(tenant_id, chat_id)`;
/// enforced by the `Store` via a partial-unique constraint, never a racy
/// pre-check `SELECT`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticket {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub queue_id: String,
    pub chat_id: String,
    pub status: TicketStatus,
    pub agreement_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub updated_at: OffsetDateTime,
    pub last_message_at: Option<OffsetDateTime>,
    pub last_message_preview: Option<String>,
}

/// Direction of a [`Message`] relative to the tenant's WhatsApp instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

/// Canonical message type, folded down from the many Baileys payload shapes
/// by `leadengine-wa-normalizer`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Contact,
    Template,
    Poll,
    PollChoice,
    Media,
    Unknown,
}

impl MessageType {
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            MessageType::Image | MessageType::Video | MessageType::Audio | MessageType::Document
        )
    }
}

/// Delivery status of an outbound [`Message`], ranked so the ACK state
/// machine (C7) can enforce monotone transitions. `Failed` is terminal but
/// orthogonal to the rank ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Rank used by the ACK state machine: `Pending(0) < Sent(1) < Delivered(2) < Read(3)`.
    /// `Failed` has no place in the monotone order and is handled as a terminal case
    /// by the caller rather than compared by rank.
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 0,
        }
    }
}

/// An event on a ticket's timeline. `external_id` is unique within a tenant;
/// the `Store` enforces this with an "insert, catch unique, read" pattern
/// rather than a pre-check `SELECT`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub tenant_id: String,
    pub ticket_id: String,
    pub direction: MessageDirection,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
    pub external_id: Option<String>,
    pub instance_id: Option<String>,
    pub status: MessageStatus,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: OffsetDateTime,
}

/// Record of the last applied ACK, used by the monotonicity and late-ACK
/// checks in the ACK state machine (C7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastAck {
    pub status: MessageStatus,
    pub received_at: OffsetDateTime,
}

/// A single poll option.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollOption {
    pub id: String,
    pub index: u32,
    pub title: String,
}

/// Static description of a poll: question, options, and the creation key
/// needed to decrypt subsequent `POLL_CHOICE` payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollMetadata {
    pub poll_id: String,
    pub tenant_id: String,
    pub instance_id: Option<String>,
    pub question: String,
    pub options: Vec<PollOption>,
    pub allow_multiple_answers: bool,
    pub creation_message_id: String,
    pub creation_message_key: Option<String>,
    pub message_secret: Option<String>,
    pub message_secret_version: Option<u32>,
}

/// A single voter's ballot, recorded verbatim so per-vote data always wins
/// over the rebuilt aggregates when the two disagree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollVote {
    pub option_ids: Vec<String>,
    pub message_id: String,
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub encrypted: bool,
}

/// Dynamic tally of votes per poll. `aggregates.option_totals` is rebuilt
/// from `votes` on every reconciliation; if `sum(option_totals) !=
/// total_votes` the reconciler logs a warning but still persists, favouring
/// per-vote data as authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollAggregates {
    pub total_voters: u32,
    pub total_votes: u32,
    pub option_totals: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollContext {
    pub tenant_id: String,
    pub creation_message_id: String,
    pub creation_message_key: Option<String>,
    pub question: Option<String>,
}

/// Persisted under the idempotent key `poll-state:<poll_id>`. Tenant and
/// creation-key context are recovered from metadata on any subsequent
/// webhook that lacks them, never re-derived from a fresh `PollMetadata`
/// lookup alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollChoiceState {
    pub poll_id: String,
    pub options: Vec<PollOption>,
    pub votes: BTreeMap<String, PollVote>,
    pub aggregates: PollAggregates,
    pub updated_at: OffsetDateTime,
    pub context: PollContext,
}

/// Lifecycle state of a deferred media download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum MediaJobState {
    Pending,
    Processing,
    Done,
    Failed,
}

/// Deferred work item created by the inbound pipeline (C6) when an inbound
/// media attachment cannot be downloaded synchronously; drained by the media
/// retry worker (C10).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaJob {
    pub id: String,
    pub tenant_id: String,
    pub message_id: String,
    pub message_external_id: Option<String>,
    pub instance_id: Option<String>,
    pub broker_id: Option<String>,
    pub media_type: MessageType,
    pub media_key: Option<String>,
    pub direct_path: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub attempts: u32,
    pub next_retry_at: OffsetDateTime,
    pub state: MediaJobState,
}

/// Minimal CRM-adjacent record referenced by the inbound pipeline's "lead
/// sync" step (§4.6 step 11). Kept intentionally thin: this crate is not a
/// CRM, it only fulfils the contract the pipeline needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub ticket_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadActivityKind {
    LeadActivity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadActivity {
    pub id: String,
    pub tenant_id: String,
    pub lead_id: String,
    pub kind: LeadActivityKind,
    pub message_id: String,
    pub created_at: OffsetDateTime,
}

/// Dedup-gated allocation of an inbound contact to a campaign (or bare
/// instance, when no campaign applies). See §4.6 step 13.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub id: String,
    pub tenant_id: String,
    pub campaign_id: Option<String>,
    pub agreement_id: Option<String>,
    pub instance_id: String,
    pub dedupe_key: String,
}
