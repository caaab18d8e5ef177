//! Event dispatcher (C5), inbound pipeline (C6), ACK state machine (C7),
//! poll reconciler (C8), and bounded realtime emitter (C9).
//!
//! This crate has no HTTP or CLI surface of its own: it is wired up by
//! `apps/webhook-ingress` (C5/C6/C7/C8/C9) and `apps/media-retry-worker`
//! (C10), each supplying a [`PipelineDeps`] built from real adapters in
//! production and from `leadengine-wa-testkit`'s in-memory fakes in tests.

mod ack;
mod dispatch;
mod error;
mod inbound;
mod media_retry;
mod poll;
mod realtime;
mod state;

pub use ack::{apply_ack, IncomingAck, LATE_ACK_THRESHOLD};
pub use dispatch::{dispatch_webhook_body, DispatchResult, DispatchSummary, EventOutcome};
pub use error::{AckError, DispatchError, MediaError, PipelineError, PollError};
pub use inbound::{process_inbound_message, InboundOutcome};
pub use media_retry::{backoff_secs, drain_due, DrainSummary, DEFAULT_BATCH_SIZE, DEFAULT_INTERVAL_SECS};
pub use poll::{reconcile_poll_choice, IncomingPollChoice};
pub use realtime::{
    DEFAULT_EMIT_TIMEOUT, EVENT_LEAD_ACTIVITIES_NEW, EVENT_LEAD_ALLOCATIONS_NEW, EVENT_LEADS_UPDATED,
    EVENT_MESSAGE_UPDATED, EVENT_TICKETS_NEW, EVENT_TICKETS_UPDATED, EVENT_TICKET_MESSAGES_NEW,
};
pub use state::{CampaignCache, PipelineState, PollLocks, QueueCache};

use leadengine_wa_core::{SharedAllocator, SharedBroker, SharedMediaStore, SharedProvisioner, SharedRealtimeBus, SharedStore};
use leadengine_wa_dlq::SharedDlqSink;

/// Every external collaborator the pipeline needs, bundled so call sites
/// take one argument instead of six. Built once per process by the binary
/// crates; tests build one per case from `leadengine-wa-testkit::TestHarness`.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: SharedStore,
    pub broker: SharedBroker,
    pub media_store: SharedMediaStore,
    pub realtime: SharedRealtimeBus,
    pub provisioner: SharedProvisioner,
    pub allocator: SharedAllocator,
    pub dlq: SharedDlqSink,
}
