//! Core domain types and storage/transport contracts for the WhatsApp
//! ingestion core.
//!
//! This crate is the one place every other crate in the workspace depends
//! on: it defines the tenant-scoped entities (§3 of the design doc) and the
//! abstract collaborators (`Store`, `Broker`, `MediaStore`, `RealtimeBus`,
//! `Provisioner`, `Allocator`) that the normalizer, pipeline, and apps are
//! built against. It deliberately has no HTTP, NATS, or database
//! dependency — those live at the edges, behind the traits declared here.
//!
//! ```
//! use leadengine_wa_core::{InstanceStatus, MessageStatus};
//!
//! assert!(MessageStatus::Read.rank() > MessageStatus::Sent.rank());
//! assert_eq!(InstanceStatus::Connected.as_str(), "connected");
//! ```

mod error;
mod ids;
mod traits;
mod types;

pub use error::{ErrorBody, ErrorDetail, ErrorMeta, StoreError};
pub use ids::{deterministic_id, random_id};
pub use traits::{
    AckUpdate, Allocator, Broker, ContactAttrs, DownloadedMedia, MediaStore, NewMessage,
    Provisioner, RealtimeBus, SharedAllocator, SharedBroker, SharedMediaStore, SharedProvisioner,
    SharedRealtimeBus, SharedStore, Store,
};
pub use types::{
    Allocation, Contact, Instance, InstanceStatus, LastAck, Lead, LeadActivity, LeadActivityKind,
    MediaJob, MediaJobState, Message, MessageDirection, MessageStatus, MessageType, PollAggregates,
    PollChoiceState, PollContext, PollMetadata, PollOption, PollVote, Queue, Ticket, TicketStatus,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_status_rank_is_monotone() {
        assert!(MessageStatus::Pending.rank() < MessageStatus::Sent.rank());
        assert!(MessageStatus::Sent.rank() < MessageStatus::Delivered.rank());
        assert!(MessageStatus::Delivered.rank() < MessageStatus::Read.rank());
    }

    #[test]
    fn media_type_classification() {
        assert!(MessageType::Image.is_media());
        assert!(MessageType::Document.is_media());
        assert!(!MessageType::Text.is_media());
        assert!(!MessageType::Poll.is_media());
    }

    #[test]
    fn store_error_helpers_set_kind() {
        let conflict = StoreError::conflict_with("ticket", "dup chat", "ticket-1");
        assert!(conflict.is_conflict());
        let not_found = StoreError::not_found("instance", "missing");
        assert!(not_found.is_not_found());
    }

    #[test]
    fn ids_are_stable_for_same_seed() {
        let a = deterministic_id("contact-", "tenant-a|5511999999999");
        let b = deterministic_id("contact-", "tenant-a|5511999999999");
        assert_eq!(a, b);
        let c = deterministic_id("contact-", "tenant-a|5511999999998");
        assert_ne!(a, c);
    }
}
