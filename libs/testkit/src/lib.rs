//! In-memory collaborator fakes for the `Store`, `Broker`, `MediaStore`,
//! `RealtimeBus`, `Provisioner`, and `Allocator` traits declared in
//! `leadengine-wa-core`. Used by `leadengine-wa-pipeline`'s test suite and
//! by the apps' integration tests, in place of a real database/broker/bus.

mod allocator;
mod broker;
mod degraded;
mod media_store;
mod provisioner;
mod realtime;
mod store;

pub use allocator::InMemoryAllocator;
pub use broker::{BrokerOutcome, InMemoryBroker};
pub use degraded::DegradedStore;
pub use media_store::InMemoryMediaStore;
pub use provisioner::InMemoryProvisioner;
pub use realtime::{EmittedEvent, InMemoryRealtimeBus};
pub use store::InMemoryStore;

use std::sync::Arc;

use leadengine_wa_core::{SharedAllocator, SharedBroker, SharedMediaStore, SharedProvisioner, SharedRealtimeBus, SharedStore};

/// Bundle of every collaborator fake, sharing one underlying `InMemoryStore`
/// so provisioning done through `Provisioner`/`Allocator` is visible to
/// direct `Store` assertions in the same test.
pub struct TestHarness {
    pub store: Arc<InMemoryStore>,
    pub broker: Arc<InMemoryBroker>,
    pub media_store: Arc<InMemoryMediaStore>,
    pub realtime: Arc<InMemoryRealtimeBus>,
    pub provisioner: Arc<InMemoryProvisioner>,
    pub allocator: Arc<InMemoryAllocator>,
}

impl Default for TestHarness {
    fn default() -> Self {
        let store = InMemoryStore::shared();
        Self {
            provisioner: Arc::new(InMemoryProvisioner::new(store.clone())),
            allocator: Arc::new(InMemoryAllocator::new(store.clone())),
            broker: Arc::new(InMemoryBroker::new()),
            media_store: Arc::new(InMemoryMediaStore::new()),
            realtime: Arc::new(InMemoryRealtimeBus::new()),
            store,
        }
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared_store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn shared_broker(&self) -> SharedBroker {
        self.broker.clone()
    }

    pub fn shared_media_store(&self) -> SharedMediaStore {
        self.media_store.clone()
    }

    pub fn shared_realtime(&self) -> SharedRealtimeBus {
        self.realtime.clone()
    }

    pub fn shared_provisioner(&self) -> SharedProvisioner {
        self.provisioner.clone()
    }

    pub fn shared_allocator(&self) -> SharedAllocator {
        self.allocator.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadengine_wa_core::{ContactAttrs, Provisioner, Store};

    #[tokio::test]
    async fn harness_shares_one_store_across_collaborators() {
        let harness = TestHarness::new();
        let instance = harness
            .provisioner
            .as_ref()
            .auto_provision_instance("tenant-A", "broker-1")
            .await
            .unwrap();
        let found = harness
            .store
            .find_instance_by_id("tenant-A", &instance.id)
            .await
            .unwrap();
        assert_eq!(found, Some(instance));
    }

    #[tokio::test]
    async fn contact_dedupe_is_idempotent() {
        let store = InMemoryStore::new();
        let a = store
            .find_or_create_contact("tenant-A", "5511999999999", ContactAttrs::default())
            .await
            .unwrap();
        let b = store
            .find_or_create_contact("tenant-A", "5511999999999", ContactAttrs::default())
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }
}
