//! [`Provisioner`] fake backed by the same [`InMemoryStore`] instance a test
//! wires up, so auto-provisioned instances/queues are visible to later
//! `Store` assertions.

use std::sync::Arc;

use async_trait::async_trait;
use leadengine_wa_core::{Instance, InstanceStatus, Provisioner, Queue, Store, StoreError};

use crate::store::InMemoryStore;

pub struct InMemoryProvisioner {
    store: Arc<InMemoryStore>,
}

impl InMemoryProvisioner {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Provisioner for InMemoryProvisioner {
    async fn auto_provision_instance(
        &self,
        tenant_id: &str,
        broker_id: &str,
    ) -> Result<Instance, StoreError> {
        if let Some(existing) = self.store.find_instance_by_tenant_and_broker(tenant_id, broker_id).await? {
            return Ok(existing);
        }
        let instance = Instance {
            id: self.store.next_id_for_test("instance"),
            tenant_id: tenant_id.to_string(),
            broker_id: broker_id.to_string(),
            name: None,
            status: InstanceStatus::Pending,
        };
        match self.store.insert_instance(instance).await {
            Ok(created) => Ok(created),
            Err(StoreError::Conflict { existing_id: Some(id), .. }) => self
                .store
                .find_instance_by_broker_id(broker_id)
                .await?
                .filter(|i| i.id == id)
                .ok_or_else(|| StoreError::not_found("instance", broker_id)),
            Err(other) => Err(other),
        }
    }

    async fn ensure_inbound_queue(&self, tenant_id: &str) -> Result<Queue, StoreError> {
        if let Some(existing) = self.store.find_default_queue(tenant_id).await? {
            return Ok(existing);
        }
        let queue = Queue {
            id: self.store.next_id_for_test("queue"),
            tenant_id: tenant_id.to_string(),
            is_default: true,
        };
        match self.store.insert_queue(queue).await {
            Ok(created) => Ok(created),
            Err(StoreError::Conflict { .. }) => self
                .store
                .find_default_queue(tenant_id)
                .await?
                .ok_or_else(|| StoreError::not_found("queue", tenant_id)),
            Err(other) => Err(other),
        }
    }
}
