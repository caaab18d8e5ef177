//! [`Allocator`] fake sharing the [`InMemoryStore`]'s dedupe-keyed
//! allocation table, so a duplicate `dedupe_key` is a noop exactly like the
//! real "insert, catch unique, read" contract.

use std::sync::Arc;

use async_trait::async_trait;
use leadengine_wa_core::{Allocation, Allocator, StoreError};

use crate::store::InMemoryStore;

pub struct InMemoryAllocator {
    store: Arc<InMemoryStore>,
}

impl InMemoryAllocator {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Allocator for InMemoryAllocator {
    async fn add_allocation(&self, allocation: Allocation) -> Result<Option<Allocation>, StoreError> {
        Ok(self.store.try_insert_allocation(allocation))
    }
}
