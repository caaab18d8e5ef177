//! In-memory [`MediaStore`] fake: keeps bytes in a map and mints a
//! deterministic fake URL rather than a real signed one.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use leadengine_wa_core::{DownloadedMedia, MediaStore};

#[derive(Default)]
pub struct InMemoryMediaStore {
    objects: DashMap<String, DownloadedMedia>,
}

impl InMemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stored_key: &str) -> Option<DownloadedMedia> {
        self.objects.get(stored_key).map(|m| m.clone())
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn put(&self, tenant_id: &str, key: &str, media: &DownloadedMedia) -> anyhow::Result<String> {
        let stored_key = format!("{tenant_id}/{key}");
        self.objects.insert(stored_key.clone(), media.clone());
        Ok(stored_key)
    }

    async fn sign(&self, stored_key: &str, ttl: Duration) -> anyhow::Result<String> {
        Ok(format!("https://media.test.local/{stored_key}?ttl={}", ttl.as_secs()))
    }
}
