//! Owns every piece of mutable cache state the pipeline touches. Per §9
//! ("Global mutable caches"), these live on an explicit struct passed by
//! reference into every stage — never as package-level singletons — so
//! tests can construct a fresh, isolated `PipelineState` per case and reset
//! any one cache without restarting the process.

use std::sync::Arc;

use dashmap::DashMap;
use leadengine_wa_core::Queue;
use leadengine_wa_dedupe::DedupeCache;
use tokio::sync::Mutex;

/// Per-tenant cache of the resolved default inbound queue (§4.6 step 3),
/// avoiding a `Provisioner.ensureInboundQueue` round-trip on every message.
#[derive(Default)]
pub struct QueueCache {
    queues: DashMap<String, Queue>,
}

impl QueueCache {
    pub fn get(&self, tenant_id: &str) -> Option<Queue> {
        self.queues.get(tenant_id).map(|q| q.clone())
    }

    pub fn put(&self, tenant_id: &str, queue: Queue) {
        self.queues.insert(tenant_id.to_string(), queue);
    }

    /// Drops the cached queue for a tenant. Used after a missing-queue error
    /// forces the pipeline to re-provision and retry (§4.6 step 5).
    pub fn invalidate(&self, tenant_id: &str) {
        self.queues.remove(tenant_id);
    }

    pub fn reset(&self) {
        self.queues.clear();
    }
}

/// Per-tenant list of active campaign ids consulted by the allocation stage
/// (§4.6 step 13). Empty by default: with no campaigns configured, the
/// pipeline allocates against the bare instance only.
#[derive(Default)]
pub struct CampaignCache {
    campaigns: DashMap<String, Vec<String>>,
}

impl CampaignCache {
    pub fn active_campaigns(&self, tenant_id: &str) -> Vec<String> {
        self.campaigns.get(tenant_id).map(|v| v.clone()).unwrap_or_default()
    }

    pub fn set(&self, tenant_id: &str, campaign_ids: Vec<String>) {
        self.campaigns.insert(tenant_id.to_string(), campaign_ids);
    }

    pub fn reset(&self) {
        self.campaigns.clear();
    }
}

/// Single-flight guard keyed by `poll_id`, so concurrent `POLL_CHOICE`
/// webhooks for the same poll serialize their read-merge-write cycle instead
/// of racing each other (§5: "queue and campaign caches... computed with
/// single-flight semantics").
#[derive(Default)]
pub struct PollLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PollLocks {
    pub fn lock_for(&self, poll_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(poll_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub fn reset(&self) {
        self.locks.clear();
    }
}

/// Bundle of every cache the pipeline's components share, constructed once
/// per process (or once per test case) and threaded through by reference.
#[derive(Default)]
pub struct PipelineState {
    pub dedupe: DedupeCache,
    pub queues: QueueCache,
    pub campaigns: CampaignCache,
    pub poll_locks: PollLocks,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears every cache. Intended for tests that need a clean slate
    /// between scenarios without constructing a brand new `PipelineState`.
    pub async fn reset(&self) {
        self.dedupe.reset().await;
        self.queues.reset();
        self.campaigns.reset();
        self.poll_locks.reset();
    }
}
