//! In-memory [`RealtimeBus`] fake: records every emission so tests can
//! assert on the closed event-name set from §6 without standing up a real
//! transport.

use async_trait::async_trait;
use leadengine_wa_core::RealtimeBus;
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    pub channel: String,
    pub event: String,
    pub payload: Value,
}

#[derive(Default)]
pub struct InMemoryRealtimeBus {
    events: Mutex<Vec<EmittedEvent>>,
}

impl InMemoryRealtimeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<EmittedEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_named(&self, event: &str) -> Vec<EmittedEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event == event)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }

    async fn record(&self, channel: impl Into<String>, event: &str, payload: Value) {
        self.events.lock().await.push(EmittedEvent {
            channel: channel.into(),
            event: event.to_string(),
            payload,
        });
    }
}

#[async_trait]
impl RealtimeBus for InMemoryRealtimeBus {
    async fn emit_to_tenant(&self, tenant_id: &str, event: &str, payload: Value) {
        self.record(format!("tenant:{tenant_id}"), event, payload).await;
    }

    async fn emit_to_ticket(&self, ticket_id: &str, event: &str, payload: Value) {
        self.record(format!("ticket:{ticket_id}"), event, payload).await;
    }

    async fn emit_to_agreement(&self, agreement_id: &str, event: &str, payload: Value) {
        self.record(format!("agreement:{agreement_id}"), event, payload).await;
    }
}
