//! Scriptable [`Broker`] fake. Tests queue outcomes ahead of time (e.g. one
//! `Timeout` followed by a `Success`) to exercise the media-download
//! fallback cascade in the inbound pipeline and the backoff loop in the
//! media retry worker.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use leadengine_wa_core::{Broker, DownloadedMedia};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub enum BrokerOutcome {
    Success(DownloadedMedia),
    Failure(String),
}

pub struct InMemoryBroker {
    direct: Mutex<VecDeque<BrokerOutcome>>,
    via_broker: Mutex<VecDeque<BrokerOutcome>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            direct: Mutex::new(VecDeque::new()),
            via_broker: Mutex::new(VecDeque::new()),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queue_direct(&self, outcome: BrokerOutcome) {
        self.direct.lock().await.push_back(outcome);
    }

    pub async fn queue_via_broker(&self, outcome: BrokerOutcome) {
        self.via_broker.lock().await.push_back(outcome);
    }
}

fn resolve(outcome: BrokerOutcome) -> anyhow::Result<DownloadedMedia> {
    match outcome {
        BrokerOutcome::Success(media) => Ok(media),
        BrokerOutcome::Failure(reason) => Err(anyhow::anyhow!(reason)),
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn download_direct(
        &self,
        _tenant_id: &str,
        _instance_id: &str,
        _media_key: Option<&str>,
        _direct_path: Option<&str>,
        _timeout: Duration,
    ) -> anyhow::Result<DownloadedMedia> {
        let next = self.direct.lock().await.pop_front();
        match next {
            Some(outcome) => resolve(outcome),
            None => Err(anyhow::anyhow!("no direct download outcome queued")),
        }
    }

    async fn download_via_broker(
        &self,
        _tenant_id: &str,
        _broker_id: Option<&str>,
        _media_key: Option<&str>,
        _direct_path: Option<&str>,
        _timeout: Duration,
    ) -> anyhow::Result<DownloadedMedia> {
        let next = self.via_broker.lock().await.pop_front();
        match next {
            Some(outcome) => resolve(outcome),
            None => Err(anyhow::anyhow!("no broker download outcome queued")),
        }
    }
}
