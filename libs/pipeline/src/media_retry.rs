//! Media Retry Worker (C10): periodically drains `MediaJob` records the
//! inbound pipeline (C6 step 7) could not download synchronously, with
//! bounded exponential backoff and a dead-letter after five failed
//! attempts, per §4.10.
//!
//! This module only implements the per-cycle drain (pure enough to unit
//! test against `leadengine-wa-testkit`'s fakes); the periodic loop and
//! cancellation handling live in `apps/media-retry-worker`, which also owns
//! the `SIGINT`/`SIGTERM` boundary named in §5.

use leadengine_wa_core::{DownloadedMedia, MediaJob};
use leadengine_wa_dlq::{DlqError, DlqRecord};
use leadengine_wa_telemetry::{record_counter, TelemetryLabels};
use time::OffsetDateTime;
use tracing::warn;

use crate::PipelineDeps;

/// Default cycle interval (`MEDIA_RETRY_WORKER_INTERVAL_MS`).
pub const DEFAULT_INTERVAL_SECS: u64 = 60;
/// Default batch size per cycle (`MEDIA_RETRY_WORKER_BATCH_SIZE`).
pub const DEFAULT_BATCH_SIZE: usize = 10;
const MAX_ATTEMPTS: u32 = 5;
const MEDIA_SIGNED_URL_TTL: std::time::Duration = std::time::Duration::from_secs(3600);
const DOWNLOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(8);

/// Tally of what happened during one [`drain_due`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub leases_lost: usize,
}

impl DrainSummary {
    pub fn is_empty(&self) -> bool {
        self.processed == 0
    }
}

/// §4.10 backoff law: `min(60s * 2^(attempts-1), 30min)`. `attempts` is the
/// post-increment count, so the first retry (`attempts=1`) waits 60s, the
/// second (`attempts=2`) waits 120s, and so on up to the 30-minute cap.
pub fn backoff_secs(attempts: u32) -> u64 {
    let exponent = attempts.saturating_sub(1).min(10);
    let secs = DEFAULT_INTERVAL_SECS.saturating_mul(1u64 << exponent);
    secs.min(30 * 60)
}

/// Runs one drain pass over whatever is due at `now` (§4.10 steps 1-4):
/// lists up to `batch_size` pending jobs ordered by `next_retry_at`, leases
/// each one, attempts a download, and either completes, reschedules, or
/// dead-letters it.
pub async fn drain_due(deps: &PipelineDeps, batch_size: usize, now: OffsetDateTime) -> DrainSummary {
    let mut summary = DrainSummary::default();
    let jobs = match deps.store.find_pending_inbound_media_jobs(batch_size, now).await {
        Ok(jobs) => jobs,
        Err(err) => {
            warn!(error = %err, "failed to list pending inbound media jobs");
            return summary;
        }
    };

    for job in jobs {
        summary.processed += 1;
        match deps.store.mark_inbound_media_job_processing(&job.id).await {
            Ok(true) => {}
            Ok(false) => {
                summary.leases_lost += 1;
                continue;
            }
            Err(err) => {
                warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %err, "failed to lease media job");
                continue;
            }
        }

        match process_job(deps, &job).await {
            Ok(()) => {
                summary.succeeded += 1;
                record_counter(
                    "inbound_media_retry_success",
                    1,
                    &TelemetryLabels::new(job.tenant_id.clone()),
                );
            }
            Err(err) => {
                if handle_failure(deps, &job, &err.to_string()).await {
                    summary.dead_lettered += 1;
                } else {
                    summary.rescheduled += 1;
                }
            }
        }
    }

    summary
}

async fn process_job(deps: &PipelineDeps, job: &MediaJob) -> anyhow::Result<()> {
    let downloaded = download(deps, job).await?;
    let key = format!(
        "{}/{}",
        job.message_id,
        downloaded.file_name.clone().unwrap_or_else(|| "media".to_string())
    );
    let stored_key = deps.media_store.put(&job.tenant_id, &key, &downloaded).await?;
    let url = deps.media_store.sign(&stored_key, MEDIA_SIGNED_URL_TTL).await?;

    let Some(mut message) = deps.store.get_message(&job.tenant_id, &job.message_id).await? else {
        anyhow::bail!("owning message {} no longer exists", job.message_id);
    };
    message.media_url = Some(url);
    if let Some(mime) = downloaded.mime_type {
        message.mime_type = Some(mime);
    }
    if let Some(obj) = message.metadata.as_object_mut() {
        obj.remove("media_pending");
    }
    deps.store.update_message(message).await?;
    deps.store.complete_inbound_media_job(&job.id).await?;
    Ok(())
}

/// §4.6 step 7's two-cascade download (direct, then broker-mediated) does
/// not apply here: by the time a job reaches C10, the synchronous direct
/// attempt has already failed, so the worker always goes through the
/// broker-mediated path.
async fn download(deps: &PipelineDeps, job: &MediaJob) -> anyhow::Result<DownloadedMedia> {
    deps.broker
        .download_via_broker(
            &job.tenant_id,
            job.broker_id.as_deref(),
            job.media_key.as_deref(),
            job.direct_path.as_deref(),
            DOWNLOAD_TIMEOUT,
        )
        .await
}

/// §4.10 step 4. Returns `true` if the job was dead-lettered.
async fn handle_failure(deps: &PipelineDeps, job: &MediaJob, error: &str) -> bool {
    let attempts = job.attempts + 1;
    if attempts >= MAX_ATTEMPTS {
        if let Err(err) = deps.store.fail_inbound_media_job(&job.id, error).await {
            warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %err, "failed to mark media job failed");
        }
        record_counter(
            "inbound_media_retry_dlq",
            1,
            &TelemetryLabels::new(job.tenant_id.clone()),
        );
        let record = DlqRecord::new(
            job.tenant_id.clone(),
            "media_retry_worker",
            job.message_external_id.clone().unwrap_or_else(|| job.id.clone()),
            attempts,
            DlqError {
                code: "E_MEDIA_DOWNLOAD".to_string(),
                message: error.to_string(),
                stage: None,
            },
            serde_json::json!({ "mediaJobId": job.id, "mediaKey": job.media_key, "directPath": job.direct_path }),
        );
        if let Err(err) = deps.dlq.publish(record).await {
            warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %err, "failed to publish media job to dlq");
        }
        true
    } else {
        let next_retry_at = now_plus_secs(backoff_secs(attempts));
        if let Err(err) = deps.store.reschedule_inbound_media_job(&job.id, next_retry_at, error).await {
            warn!(tenant_id = %job.tenant_id, job_id = %job.id, error = %err, "failed to reschedule media job");
        }
        false
    }
}

fn now_plus_secs(secs: u64) -> OffsetDateTime {
    OffsetDateTime::now_utc() + time::Duration::seconds(secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadengine_wa_core::{
        ContactAttrs, MediaJobState, MessageDirection, MessageStatus, MessageType, NewMessage, Queue, Ticket,
        TicketStatus,
    };
    use leadengine_wa_testkit::{BrokerOutcome, TestHarness};
    use std::sync::Arc;

    fn deps(h: &TestHarness) -> PipelineDeps {
        PipelineDeps {
            store: h.shared_store(),
            broker: h.shared_broker(),
            media_store: h.shared_media_store(),
            realtime: h.shared_realtime(),
            provisioner: h.shared_provisioner(),
            allocator: h.shared_allocator(),
            dlq: Arc::new(leadengine_wa_dlq::LoggingDlqSink),
        }
    }

    async fn seed_pending_job(h: &TestHarness) -> MediaJob {
        let queue = h
            .store
            .insert_queue(Queue {
                id: leadengine_wa_core::random_id("queue-"),
                tenant_id: "tenant-A".to_string(),
                is_default: true,
            })
            .await
            .unwrap();
        let contact = h
            .store
            .find_or_create_contact(
                "tenant-A",
                "inst-1:5511999999999@s.whatsapp.net",
                ContactAttrs {
                    display_name: None,
                    primary_phone: Some("5511999999999@s.whatsapp.net".to_string()),
                    document: None,
                },
            )
            .await
            .unwrap();
        let ticket = h
            .store
            .insert_ticket(Ticket {
                id: leadengine_wa_core::random_id("ticket-"),
                tenant_id: "tenant-A".to_string(),
                contact_id: contact.id,
                queue_id: queue.id,
                chat_id: "5511999999999@s.whatsapp.net".to_string(),
                status: TicketStatus::Open,
                agreement_id: None,
                metadata: serde_json::json!({}),
                updated_at: OffsetDateTime::now_utc(),
                last_message_at: None,
                last_message_preview: None,
            })
            .await
            .unwrap();
        let message = h
            .store
            .create_message(
                "tenant-A",
                &ticket.id,
                NewMessage {
                    direction: MessageDirection::Inbound,
                    kind: MessageType::Image,
                    content: None,
                    media_url: None,
                    mime_type: None,
                    file_size: None,
                    external_id: Some("wamid-media-1".to_string()),
                    instance_id: Some("inst-1".to_string()),
                    status: MessageStatus::Delivered,
                    metadata: serde_json::json!({ "media_pending": true }),
                },
            )
            .await
            .unwrap();

        let job = MediaJob {
            id: leadengine_wa_core::random_id("media-job-"),
            tenant_id: "tenant-A".to_string(),
            message_id: message.id.clone(),
            message_external_id: message.external_id.clone(),
            instance_id: Some("inst-1".to_string()),
            broker_id: Some("broker-1".to_string()),
            media_type: MessageType::Image,
            media_key: Some("key-1".to_string()),
            direct_path: Some("/direct/path".to_string()),
            metadata: serde_json::json!({}),
            attempts: 0,
            next_retry_at: OffsetDateTime::now_utc() - time::Duration::seconds(1),
            state: MediaJobState::Pending,
        };
        h.store.insert_media_job(job.clone()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn successful_download_completes_the_job_and_clears_media_pending() {
        let h = TestHarness::new();
        let job = seed_pending_job(&h).await;
        h.broker
            .queue_via_broker(BrokerOutcome::Success(DownloadedMedia {
                bytes: vec![0u8; 1024],
                mime_type: Some("image/jpeg".to_string()),
                file_name: Some("photo.jpg".to_string()),
            }))
            .await;

        let summary = drain_due(&deps(&h), DEFAULT_BATCH_SIZE, OffsetDateTime::now_utc()).await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.succeeded, 1);

        let message = h.store.get_message("tenant-A", &job.message_id).await.unwrap().unwrap();
        assert!(message.media_url.is_some());
        assert!(message.metadata.get("media_pending").is_none());
        assert_eq!(
            h.store.get_media_job("tenant-A", &job.id).await.unwrap().unwrap().state,
            MediaJobState::Done
        );
    }

    #[tokio::test]
    async fn failure_reschedules_with_backoff_until_fifth_attempt_dead_letters() {
        let h = TestHarness::new();
        let job = seed_pending_job(&h).await;

        for n in 1..=4u32 {
            h.broker.queue_via_broker(BrokerOutcome::Failure("timeout".to_string())).await;
            let summary = drain_due(&deps(&h), DEFAULT_BATCH_SIZE, OffsetDateTime::now_utc()).await;
            assert_eq!(summary.rescheduled, 1, "attempt {n} should reschedule");
            let stored = h.store.get_media_job("tenant-A", &job.id).await.unwrap().unwrap();
            assert_eq!(stored.attempts, n);
            assert_eq!(stored.state, MediaJobState::Pending);
            // force it due again for the next drain
            h.store
                .reschedule_inbound_media_job(&job.id, OffsetDateTime::now_utc() - time::Duration::seconds(1), "timeout")
                .await
                .unwrap();
        }

        h.broker.queue_via_broker(BrokerOutcome::Failure("timeout".to_string())).await;
        let summary = drain_due(&deps(&h), DEFAULT_BATCH_SIZE, OffsetDateTime::now_utc()).await;
        assert_eq!(summary.dead_lettered, 1);
        assert_eq!(
            h.store.get_media_job("tenant-A", &job.id).await.unwrap().unwrap().state,
            MediaJobState::Failed
        );
    }

    #[test]
    fn backoff_doubles_and_caps_at_thirty_minutes() {
        assert_eq!(backoff_secs(1), 60);
        assert_eq!(backoff_secs(2), 120);
        assert_eq!(backoff_secs(3), 240);
        assert_eq!(backoff_secs(5), 960);
        assert_eq!(backoff_secs(20), 30 * 60);
    }

    #[tokio::test]
    async fn lost_lease_is_skipped_not_double_processed() {
        let h = TestHarness::new();
        let job = seed_pending_job(&h).await;
        h.store.mark_inbound_media_job_processing(&job.id).await.unwrap();

        let summary = drain_due(&deps(&h), DEFAULT_BATCH_SIZE, OffsetDateTime::now_utc()).await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.leases_lost, 1);
        assert_eq!(summary.succeeded, 0);
    }
}
