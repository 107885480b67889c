use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Notify;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelRegistry, MessageHandle};
use crate::config::SchedulerConfig;
use crate::error::{ChannelError, EngineError, EngineResult};
use crate::store::Store;
use crate::types::{InstanceKey, OutboundMedia, ScheduledMessage};

const INTERRUPTED: &str = "interrupted before delivery was confirmed";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// `sending` claims that outlived the processing window.
    pub interrupted: u64,
    pub sent: usize,
    pub failed: usize,
}

/// Durable deferred-message delivery.
///
/// Records live in the store; wake-up timers only shorten the wait for
/// messages due soon and are never the source of truth.
pub struct MessageScheduler {
    store: Arc<dyn Store>,
    channels: Arc<ChannelRegistry>,
    config: SchedulerConfig,
    wake: Notify,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl MessageScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        channels: Arc<ChannelRegistry>,
        config: SchedulerConfig,
        token: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            store,
            channels,
            config,
            wake: Notify::new(),
            token,
            tracker,
        }
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await
    }

    /// Persists a message for delivery at `at`.
    pub async fn schedule(
        self: &Arc<Self>,
        key: &InstanceKey,
        to: &str,
        body: &str,
        media: Option<OutboundMedia>,
        at: DateTime<Utc>,
    ) -> EngineResult<ScheduledMessage> {
        if to.trim().is_empty() {
            return Err(EngineError::Config("recipient is required".to_string()));
        }
        if body.trim().is_empty() && media.is_none() {
            return Err(EngineError::Config(
                "a scheduled message needs a body or media".to_string(),
            ));
        }

        let message = ScheduledMessage::new(key, to.trim(), body, media, at);
        self.store.insert_scheduled_message(&message).await?;
        info!(message = %message.id, tenant = %key.tenant_id, instance = %key.instance_id, at = %at, "message scheduled");

        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        if delay <= self.config.message_near_future {
            self.arm_wakeup(delay);
        }
        Ok(message)
    }

    fn arm_wakeup(self: &Arc<Self>, delay: std::time::Duration) {
        let token = self.token.clone();
        let this = self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => this.wake.notify_one(),
            }
        });
    }

    /// One scheduler pass; failures are logged.
    pub async fn run_pass(&self) -> DeliveryReport {
        match self.process_due(Utc::now()).await {
            Ok(report) => {
                if report != DeliveryReport::default() {
                    info!(sent = report.sent, failed = report.failed, interrupted = report.interrupted, "deferred messages processed");
                }
                report
            }
            Err(err) => {
                error!(error = %err, "deferred message pass failed");
                DeliveryReport::default()
            }
        }
    }

    /// Fails stale claims, then claims and delivers everything due by `now`.
    pub async fn process_due(&self, now: DateTime<Utc>) -> EngineResult<DeliveryReport> {
        let window = ChronoDuration::from_std(self.config.message_processing_window)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        let mut report = DeliveryReport {
            interrupted: self.store.fail_stale_claims(now - window, INTERRUPTED).await?,
            ..Default::default()
        };
        if report.interrupted > 0 {
            warn!(count = report.interrupted, "failed interrupted deliveries");
        }

        let batch_size = self.config.message_batch_size.max(1);
        loop {
            let claimed = self.store.claim_due_messages(now, batch_size).await?;
            let full_batch = claimed.len() == batch_size;
            for message in claimed {
                match self.deliver(&message).await {
                    Ok(handle) => {
                        debug!(message = %message.id, external = %handle.id, "deferred message sent");
                        report.sent += 1;
                        if let Err(err) = self
                            .store
                            .mark_message_sent(&message.id, &handle.id, Utc::now())
                            .await
                        {
                            error!(message = %message.id, external = %handle.id, error = %err, "failed to record sent message");
                        }
                    }
                    Err(err) => {
                        warn!(message = %message.id, error = %err, "deferred message failed");
                        report.failed += 1;
                        if let Err(store_err) = self
                            .store
                            .mark_message_failed(&message.id, &err.to_string(), Utc::now())
                            .await
                        {
                            error!(message = %message.id, error = %store_err, "failed to record message failure");
                        }
                    }
                }
            }
            if !full_batch || self.token.is_cancelled() {
                break;
            }
        }
        Ok(report)
    }

    async fn deliver(&self, message: &ScheduledMessage) -> Result<MessageHandle, ChannelError> {
        let instance = message.instance();
        match &message.media {
            Some(media) => {
                let caption = Some(message.body.as_str()).filter(|b| !b.trim().is_empty());
                self.channels
                    .send_media(&instance, &message.to, media, caption)
                    .await
            }
            None => {
                self.channels
                    .send_message(&instance, &message.to, &message.body)
                    .await
            }
        }
    }
}
