//! Time-driven loops: deferred messages, lead polling and the session timeout sweep.

pub mod leads;
pub mod messages;
pub mod sessions;

use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

use crate::config::SchedulerConfig;
use crate::engine::FlowEngine;
use crate::store::Store;

pub use leads::{fetch_window, LeadIngestor};
pub use messages::{DeliveryReport, MessageScheduler};
pub use sessions::sweep_timeouts;

/// Owns the background loops and everything they spawn.
pub struct Scheduler {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    pub fn start(
        &self,
        config: &SchedulerConfig,
        store: Arc<dyn Store>,
        engine: Arc<FlowEngine>,
        messages: Arc<MessageScheduler>,
        leads: Arc<LeadIngestor>,
    ) {
        let token = self.token.clone();
        let wake = messages.clone();
        self.tracker.spawn(every(
            "messages",
            config.message_poll_interval,
            token.clone(),
            Some(wake),
            move || {
                let messages = messages.clone();
                async move {
                    messages.run_pass().await;
                }
            },
        ));

        self.tracker.spawn(every(
            "leads",
            config.lead_poll_interval,
            token.clone(),
            None,
            move || {
                let leads = leads.clone();
                async move {
                    leads.poll(chrono::Utc::now()).await;
                }
            },
        ));

        self.tracker.spawn(every(
            "session-sweep",
            config.session_sweep_interval,
            token,
            None,
            move || {
                let store = store.clone();
                let engine = engine.clone();
                async move {
                    sweep_timeouts(store.as_ref(), &engine, chrono::Utc::now()).await;
                }
            },
        ));
        info!("scheduler loops started");
    }

    /// Cancels the loops and pending timers, then waits for in-flight work to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("scheduler stopped");
    }
}

/// Runs `tick` on a fixed interval (first tick immediately) until cancelled.
/// A tick that has started always runs to completion.
async fn every<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    wake: Option<Arc<MessageScheduler>>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
            _ = async {
                match &wake {
                    Some(messages) => messages.woken().await,
                    None => std::future::pending().await,
                }
            } => {}
        }
        tick().await;
    }
    info!(name, "scheduler loop stopped");
}
