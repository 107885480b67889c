use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::leads::LeadSource;
use crate::store::Store;
use crate::types::{FetchStatus, LeadFetchLog, LeadIntegration};

/// Lookback used when a tenant has never been fetched.
const FIRST_RUN_LOOKBACK_HOURS: i64 = 24;

/// `[last - overlap, now]`, or the last 24 hours on a first run.
pub fn fetch_window(
    last_fetch_time: Option<DateTime<Utc>>,
    overlap_minutes: u32,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = match last_fetch_time {
        Some(last) => last - ChronoDuration::minutes(overlap_minutes.into()),
        None => now - ChronoDuration::hours(FIRST_RUN_LOOKBACK_HOURS),
    };
    (start.min(now), now)
}

/// Removes the tenant from the in-flight set when the run ends.
struct InFlight {
    tenants: Arc<Mutex<HashSet<String>>>,
    tenant_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.tenants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.tenant_id);
    }
}

/// Periodic per-tenant lead ingestion with bounded fixed-interval retries.
pub struct LeadIngestor {
    store: Arc<dyn Store>,
    source: Arc<dyn LeadSource>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl LeadIngestor {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn LeadSource>,
        token: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            store,
            source,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            token,
            tracker,
        }
    }

    fn claim_tenant(&self, tenant_id: &str) -> Option<InFlight> {
        let mut tenants = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !tenants.insert(tenant_id.to_string()) {
            return None;
        }
        Some(InFlight {
            tenants: self.in_flight.clone(),
            tenant_id: tenant_id.to_string(),
        })
    }

    /// Starts a run for every enabled integration that is due and idle.
    /// Returns how many runs were started.
    pub async fn poll(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let integrations = match self.store.enabled_lead_integrations().await {
            Ok(integrations) => integrations,
            Err(err) => {
                error!(error = %err, "failed to load lead integrations");
                return 0;
            }
        };

        let mut started = 0;
        for integration in integrations {
            if !integration.is_due(now) {
                continue;
            }
            let Some(guard) = self.claim_tenant(&integration.tenant_id) else {
                continue;
            };
            if let Err(err) = self
                .store
                .set_last_attempt_time(&integration.tenant_id, now)
                .await
            {
                error!(tenant = %integration.tenant_id, error = %err, "failed to record lead fetch attempt; run skipped");
                continue;
            }
            let this = self.clone();
            self.tracker.spawn(async move {
                let _guard = guard;
                this.run_with_retries(integration, now).await;
            });
            started += 1;
        }
        started
    }

    /// One run plus up to `max_retries` retries, each logged separately.
    pub async fn run_with_retries(&self, integration: LeadIntegration, now: DateTime<Utc>) -> Vec<LeadFetchLog> {
        let (window_start, _) = fetch_window(integration.last_fetch_time, integration.overlap_minutes, now);
        let retry_every = Duration::from_secs(u64::from(integration.retry_interval_minutes) * 60);
        let mut logs: Vec<LeadFetchLog> = Vec::new();
        let mut window_end = now;

        for attempt in 0..=integration.max_retries {
            if attempt > 0 {
                tokio::select! {
                    _ = self.token.cancelled() => {
                        info!(tenant = %integration.tenant_id, "shutdown; pending lead retry dropped");
                        break;
                    }
                    _ = tokio::time::sleep(retry_every) => {}
                }
                window_end = Utc::now().max(window_end);
            }

            let parent = logs.first().map(|log| log.id.clone());
            let log = self
                .run_once(&integration, window_start, window_end, attempt, parent)
                .await;
            let succeeded = log.status == FetchStatus::Success;
            logs.push(log);
            if succeeded {
                break;
            }
            if attempt == integration.max_retries {
                error!(tenant = %integration.tenant_id, attempts = attempt + 1, "lead fetch failed; retries exhausted");
            }
        }
        logs
    }

    /// A single fetch over `[start, end]`, recorded in a fetch log.
    pub async fn run_once(
        &self,
        integration: &LeadIntegration,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        retry_count: u32,
        parent_log_id: Option<String>,
    ) -> LeadFetchLog {
        let tenant_id = integration.tenant_id.as_str();
        let mut log = LeadFetchLog {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            status: FetchStatus::Running,
            window_start: start,
            window_end: end,
            started_at: Utc::now(),
            finished_at: None,
            pulled: 0,
            processed: 0,
            skipped: 0,
            errors: 0,
            error_message: None,
            error_code: None,
            retry_count,
            parent_log_id,
        };
        if let Err(err) = self.store.insert_fetch_log(&log).await {
            error!(tenant = %tenant_id, error = %err, "failed to record lead fetch start");
        }

        let outcome = match self.source.fetch(integration, start, end).await {
            Ok(leads) => {
                log.pulled = u32::try_from(leads.len()).unwrap_or(u32::MAX);
                let mut store_failure: Option<StoreError> = None;
                for mut lead in leads {
                    if lead.unique_id.is_empty() {
                        log.errors += 1;
                        continue;
                    }
                    lead.tenant_id = tenant_id.to_string();
                    let inserted = match self.store.lead_exists(tenant_id, &lead.unique_id).await {
                        Ok(true) => Ok(false),
                        Ok(false) => self.store.insert_lead(&lead).await,
                        Err(err) => Err(err),
                    };
                    match inserted {
                        Ok(true) => log.processed += 1,
                        Ok(false) => log.skipped += 1,
                        Err(err) => {
                            log.errors += 1;
                            warn!(tenant = %tenant_id, lead = %lead.unique_id, error = %err, "failed to store lead");
                            store_failure.get_or_insert(err);
                        }
                    }
                }
                match store_failure {
                    None => Ok(()),
                    Some(err) => Err(("STORE_ERROR".to_string(), err.to_string())),
                }
            }
            Err(err) => Err((err.code, err.message)),
        };

        log.finished_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                log.status = FetchStatus::Success;
                if let Err(err) = self.store.set_last_fetch_time(tenant_id, end).await {
                    error!(tenant = %tenant_id, error = %err, "failed to advance lastFetchTime");
                }
                info!(
                    tenant = %tenant_id,
                    source = self.source.name(),
                    pulled = log.pulled,
                    processed = log.processed,
                    skipped = log.skipped,
                    errors = log.errors,
                    "lead fetch finished"
                );
            }
            Err((code, message)) => {
                log.status = FetchStatus::Failed;
                warn!(tenant = %tenant_id, code = %code, error = %message, retry = retry_count, "lead fetch failed");
                log.error_code = Some(code);
                log.error_message = Some(message);
            }
        }
        if let Err(err) = self.store.update_fetch_log(&log).await {
            error!(tenant = %tenant_id, error = %err, "failed to record lead fetch result");
        }
        log
    }
}
