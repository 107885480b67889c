//! Persistence seams consumed by the engine and the scheduler loops.
//!
//! Every mutation is a single-record update keyed by id or by the
//! (tenant, instance, contact) compound key; nothing here needs a
//! multi-record transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{
    ContactKey, ConversationSession, Flow, InstanceKey, Lead, LeadFetchLog, LeadIntegration,
    ScheduledMessage, WhatsAppInstance,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Active flows of an instance, oldest first.
    async fn active_flows(&self, key: &InstanceKey) -> Result<Vec<Flow>, StoreError>;

    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_active_session(
        &self,
        key: &ContactKey,
    ) -> Result<Option<ConversationSession>, StoreError>;

    /// Fails with `StoreError::ActiveSessionExists` when the contact already
    /// has an active session.
    async fn insert_session(&self, session: &ConversationSession) -> Result<(), StoreError>;

    async fn update_session(&self, session: &ConversationSession) -> Result<(), StoreError>;

    /// Active sessions waiting for a reply that declare a timeout.
    async fn waiting_sessions_with_timeout(&self) -> Result<Vec<ConversationSession>, StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_scheduled_message(&self, message: &ScheduledMessage) -> Result<(), StoreError>;

    async fn get_scheduled_message(&self, id: &str)
        -> Result<Option<ScheduledMessage>, StoreError>;

    /// Moves `sending` claims older than `claimed_before` to `failed`.
    async fn fail_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64, StoreError>;

    /// Atomically flips due `scheduled` messages to `sending` and returns them.
    async fn claim_due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>, StoreError>;

    async fn mark_message_sent(
        &self,
        id: &str,
        external_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_message_failed(
        &self,
        id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn enabled_lead_integrations(&self) -> Result<Vec<LeadIntegration>, StoreError>;

    async fn get_lead_integration(
        &self,
        tenant_id: &str,
    ) -> Result<Option<LeadIntegration>, StoreError>;

    async fn set_last_fetch_time(&self, tenant_id: &str, at: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn set_last_attempt_time(&self, tenant_id: &str, at: DateTime<Utc>)
        -> Result<(), StoreError>;

    async fn lead_exists(&self, tenant_id: &str, unique_id: &str) -> Result<bool, StoreError>;

    /// Returns `false` when a lead with the same unique id already exists.
    async fn insert_lead(&self, lead: &Lead) -> Result<bool, StoreError>;

    async fn insert_fetch_log(&self, log: &LeadFetchLog) -> Result<(), StoreError>;

    async fn update_fetch_log(&self, log: &LeadFetchLog) -> Result<(), StoreError>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn enabled_whatsapp_instances(&self) -> Result<Vec<WhatsAppInstance>, StoreError>;

    async fn find_whatsapp_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<WhatsAppInstance>, StoreError>;
}

/// Everything the process needs from its document store.
pub trait Store: FlowStore + SessionStore + MessageStore + LeadStore + InstanceStore {}

impl<T> Store for T where T: FlowStore + SessionStore + MessageStore + LeadStore + InstanceStore {}
