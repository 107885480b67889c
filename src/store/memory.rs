use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{FlowStore, InstanceStore, LeadStore, MessageStore, SessionStore};
use crate::error::StoreError;
use crate::types::{
    ContactKey, ConversationSession, Flow, InstanceKey, Lead, LeadFetchLog, LeadIntegration,
    MessageStatus, ScheduledMessage, WhatsAppInstance,
};

/// Process-local store. Used by tests and when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    flows: RwLock<Vec<Flow>>,
    sessions: RwLock<HashMap<String, ConversationSession>>,
    messages: RwLock<HashMap<String, ScheduledMessage>>,
    integrations: RwLock<HashMap<String, LeadIntegration>>,
    leads: RwLock<Vec<Lead>>,
    fetch_logs: RwLock<Vec<LeadFetchLog>>,
    instances: RwLock<Vec<WhatsAppInstance>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_flow(&self, flow: Flow) -> Result<(), StoreError> {
        flow.validate()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut flows = self.flows.write().await;
        flows.retain(|f| f.id != flow.id);
        flows.push(flow);
        Ok(())
    }

    pub async fn upsert_lead_integration(&self, integration: LeadIntegration) {
        self.integrations
            .write()
            .await
            .insert(integration.tenant_id.clone(), integration);
    }

    pub async fn insert_whatsapp_instance(&self, instance: WhatsAppInstance) {
        let mut instances = self.instances.write().await;
        instances.retain(|i| i.instance_id != instance.instance_id);
        instances.push(instance);
    }

    pub async fn sessions_for(&self, key: &ContactKey) -> Vec<ConversationSession> {
        let mut list = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| &s.key() == key)
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    pub async fn leads(&self, tenant_id: &str) -> Vec<Lead> {
        self.leads
            .read()
            .await
            .iter()
            .filter(|l| l.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn fetch_logs(&self, tenant_id: &str) -> Vec<LeadFetchLog> {
        self.fetch_logs
            .read()
            .await
            .iter()
            .filter(|l| l.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn active_flows(&self, key: &InstanceKey) -> Result<Vec<Flow>, StoreError> {
        let mut list = self
            .flows
            .read()
            .await
            .iter()
            .filter(|f| f.is_active && f.tenant_id == key.tenant_id && f.instance_id == key.instance_id)
            .cloned()
            .collect::<Vec<_>>();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, StoreError> {
        Ok(self
            .flows
            .read()
            .await
            .iter()
            .find(|f| f.id == flow_id)
            .cloned())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn find_active_session(
        &self,
        key: &ContactKey,
    ) -> Result<Option<ConversationSession>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.is_active && &s.key() == key)
            .cloned())
    }

    async fn insert_session(&self, session: &ConversationSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let key = session.key();
        if session.is_active && sessions.values().any(|s| s.is_active && s.key() == key) {
            return Err(StoreError::ActiveSessionExists {
                tenant_id: key.tenant_id,
                instance_id: key.instance_id,
                contact: key.contact,
            });
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &ConversationSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let Some(existing) = sessions.get_mut(&session.id) else {
            return Err(StoreError::not_found("session", &session.id));
        };
        *existing = session.clone();
        Ok(())
    }

    async fn waiting_sessions_with_timeout(&self) -> Result<Vec<ConversationSession>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| {
                s.is_active
                    && s.is_waiting_for_response
                    && s.expected_response
                        .as_ref()
                        .is_some_and(|e| e.timeout.is_some())
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_scheduled_message(&self, message: &ScheduledMessage) -> Result<(), StoreError> {
        self.messages
            .write()
            .await
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_scheduled_message(
        &self,
        id: &str,
    ) -> Result<Option<ScheduledMessage>, StoreError> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn fail_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64, StoreError> {
        let mut count = 0;
        for message in self.messages.write().await.values_mut() {
            let stale = message.status == MessageStatus::Sending
                && message.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                message.status = MessageStatus::Failed;
                message.error = Some(reason.to_string());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn claim_due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>, StoreError> {
        let mut messages = self.messages.write().await;
        let mut due = messages
            .values_mut()
            .filter(|m| m.status == MessageStatus::Scheduled && m.scheduled_at <= now)
            .collect::<Vec<_>>();
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|message| {
                message.status = MessageStatus::Sending;
                message.claimed_at = Some(now);
                message.attempts += 1;
                message.clone()
            })
            .collect())
    }

    async fn mark_message_sent(
        &self,
        id: &str,
        external_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("scheduled message", id))?;
        message.status = MessageStatus::Sent;
        message.external_id = Some(external_id.to_string());
        message.sent_at = Some(at);
        message.error = None;
        Ok(())
    }

    async fn mark_message_failed(
        &self,
        id: &str,
        error: &str,
        _at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut messages = self.messages.write().await;
        let message = messages
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("scheduled message", id))?;
        message.status = MessageStatus::Failed;
        message.error = Some(error.to_string());
        Ok(())
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn enabled_lead_integrations(&self) -> Result<Vec<LeadIntegration>, StoreError> {
        Ok(self
            .integrations
            .read()
            .await
            .values()
            .filter(|i| i.enabled)
            .cloned()
            .collect())
    }

    async fn get_lead_integration(
        &self,
        tenant_id: &str,
    ) -> Result<Option<LeadIntegration>, StoreError> {
        Ok(self.integrations.read().await.get(tenant_id).cloned())
    }

    async fn set_last_fetch_time(
        &self,
        tenant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut integrations = self.integrations.write().await;
        let integration = integrations
            .get_mut(tenant_id)
            .ok_or_else(|| StoreError::not_found("lead integration", tenant_id))?;
        integration.last_fetch_time = Some(at);
        Ok(())
    }

    async fn set_last_attempt_time(
        &self,
        tenant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut integrations = self.integrations.write().await;
        let integration = integrations
            .get_mut(tenant_id)
            .ok_or_else(|| StoreError::not_found("lead integration", tenant_id))?;
        integration.last_attempt_time = Some(at);
        Ok(())
    }

    async fn lead_exists(&self, tenant_id: &str, unique_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .leads
            .read()
            .await
            .iter()
            .any(|l| l.tenant_id == tenant_id && l.unique_id == unique_id))
    }

    async fn insert_lead(&self, lead: &Lead) -> Result<bool, StoreError> {
        let mut leads = self.leads.write().await;
        if leads
            .iter()
            .any(|l| l.tenant_id == lead.tenant_id && l.unique_id == lead.unique_id)
        {
            return Ok(false);
        }
        leads.push(lead.clone());
        Ok(true)
    }

    async fn insert_fetch_log(&self, log: &LeadFetchLog) -> Result<(), StoreError> {
        self.fetch_logs.write().await.push(log.clone());
        Ok(())
    }

    async fn update_fetch_log(&self, log: &LeadFetchLog) -> Result<(), StoreError> {
        let mut logs = self.fetch_logs.write().await;
        let existing = logs
            .iter_mut()
            .find(|l| l.id == log.id)
            .ok_or_else(|| StoreError::not_found("lead fetch log", &log.id))?;
        *existing = log.clone();
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn enabled_whatsapp_instances(&self) -> Result<Vec<WhatsAppInstance>, StoreError> {
        Ok(self
            .instances
            .read()
            .await
            .iter()
            .filter(|i| i.enabled)
            .cloned()
            .collect())
    }

    async fn find_whatsapp_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<WhatsAppInstance>, StoreError> {
        Ok(self
            .instances
            .read()
            .await
            .iter()
            .find(|i| i.instance_id == instance_id)
            .cloned())
    }
}
