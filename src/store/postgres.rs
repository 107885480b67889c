use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::warn;

use super::{FlowStore, InstanceStore, LeadStore, MessageStore, SessionStore};
use crate::error::StoreError;
use crate::types::{
    ContactKey, ConversationSession, ExpectedResponse, Flow, FlowEdge, FlowNode,
    InstanceKey, Lead, LeadFetchLog, LeadIntegration, MessageStatus, OutboundMedia,
    ScheduledMessage, SessionStatus, WhatsAppInstance,
};

/// Postgres-backed store. JSON payloads are kept as TEXT columns.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn json_text<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

fn count(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn uncount(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn flow_from_row(row: &PgRow) -> Result<Flow, StoreError> {
    let nodes: String = row.try_get("nodes")?;
    let edges: String = row.try_get("edges")?;
    let flow = Flow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        instance_id: row.try_get("instance_id")?,
        name: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
        nodes: serde_json::from_str::<Vec<FlowNode>>(&nodes)?,
        edges: serde_json::from_str::<Vec<FlowEdge>>(&edges)?,
        created_at: row.try_get("created_at")?,
    };
    flow.validate()
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok(flow)
}

fn session_from_row(row: &PgRow) -> Result<ConversationSession, StoreError> {
    let variables: String = row.try_get("variables")?;
    let expected: Option<String> = row.try_get("expected_response")?;
    let status: String = row.try_get("status")?;
    Ok(ConversationSession {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        instance_id: row.try_get("instance_id")?,
        contact_number: row.try_get("contact_number")?,
        contact_name: row.try_get("contact_name")?,
        flow_id: row.try_get("flow_id")?,
        current_node_id: row.try_get("current_node_id")?,
        is_active: row.try_get("is_active")?,
        is_waiting_for_response: row.try_get("is_waiting_for_response")?,
        variables: serde_json::from_str::<HashMap<String, String>>(&variables)?,
        expected_response: expected
            .as_deref()
            .map(serde_json::from_str::<ExpectedResponse>)
            .transpose()?,
        message_count: uncount(row.try_get("message_count")?),
        response_count: uncount(row.try_get("response_count")?),
        retry_count: uncount(row.try_get("retry_count")?),
        status: SessionStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown session status '{status}'")))?,
        started_at: row.try_get("started_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<ScheduledMessage, StoreError> {
    let media: Option<String> = row.try_get("media")?;
    let status: String = row.try_get("status")?;
    Ok(ScheduledMessage {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        instance_id: row.try_get("instance_id")?,
        to: row.try_get("recipient")?,
        body: row.try_get("body")?,
        media: media
            .as_deref()
            .map(serde_json::from_str::<OutboundMedia>)
            .transpose()?,
        status: MessageStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown message status '{status}'")))?,
        scheduled_at: row.try_get("scheduled_at")?,
        claimed_at: row.try_get("claimed_at")?,
        sent_at: row.try_get("sent_at")?,
        external_id: row.try_get("external_id")?,
        error: row.try_get("error")?,
        attempts: uncount(row.try_get("attempts")?),
        created_at: row.try_get("created_at")?,
    })
}

fn integration_from_row(row: &PgRow) -> Result<LeadIntegration, StoreError> {
    Ok(LeadIntegration {
        tenant_id: row.try_get("tenant_id")?,
        api_key: row.try_get("api_key")?,
        enabled: row.try_get("enabled")?,
        fetch_interval_minutes: uncount(row.try_get("fetch_interval_minutes")?),
        overlap_minutes: uncount(row.try_get("overlap_minutes")?),
        max_retries: uncount(row.try_get("max_retries")?),
        retry_interval_minutes: uncount(row.try_get("retry_interval_minutes")?),
        last_fetch_time: row.try_get("last_fetch_time")?,
        last_attempt_time: row.try_get("last_attempt_time")?,
    })
}

fn instance_from_row(row: &PgRow) -> Result<WhatsAppInstance, StoreError> {
    Ok(WhatsAppInstance {
        tenant_id: row.try_get("tenant_id")?,
        instance_id: row.try_get("instance_id")?,
        phone_number_id: row.try_get("phone_number_id")?,
        access_token: row.try_get("access_token")?,
        app_secret: row.try_get("app_secret")?,
        verify_token: row.try_get("verify_token")?,
        enabled: row.try_get("enabled")?,
    })
}

const SESSION_COLUMNS: &str = "id, tenant_id, instance_id, contact_number, contact_name, flow_id, \
     current_node_id, is_active, is_waiting_for_response, variables, expected_response, \
     message_count, response_count, retry_count, status, started_at, last_activity_at, completed_at";

const MESSAGE_COLUMNS: &str = "id, tenant_id, instance_id, recipient, body, media, status, \
     scheduled_at, claimed_at, sent_at, external_id, error, attempts, created_at";

#[async_trait]
impl FlowStore for PgStore {
    async fn active_flows(&self, key: &InstanceKey) -> Result<Vec<Flow>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, instance_id, name, is_active, nodes, edges, created_at \
             FROM flows WHERE tenant_id = $1 AND instance_id = $2 AND is_active = true \
             ORDER BY created_at ASC",
        )
        .bind(&key.tenant_id)
        .bind(&key.instance_id)
        .fetch_all(&self.pool)
        .await?;

        let mut flows = Vec::with_capacity(rows.len());
        for row in &rows {
            match flow_from_row(row) {
                Ok(flow) => flows.push(flow),
                Err(err) => {
                    let id = row.try_get::<String, _>("id").unwrap_or_default();
                    warn!(flow = %id, error = %err, "skipping flow with invalid definition");
                }
            }
        }
        Ok(flows)
    }

    async fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, instance_id, name, is_active, nodes, edges, created_at \
             FROM flows WHERE id = $1",
        )
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(flow_from_row).transpose()
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn find_active_session(
        &self,
        key: &ContactKey,
    ) -> Result<Option<ConversationSession>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM conversation_sessions \
             WHERE tenant_id = $1 AND instance_id = $2 AND contact_number = $3 AND is_active = true \
             LIMIT 1"
        ))
        .bind(&key.tenant_id)
        .bind(&key.instance_id)
        .bind(&key.contact)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn insert_session(&self, session: &ConversationSession) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO conversation_sessions ({SESSION_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)"
        ))
        .bind(&session.id)
        .bind(&session.tenant_id)
        .bind(&session.instance_id)
        .bind(&session.contact_number)
        .bind(&session.contact_name)
        .bind(&session.flow_id)
        .bind(&session.current_node_id)
        .bind(session.is_active)
        .bind(session.is_waiting_for_response)
        .bind(json_text(&session.variables)?)
        .bind(session.expected_response.as_ref().map(json_text).transpose()?)
        .bind(count(session.message_count))
        .bind(count(session.response_count))
        .bind(count(session.retry_count))
        .bind(session.status.as_str())
        .bind(session.started_at)
        .bind(session.last_activity_at)
        .bind(session.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::ActiveSessionExists {
                    tenant_id: session.tenant_id.clone(),
                    instance_id: session.instance_id.clone(),
                    contact: session.contact_number.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_session(&self, session: &ConversationSession) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE conversation_sessions SET \
                contact_name = $2, flow_id = $3, current_node_id = $4, is_active = $5, \
                is_waiting_for_response = $6, variables = $7, expected_response = $8, \
                message_count = $9, response_count = $10, retry_count = $11, status = $12, \
                last_activity_at = $13, completed_at = $14 \
             WHERE id = $1",
        )
        .bind(&session.id)
        .bind(&session.contact_name)
        .bind(&session.flow_id)
        .bind(&session.current_node_id)
        .bind(session.is_active)
        .bind(session.is_waiting_for_response)
        .bind(json_text(&session.variables)?)
        .bind(session.expected_response.as_ref().map(json_text).transpose()?)
        .bind(count(session.message_count))
        .bind(count(session.response_count))
        .bind(count(session.retry_count))
        .bind(session.status.as_str())
        .bind(session.last_activity_at)
        .bind(session.completed_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("session", &session.id));
        }
        Ok(())
    }

    async fn waiting_sessions_with_timeout(&self) -> Result<Vec<ConversationSession>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM conversation_sessions \
             WHERE is_active = true AND is_waiting_for_response = true \
               AND expected_response IS NOT NULL \
               AND (expected_response::jsonb -> 'timeout') IS NOT NULL \
               AND jsonb_typeof(expected_response::jsonb -> 'timeout') = 'object'"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn insert_scheduled_message(&self, message: &ScheduledMessage) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO scheduled_messages ({MESSAGE_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)"
        ))
        .bind(&message.id)
        .bind(&message.tenant_id)
        .bind(&message.instance_id)
        .bind(&message.to)
        .bind(&message.body)
        .bind(message.media.as_ref().map(json_text).transpose()?)
        .bind(message.status.as_str())
        .bind(message.scheduled_at)
        .bind(message.claimed_at)
        .bind(message.sent_at)
        .bind(&message.external_id)
        .bind(&message.error)
        .bind(count(message.attempts))
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_scheduled_message(
        &self,
        id: &str,
    ) -> Result<Option<ScheduledMessage>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM scheduled_messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn fail_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        reason: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_messages SET status = 'failed', error = $2 \
             WHERE status = 'sending' AND claimed_at < $1",
        )
        .bind(claimed_before)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "UPDATE scheduled_messages \
             SET status = 'sending', claimed_at = $1, attempts = attempts + 1 \
             WHERE id IN ( \
                 SELECT id FROM scheduled_messages \
                 WHERE status = 'scheduled' AND scheduled_at <= $1 \
                 ORDER BY scheduled_at ASC LIMIT $2 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        let mut claimed = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        Ok(claimed)
    }

    async fn mark_message_sent(
        &self,
        id: &str,
        external_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE scheduled_messages SET status = 'sent', external_id = $2, sent_at = $3, error = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(external_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_message_failed(
        &self,
        id: &str,
        error: &str,
        _at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduled_messages SET status = 'failed', error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn enabled_lead_integrations(&self) -> Result<Vec<LeadIntegration>, StoreError> {
        let rows = sqlx::query(
            "SELECT tenant_id, api_key, enabled, fetch_interval_minutes, overlap_minutes, \
                    max_retries, retry_interval_minutes, last_fetch_time, last_attempt_time \
             FROM lead_integrations WHERE enabled = true",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(integration_from_row).collect()
    }

    async fn get_lead_integration(
        &self,
        tenant_id: &str,
    ) -> Result<Option<LeadIntegration>, StoreError> {
        let row = sqlx::query(
            "SELECT tenant_id, api_key, enabled, fetch_interval_minutes, overlap_minutes, \
                    max_retries, retry_interval_minutes, last_fetch_time, last_attempt_time \
             FROM lead_integrations WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(integration_from_row).transpose()
    }

    async fn set_last_fetch_time(
        &self,
        tenant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE lead_integrations SET last_fetch_time = $2 WHERE tenant_id = $1")
            .bind(tenant_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_last_attempt_time(
        &self,
        tenant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE lead_integrations SET last_attempt_time = $2 WHERE tenant_id = $1")
            .bind(tenant_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn lead_exists(&self, tenant_id: &str, unique_id: &str) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM leads WHERE tenant_id = $1 AND unique_id = $2",
        )
        .bind(tenant_id)
        .bind(unique_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found > 0)
    }

    async fn insert_lead(&self, lead: &Lead) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO leads \
             (id, tenant_id, source, unique_id, query_type, query_time, sender_name, sender_mobile, \
              sender_email, sender_company, city, state, subject, product_name, message, raw, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17) \
             ON CONFLICT (tenant_id, unique_id) DO NOTHING",
        )
        .bind(&lead.id)
        .bind(&lead.tenant_id)
        .bind(&lead.source)
        .bind(&lead.unique_id)
        .bind(&lead.query_type)
        .bind(lead.query_time)
        .bind(&lead.sender_name)
        .bind(&lead.sender_mobile)
        .bind(&lead.sender_email)
        .bind(&lead.sender_company)
        .bind(&lead.city)
        .bind(&lead.state)
        .bind(&lead.subject)
        .bind(&lead.product_name)
        .bind(&lead.message)
        .bind(json_text(&lead.raw)?)
        .bind(lead.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_fetch_log(&self, log: &LeadFetchLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO lead_fetch_logs \
             (id, tenant_id, status, window_start, window_end, started_at, finished_at, pulled, \
              processed, skipped, errors, error_message, error_code, retry_count, parent_log_id) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(&log.id)
        .bind(&log.tenant_id)
        .bind(log.status.as_str())
        .bind(log.window_start)
        .bind(log.window_end)
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(count(log.pulled))
        .bind(count(log.processed))
        .bind(count(log.skipped))
        .bind(count(log.errors))
        .bind(&log.error_message)
        .bind(&log.error_code)
        .bind(count(log.retry_count))
        .bind(&log.parent_log_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_fetch_log(&self, log: &LeadFetchLog) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE lead_fetch_logs SET status = $2, finished_at = $3, pulled = $4, processed = $5, \
                 skipped = $6, errors = $7, error_message = $8, error_code = $9 \
             WHERE id = $1",
        )
        .bind(&log.id)
        .bind(log.status.as_str())
        .bind(log.finished_at)
        .bind(count(log.pulled))
        .bind(count(log.processed))
        .bind(count(log.skipped))
        .bind(count(log.errors))
        .bind(&log.error_message)
        .bind(&log.error_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn enabled_whatsapp_instances(&self) -> Result<Vec<WhatsAppInstance>, StoreError> {
        let rows = sqlx::query(
            "SELECT tenant_id, instance_id, phone_number_id, access_token, app_secret, verify_token, enabled \
             FROM whatsapp_instances WHERE enabled = true",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn find_whatsapp_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<WhatsAppInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT tenant_id, instance_id, phone_number_id, access_token, app_secret, verify_token, enabled \
             FROM whatsapp_instances WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(instance_from_row).transpose()
    }
}
