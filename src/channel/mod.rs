//! Outbound messaging seam and the per-instance connection registry.

pub mod whatsapp;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::ChannelError;
use crate::types::{InstanceKey, OutboundMedia};

pub use whatsapp::WhatsAppCloudChannel;

/// Provider id of a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageHandle {
    pub id: String,
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<MessageHandle, ChannelError>;

    async fn send_media(
        &self,
        chat_id: &str,
        media: &OutboundMedia,
        caption: Option<&str>,
    ) -> Result<MessageHandle, ChannelError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Initializing,
    QrPending { qr: String },
    Ready,
    Disconnected { reason: String },
}

impl ConnectionState {
    fn describe(&self) -> String {
        match self {
            ConnectionState::Initializing => "initializing".to_string(),
            ConnectionState::QrPending { .. } => "waiting for QR pairing".to_string(),
            ConnectionState::Ready => "ready".to_string(),
            ConnectionState::Disconnected { reason } => format!("disconnected: {reason}"),
        }
    }
}

struct ChannelEntry {
    channel: Arc<dyn Channel>,
    state: ConnectionState,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub tenant_id: String,
    pub instance_id: String,
    #[serde(flatten)]
    pub state: ConnectionState,
    pub updated_at: DateTime<Utc>,
}

/// Live channels keyed by (tenant, instance). Owned by the process root.
#[derive(Default)]
pub struct ChannelRegistry {
    entries: RwLock<HashMap<InstanceKey, ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the channel for `key`.
    pub async fn register(&self, key: InstanceKey, channel: Arc<dyn Channel>, state: ConnectionState) {
        info!(tenant = %key.tenant_id, instance = %key.instance_id, state = %state.describe(), "channel registered");
        self.entries.write().await.insert(
            key,
            ChannelEntry {
                channel,
                state,
                updated_at: Utc::now(),
            },
        );
    }

    /// Returns `false` when no channel is registered for `key`.
    pub async fn set_state(&self, key: &InstanceKey, state: ConnectionState) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if entry.state != state {
            info!(tenant = %key.tenant_id, instance = %key.instance_id, state = %state.describe(), "channel state changed");
        }
        entry.state = state;
        entry.updated_at = Utc::now();
        true
    }

    pub async fn state(&self, key: &InstanceKey) -> Option<ConnectionState> {
        self.entries.read().await.get(key).map(|entry| entry.state.clone())
    }

    /// The channel for `key`, only while it is ready to send.
    pub async fn ready_channel(&self, key: &InstanceKey) -> Result<Arc<dyn Channel>, ChannelError> {
        let entries = self.entries.read().await;
        let unavailable = |reason: String| ChannelError::Unavailable {
            tenant_id: key.tenant_id.clone(),
            instance_id: key.instance_id.clone(),
            reason,
        };
        let entry = entries
            .get(key)
            .ok_or_else(|| unavailable("not registered".to_string()))?;
        match entry.state {
            ConnectionState::Ready => Ok(entry.channel.clone()),
            ref other => Err(unavailable(other.describe())),
        }
    }

    /// Sends `text` through the ready channel for `key`.
    pub async fn send_message(
        &self,
        key: &InstanceKey,
        chat_id: &str,
        text: &str,
    ) -> Result<MessageHandle, ChannelError> {
        let channel = self.ready_channel(key).await?;
        let sent = channel.send_message(chat_id, text).await;
        self.observe(key, sent).await
    }

    /// Sends `media` through the ready channel for `key`.
    pub async fn send_media(
        &self,
        key: &InstanceKey,
        chat_id: &str,
        media: &OutboundMedia,
        caption: Option<&str>,
    ) -> Result<MessageHandle, ChannelError> {
        let channel = self.ready_channel(key).await?;
        let sent = channel.send_media(chat_id, media, caption).await;
        self.observe(key, sent).await
    }

    /// Marks the instance disconnected when the provider rejects its credentials.
    async fn observe(
        &self,
        key: &InstanceKey,
        sent: Result<MessageHandle, ChannelError>,
    ) -> Result<MessageHandle, ChannelError> {
        if let Err(err) = &sent {
            if err.is_auth_failure() {
                warn!(tenant = %key.tenant_id, instance = %key.instance_id, error = %err, "credentials rejected; channel disconnected");
                self.set_state(
                    key,
                    ConnectionState::Disconnected {
                        reason: err.to_string(),
                    },
                )
                .await;
            }
        }
        sent
    }

    pub async fn remove(&self, key: &InstanceKey) -> bool {
        let removed = self.entries.write().await.remove(key).is_some();
        if removed {
            info!(tenant = %key.tenant_id, instance = %key.instance_id, "channel removed");
        }
        removed
    }

    pub async fn snapshot(&self) -> Vec<ChannelStatus> {
        let mut statuses = self
            .entries
            .read()
            .await
            .iter()
            .map(|(key, entry)| ChannelStatus {
                tenant_id: key.tenant_id.clone(),
                instance_id: key.instance_id.clone(),
                state: entry.state.clone(),
                updated_at: entry.updated_at,
            })
            .collect::<Vec<_>>();
        statuses.sort_by(|a, b| {
            (a.tenant_id.as_str(), a.instance_id.as_str())
                .cmp(&(b.tenant_id.as_str(), b.instance_id.as_str()))
        });
        statuses
    }
}
