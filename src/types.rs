use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::FlowError;

// ── Keys ───────────────────────────────────────────────────────────────

/// One connected number of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceKey {
    pub tenant_id: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(tenant_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn contact(&self, contact: impl Into<String>) -> ContactKey {
        ContactKey {
            tenant_id: self.tenant_id.clone(),
            instance_id: self.instance_id.clone(),
            contact: contact.into(),
        }
    }
}

/// Partition key for conversation state: (tenant, instance, contact).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactKey {
    pub tenant_id: String,
    pub instance_id: String,
    pub contact: String,
}

impl ContactKey {
    pub fn instance(&self) -> InstanceKey {
        InstanceKey::new(&self.tenant_id, &self.instance_id)
    }
}

impl std::fmt::Display for ContactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.instance_id, self.contact)
    }
}

// ── Inbound messages ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// image | video | audio | document | sticker
    pub media_type: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    /// Chat id of the sender (phone number or `...@c.us` / `...@g.us`).
    pub from: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text(id: impl Into<String>, from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            body: body.into(),
            from_me: false,
            is_group: false,
            contact_name: None,
            attachment: None,
            timestamp: Utc::now(),
        }
    }

    pub fn has_media(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn is_group_chat(&self) -> bool {
        self.is_group || self.from.ends_with("@g.us")
    }

    /// Display name of the sender, falling back to the bare number.
    pub fn contact_name(&self) -> String {
        self.contact_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| contact_number(&self.from))
    }
}

/// Strips the WhatsApp chat suffix (`@c.us`, `@s.whatsapp.net`) from a chat id.
pub fn contact_number(chat_id: &str) -> String {
    chat_id
        .split('@')
        .next()
        .unwrap_or(chat_id)
        .trim()
        .to_string()
}

// ── Flow definitions ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Flow {
    /// Checks that every edge points at nodes that exist.
    pub fn validate(&self) -> Result<(), FlowError> {
        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if self.node(endpoint).is_none() {
                    return Err(FlowError::DanglingEdge {
                        edge_id: edge.id.clone(),
                        node_id: endpoint.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, node_id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a FlowEdge> + 'a {
        self.edges.iter().filter(move |edge| edge.source == node_id)
    }

    pub fn trigger_nodes(&self) -> impl Iterator<Item = (&FlowNode, &TriggerConfig)> {
        self.nodes.iter().filter_map(|node| match &node.kind {
            NodeKind::Trigger(config) => Some((node, config)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowPosition {
    pub x: f64,
    pub y: f64,
}

impl Default for FlowPosition {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
}

impl FlowEdge {
    /// Normalized branch label; `None` for untagged edges.
    pub fn handle(&self) -> Option<String> {
        self.source_handle
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty() && !h.eq_ignore_ascii_case("default"))
            .map(str::to_ascii_lowercase)
    }
}

/// Node as stored by the flow editor: `{id, type, position, data: {config}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNodeRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub position: FlowPosition,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "FlowNodeRecord", into = "FlowNodeRecord")]
pub struct FlowNode {
    pub id: String,
    pub position: FlowPosition,
    pub label: Option<String>,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Trigger(TriggerConfig),
    Action(ActionConfig),
    Condition(ConditionConfig),
    Delay(DelayConfig),
    Response(ResponseConfig),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Trigger(_) => "trigger",
            NodeKind::Action(_) => "action",
            NodeKind::Condition(_) => "condition",
            NodeKind::Delay(_) => "delay",
            NodeKind::Response(_) => "response",
        }
    }
}

impl TryFrom<FlowNodeRecord> for FlowNode {
    type Error = FlowError;

    fn try_from(record: FlowNodeRecord) -> Result<Self, Self::Error> {
        let config = record
            .data
            .get("config")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let invalid = |err: serde_json::Error| FlowError::InvalidNode {
            node_id: record.id.clone(),
            reason: err.to_string(),
        };
        let kind = match record.node_type.as_str() {
            "trigger" => NodeKind::Trigger(serde_json::from_value(config).map_err(invalid)?),
            "action" => NodeKind::Action(serde_json::from_value(config).map_err(invalid)?),
            "condition" => NodeKind::Condition(serde_json::from_value(config).map_err(invalid)?),
            "delay" => NodeKind::Delay(serde_json::from_value(config).map_err(invalid)?),
            "response" => NodeKind::Response(serde_json::from_value(config).map_err(invalid)?),
            other => {
                return Err(FlowError::InvalidNode {
                    node_id: record.id.clone(),
                    reason: format!("unknown node type '{other}'"),
                })
            }
        };
        let label = record
            .data
            .get("label")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(FlowNode {
            id: record.id,
            position: record.position,
            label,
            kind,
        })
    }
}

impl From<FlowNode> for FlowNodeRecord {
    fn from(node: FlowNode) -> Self {
        let config = match &node.kind {
            NodeKind::Trigger(c) => serde_json::to_value(c),
            NodeKind::Action(c) => serde_json::to_value(c),
            NodeKind::Condition(c) => serde_json::to_value(c),
            NodeKind::Delay(c) => serde_json::to_value(c),
            NodeKind::Response(c) => serde_json::to_value(c),
        }
        .unwrap_or_default();
        let mut data = serde_json::Map::new();
        data.insert("config".to_string(), config);
        if let Some(label) = node.label {
            data.insert("label".to_string(), Value::String(label));
        }
        FlowNodeRecord {
            id: node.id,
            node_type: node.kind.type_name().to_string(),
            position: node.position,
            data: Value::Object(data),
        }
    }
}

/// Accepts strings, numbers and booleans, yielding their text form.
fn de_stringish<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "triggerType", rename_all = "snake_case")]
pub enum TriggerConfig {
    #[serde(alias = "exact_match")]
    TextEquals { text: String },
    #[serde(alias = "text_contains")]
    Contains { text: String },
    StartsWith { text: String },
    EndsWith { text: String },
    TextRegex {
        pattern: String,
        #[serde(default)]
        flags: Option<String>,
    },
    AnyMessage {},
    MediaReceived {
        #[serde(default, rename = "mediaType")]
        media_type: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "actionType", rename_all = "snake_case")]
pub enum ActionConfig {
    SendMessage {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    SendImage {
        image_url: String,
        #[serde(default)]
        caption: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SendDocument {
        document_url: String,
        #[serde(default)]
        caption: Option<String>,
        #[serde(default)]
        filename: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SetVariable {
        variable_name: String,
        #[serde(default, deserialize_with = "de_stringish")]
        value: String,
    },
    #[serde(rename_all = "camelCase")]
    Webhook {
        webhook_url: String,
        #[serde(default = "default_webhook_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub variable: String,
    pub operator: ConditionOperator,
    #[serde(default, deserialize_with = "de_stringish")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Seconds.
    #[serde(default = "default_delay_secs", alias = "delay")]
    pub duration: f64,
}

fn default_delay_secs() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Any,
    Choice,
    Text,
    Number,
    Email,
    Phone,
    Media,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChoice {
    #[serde(deserialize_with = "de_stringish")]
    pub value: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub target_node_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseValidation {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTimeout {
    pub minutes: u32,
    #[serde(default)]
    pub timeout_node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseConfig {
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "expectedType")]
    pub response_type: ResponseType,
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub validation: ResponseValidation,
    #[serde(default)]
    pub timeout: Option<ResponseTimeout>,
    /// Also store the accepted reply under this variable.
    #[serde(default)]
    pub variable_name: Option<String>,
    /// Replaces the generated validation-error text.
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl ResponseConfig {
    pub fn expected_response(&self) -> ExpectedResponse {
        ExpectedResponse {
            response_type: self.response_type,
            choices: self.choices.clone(),
            validation: self.validation.clone(),
            timeout: self.timeout.clone(),
            variable_name: self.variable_name.clone(),
            error_message: self.error_message.clone(),
            max_retries: self.max_retries,
        }
    }
}

// ── Conversation sessions ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedResponse {
    #[serde(rename = "type", default)]
    pub response_type: ResponseType,
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub validation: ResponseValidation,
    #[serde(default)]
    pub timeout: Option<ResponseTimeout>,
    #[serde(default)]
    pub variable_name: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
    Error,
    Timeout,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
            SessionStatus::Error => "error",
            SessionStatus::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "abandoned" => Some(SessionStatus::Abandoned),
            "error" => Some(SessionStatus::Error),
            "timeout" => Some(SessionStatus::Timeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub contact_number: String,
    #[serde(default)]
    pub contact_name: String,
    pub flow_id: String,
    pub current_node_id: String,
    pub is_active: bool,
    pub is_waiting_for_response: bool,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub expected_response: Option<ExpectedResponse>,
    #[serde(default)]
    pub message_count: u32,
    #[serde(default)]
    pub response_count: u32,
    #[serde(default)]
    pub retry_count: u32,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConversationSession {
    pub fn new(key: &ContactKey, flow_id: &str, node_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: key.tenant_id.clone(),
            instance_id: key.instance_id.clone(),
            contact_number: key.contact.clone(),
            contact_name: String::new(),
            flow_id: flow_id.to_string(),
            current_node_id: node_id.to_string(),
            is_active: true,
            is_waiting_for_response: false,
            variables: HashMap::new(),
            expected_response: None,
            message_count: 0,
            response_count: 0,
            retry_count: 0,
            status: SessionStatus::Active,
            started_at: now,
            last_activity_at: now,
            completed_at: None,
        }
    }

    pub fn key(&self) -> ContactKey {
        ContactKey {
            tenant_id: self.tenant_id.clone(),
            instance_id: self.instance_id.clone(),
            contact: self.contact_number.clone(),
        }
    }

    pub fn terminate(&mut self, status: SessionStatus, now: DateTime<Utc>) {
        self.is_active = false;
        self.is_waiting_for_response = false;
        self.status = status;
        self.completed_at = Some(now);
        self.last_activity_at = now;
    }

    /// True when a declared reply timeout has elapsed since the last activity.
    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        if !(self.is_active && self.is_waiting_for_response) {
            return false;
        }
        self.expected_response
            .as_ref()
            .and_then(|expected| expected.timeout.as_ref())
            .map(|timeout| now - self.last_activity_at >= ChronoDuration::minutes(timeout.minutes.into()))
            .unwrap_or(false)
    }
}

// ── Outbound / deferred messages ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Document,
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Document => "document",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMedia {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Scheduled,
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(MessageStatus::Scheduled),
            "sending" => Some(MessageStatus::Sending),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessage {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub to: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub media: Option<OutboundMedia>,
    pub status: MessageStatus,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl ScheduledMessage {
    pub fn new(
        key: &InstanceKey,
        to: impl Into<String>,
        body: impl Into<String>,
        media: Option<OutboundMedia>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: key.tenant_id.clone(),
            instance_id: key.instance_id.clone(),
            to: to.into(),
            body: body.into(),
            media,
            status: MessageStatus::Scheduled,
            scheduled_at,
            claimed_at: None,
            sent_at: None,
            external_id: None,
            error: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    pub fn instance(&self) -> InstanceKey {
        InstanceKey::new(&self.tenant_id, &self.instance_id)
    }
}

// ── Lead ingestion ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadIntegration {
    pub tenant_id: String,
    pub api_key: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_minutes: u32,
    #[serde(default = "default_overlap")]
    pub overlap_minutes: u32,
    #[serde(default = "default_lead_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_minutes: u32,
    /// Window anchor; moves only when a run succeeds.
    #[serde(default)]
    pub last_fetch_time: Option<DateTime<Utc>>,
    /// When the last run started, successful or not.
    #[serde(default)]
    pub last_attempt_time: Option<DateTime<Utc>>,
}

fn default_fetch_interval() -> u32 {
    15
}

fn default_overlap() -> u32 {
    5
}

fn default_lead_retries() -> u32 {
    3
}

fn default_retry_interval() -> u32 {
    5
}

impl LeadIntegration {
    /// Due once `fetchIntervalMinutes` have passed since the latest run started,
    /// so a failing source is not hit on every poll.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempt_time.max(self.last_fetch_time) {
            None => true,
            Some(last) => now - last >= ChronoDuration::minutes(self.fetch_interval_minutes.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub tenant_id: String,
    pub source: String,
    pub unique_id: String,
    #[serde(default)]
    pub query_type: String,
    #[serde(default)]
    pub query_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub sender_mobile: String,
    #[serde(default)]
    pub sender_email: String,
    #[serde(default)]
    pub sender_company: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub raw: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Running,
    Success,
    Failed,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Running => "running",
            FetchStatus::Success => "success",
            FetchStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(FetchStatus::Running),
            "success" => Some(FetchStatus::Success),
            "failed" => Some(FetchStatus::Failed),
            _ => None,
        }
    }
}

/// One lead-fetch attempt, kept for operators to audit after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadFetchLog {
    pub id: String,
    pub tenant_id: String,
    pub status: FetchStatus,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pulled: u32,
    #[serde(default)]
    pub processed: u32,
    #[serde(default)]
    pub skipped: u32,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub parent_log_id: Option<String>,
}

// ── Instances ──────────────────────────────────────────────────────────

/// A WhatsApp Cloud API number bound to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppInstance {
    pub tenant_id: String,
    pub instance_id: String,
    pub phone_number_id: String,
    pub access_token: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub verify_token: String,
    #[serde(default)]
    pub enabled: bool,
}

impl WhatsAppInstance {
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.tenant_id, &self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_typed_nodes_from_editor_shape() {
        let node: FlowNode = serde_json::from_value(json!({
            "id": "n1",
            "type": "action",
            "position": { "x": 10.0, "y": 20.0 },
            "data": { "label": "Greet", "config": { "actionType": "send_message", "message": "Hello!" } }
        }))
        .unwrap();
        assert_eq!(node.label.as_deref(), Some("Greet"));
        match node.kind {
            NodeKind::Action(ActionConfig::SendMessage { message }) => assert_eq!(message, "Hello!"),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn rejects_node_with_missing_config_field() {
        let err = serde_json::from_value::<FlowNode>(json!({
            "id": "t1",
            "type": "trigger",
            "data": { "config": { "triggerType": "text_equals" } }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("t1"));
    }

    #[test]
    fn rejects_unknown_node_type() {
        let err = serde_json::from_value::<FlowNode>(json!({
            "id": "x", "type": "teleport", "data": {}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unknown node type"));
    }

    #[test]
    fn condition_value_accepts_numbers() {
        let node: FlowNode = serde_json::from_value(json!({
            "id": "c1",
            "type": "condition",
            "data": { "config": { "variable": "age", "operator": "greater_than", "value": 18 } }
        }))
        .unwrap();
        match node.kind {
            NodeKind::Condition(config) => assert_eq!(config.value, "18"),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn flow_validation_catches_dangling_edges() {
        let flow: Flow = serde_json::from_value(json!({
            "id": "f", "tenantId": "t", "instanceId": "i", "name": "f", "isActive": true,
            "nodes": [{ "id": "a", "type": "delay", "data": { "config": {} } }],
            "edges": [{ "id": "e1", "source": "a", "target": "b" }]
        }))
        .unwrap();
        assert!(matches!(flow.validate(), Err(FlowError::DanglingEdge { .. })));
    }

    #[test]
    fn session_timeout_respects_minutes() {
        let key = ContactKey {
            tenant_id: "t".into(),
            instance_id: "i".into(),
            contact: "555".into(),
        };
        let start = Utc::now();
        let mut session = ConversationSession::new(&key, "f", "r", start);
        session.is_waiting_for_response = true;
        session.expected_response = Some(ExpectedResponse {
            timeout: Some(ResponseTimeout {
                minutes: 10,
                timeout_node_id: None,
            }),
            ..Default::default()
        });
        assert!(!session.timed_out(start + ChronoDuration::minutes(9)));
        assert!(session.timed_out(start + ChronoDuration::minutes(10)));
    }

    #[test]
    fn contact_name_falls_back_to_number() {
        let msg = InboundMessage::text("m1", "5511999@c.us", "hi");
        assert_eq!(msg.contact_name(), "5511999");
        assert!(!msg.is_group_chat());
        assert!(InboundMessage::text("m2", "123-456@g.us", "hi").is_group_chat());
    }
}
