use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::future::BoxFuture;
use serde_json::json;
use tracing::{debug, info, warn};

use super::interpolate;
use crate::channel::{ChannelRegistry, MessageHandle};
use crate::config::EngineConfig;
use crate::error::{ChannelError, EngineResult, FlowError, StoreError};
use crate::store::Store;
use crate::types::{
    ActionConfig, ConditionConfig, ConditionOperator, ContactKey, ConversationSession, Flow,
    FlowEdge, FlowNode, InboundMessage, MediaKind, NodeKind, OutboundMedia, ResponseConfig,
};

/// State carried through one walk of a flow graph.
#[derive(Debug)]
pub struct ExecutionContext {
    pub key: ContactKey,
    pub contact_name: String,
    pub message: Option<InboundMessage>,
    pub variables: HashMap<String, String>,
    /// Session being resumed, or the one created when a response node is reached.
    pub session: Option<ConversationSession>,
    /// Set once a response node has parked the conversation.
    pub suspended: bool,
    steps: usize,
}

impl ExecutionContext {
    /// Context for a fresh run, seeded with contact and message variables.
    pub fn new(key: ContactKey, contact_name: impl Into<String>, message: Option<InboundMessage>) -> Self {
        let mut ctx = Self {
            key,
            contact_name: contact_name.into(),
            message,
            variables: HashMap::new(),
            session: None,
            suspended: false,
            steps: 0,
        };
        ctx.seed_variables();
        ctx
    }

    /// Context that continues `session`, starting from its stored variables.
    pub fn resume(session: ConversationSession, message: Option<InboundMessage>) -> Self {
        let mut ctx = Self {
            key: session.key(),
            contact_name: session.contact_name.clone(),
            message,
            variables: session.variables.clone(),
            session: Some(session),
            suspended: false,
            steps: 0,
        };
        ctx.seed_variables();
        ctx
    }

    fn seed_variables(&mut self) {
        let name = if self.contact_name.trim().is_empty() {
            self.key.contact.clone()
        } else {
            self.contact_name.clone()
        };
        self.variables.insert("contact.name".to_string(), name);
        self.variables
            .insert("contact.number".to_string(), self.key.contact.clone());
        if let Some(message) = &self.message {
            self.variables
                .insert("message".to_string(), message.body.trim().to_string());
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }
}

/// Evaluates a condition node against the current variables.
///
/// Missing variables compare as empty strings. Ordering operators need both sides numeric.
pub fn evaluate_condition(config: &ConditionConfig, variables: &HashMap<String, String>) -> bool {
    let left = variables
        .get(config.variable.trim())
        .map(String::as_str)
        .unwrap_or("");
    let right = config.value.as_str();
    let numeric = || {
        let l = left.trim().parse::<f64>().ok()?;
        let r = right.trim().parse::<f64>().ok()?;
        Some((l, r))
    };
    match config.operator {
        ConditionOperator::Equals => left == right,
        ConditionOperator::NotEquals => left != right,
        ConditionOperator::Contains => left.contains(right),
        ConditionOperator::GreaterThan => numeric().is_some_and(|(l, r)| l > r),
        ConditionOperator::LessThan => numeric().is_some_and(|(l, r)| l < r),
    }
}

/// Edges to follow out of a condition node. Edges tagged with the result win;
/// untagged edges are used only when no tagged edge matches.
pub fn condition_edges<'a>(flow: &'a Flow, node_id: &'a str, result: bool) -> Vec<&'a FlowEdge> {
    let wanted = if result { "true" } else { "false" };
    let tagged = flow
        .outgoing(node_id)
        .filter(|edge| edge.handle().as_deref() == Some(wanted))
        .collect::<Vec<_>>();
    if !tagged.is_empty() {
        return tagged;
    }
    flow.outgoing(node_id)
        .filter(|edge| edge.handle().is_none())
        .collect()
}

/// Longest pause a delay node may hold a run for.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

fn delay_duration(seconds: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
}

/// Walks flow graphs node by node, depth first, in edge declaration order.
pub struct Executor {
    store: Arc<dyn Store>,
    channels: Arc<ChannelRegistry>,
    http: reqwest::Client,
    config: EngineConfig,
}

impl Executor {
    pub fn new(
        store: Arc<dyn Store>,
        channels: Arc<ChannelRegistry>,
        http: reqwest::Client,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            channels,
            http,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `flow` starting at `node_id`.
    pub async fn run_from(
        &self,
        flow: &Flow,
        node_id: &str,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<()> {
        let node = flow.node(node_id).ok_or_else(|| FlowError::MissingNode {
            flow_id: flow.id.clone(),
            node_id: node_id.to_string(),
        })?;
        self.execute_node(flow, node, ctx).await
    }

    pub async fn send_text(&self, key: &ContactKey, text: &str) -> Result<MessageHandle, ChannelError> {
        self.channels
            .send_message(&key.instance(), &key.contact, text)
            .await
    }

    pub fn execute_node<'a>(
        &'a self,
        flow: &'a Flow,
        node: &'a FlowNode,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            ctx.steps += 1;
            if ctx.steps > self.config.max_steps {
                return Err(FlowError::StepBudgetExceeded {
                    flow_id: flow.id.clone(),
                    limit: self.config.max_steps,
                }
                .into());
            }
            debug!(flow = %flow.id, node = %node.id, kind = node.kind.type_name(), contact = %ctx.key.contact, "executing node");

            let next: Vec<&FlowEdge> = match &node.kind {
                NodeKind::Trigger(_) => flow.outgoing(&node.id).collect(),
                NodeKind::Action(action) => {
                    self.run_action(action, ctx).await?;
                    flow.outgoing(&node.id).collect()
                }
                NodeKind::Condition(condition) => {
                    let result = evaluate_condition(condition, &ctx.variables);
                    debug!(flow = %flow.id, node = %node.id, result, "condition evaluated");
                    condition_edges(flow, &node.id, result)
                }
                NodeKind::Delay(delay) => {
                    let pause = delay_duration(delay.duration);
                    if pause == MAX_DELAY {
                        warn!(flow = %flow.id, node = %node.id, seconds = delay.duration, "delay capped at one day");
                    }
                    tokio::time::sleep(pause).await;
                    flow.outgoing(&node.id).collect()
                }
                NodeKind::Response(response) => {
                    self.park_on_response(flow, node, response, ctx).await?;
                    Vec::new()
                }
            };

            for edge in next {
                let Some(target) = flow.node(&edge.target) else {
                    warn!(flow = %flow.id, edge = %edge.id, target = %edge.target, "edge target missing; skipping");
                    continue;
                };
                self.execute_node(flow, target, ctx).await?;
            }
            Ok(())
        })
    }

    async fn run_action(&self, action: &ActionConfig, ctx: &mut ExecutionContext) -> EngineResult<()> {
        match action {
            ActionConfig::SendMessage { message } => {
                let text = interpolate(message, &ctx.variables);
                if text.trim().is_empty() {
                    warn!(contact = %ctx.key, "send_message produced empty text; skipping");
                    return Ok(());
                }
                self.send_text(&ctx.key, &text).await?;
                self.count_sent(ctx);
            }
            ActionConfig::SendImage { image_url, caption } => {
                self.send_media(ctx, MediaKind::Image, image_url, None, caption.as_deref())
                    .await?;
            }
            ActionConfig::SendDocument {
                document_url,
                caption,
                filename,
            } => {
                self.send_media(
                    ctx,
                    MediaKind::Document,
                    document_url,
                    filename.as_deref(),
                    caption.as_deref(),
                )
                .await?;
            }
            ActionConfig::SetVariable {
                variable_name,
                value,
            } => {
                let name = variable_name.trim();
                if name.is_empty() {
                    warn!(contact = %ctx.key, "set_variable without a name; skipping");
                } else {
                    let value = interpolate(value, &ctx.variables);
                    ctx.variables.insert(name.to_string(), value);
                }
            }
            ActionConfig::Webhook {
                webhook_url,
                method,
                headers,
            } => {
                self.call_webhook(ctx, webhook_url, method, headers).await;
            }
        }
        Ok(())
    }

    async fn send_media(
        &self,
        ctx: &mut ExecutionContext,
        kind: MediaKind,
        url: &str,
        filename: Option<&str>,
        caption: Option<&str>,
    ) -> EngineResult<()> {
        let media = OutboundMedia {
            kind,
            url: interpolate(url, &ctx.variables),
            filename: filename.map(|f| interpolate(f, &ctx.variables)),
            mime_type: None,
        };
        let caption = caption
            .map(|c| interpolate(c, &ctx.variables))
            .filter(|c| !c.trim().is_empty());
        self.channels
            .send_media(&ctx.key.instance(), &ctx.key.contact, &media, caption.as_deref())
            .await?;
        self.count_sent(ctx);
        Ok(())
    }

    fn count_sent(&self, ctx: &mut ExecutionContext) {
        if let Some(session) = ctx.session.as_mut() {
            session.message_count += 1;
        }
    }

    /// Failures are logged and never abort the run.
    async fn call_webhook(
        &self,
        ctx: &ExecutionContext,
        url: &str,
        method: &str,
        headers: &HashMap<String, String>,
    ) {
        let url = interpolate(url, &ctx.variables);
        let method = reqwest::Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .unwrap_or(reqwest::Method::POST);
        let payload = json!({
            "message": ctx.message.as_ref().map(|m| m.body.as_str()).unwrap_or(""),
            "from": ctx.key.contact,
            "variables": ctx.variables,
            "timestamp": Utc::now().to_rfc3339(),
        });

        let mut request = self
            .http
            .request(method.clone(), &url)
            .timeout(self.config.webhook_timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), interpolate(value, &ctx.variables));
        }
        if method != reqwest::Method::GET {
            request = request.json(&payload);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, status = response.status().as_u16(), "webhook delivered");
            }
            Ok(response) => {
                warn!(url = %url, status = response.status().as_u16(), contact = %ctx.key, "webhook returned error status");
            }
            Err(err) => {
                warn!(url = %url, error = %err, contact = %ctx.key, "webhook request failed");
            }
        }
    }

    /// Sends the prompt and parks the conversation on `node`.
    async fn park_on_response(
        &self,
        flow: &Flow,
        node: &FlowNode,
        response: &ResponseConfig,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<()> {
        let prompt = interpolate(&response.message, &ctx.variables);
        if !prompt.trim().is_empty() {
            self.send_text(&ctx.key, &prompt).await?;
        }

        let now = Utc::now();
        let (mut session, is_new) = match ctx.session.take() {
            Some(session) => (session, false),
            None => match self.store.find_active_session(&ctx.key).await? {
                Some(existing) => (existing, false),
                None => (ConversationSession::new(&ctx.key, &flow.id, &node.id, now), true),
            },
        };

        session.flow_id = flow.id.clone();
        session.current_node_id = node.id.clone();
        session.is_waiting_for_response = true;
        session.expected_response = Some(response.expected_response());
        session.retry_count = 0;
        session.variables = ctx.variables.clone();
        session.last_activity_at = now;
        if !prompt.trim().is_empty() {
            session.message_count += 1;
        }
        if session.contact_name.trim().is_empty() {
            session.contact_name = ctx.contact_name.clone();
        }

        if is_new {
            match self.store.insert_session(&session).await {
                Ok(()) => {
                    info!(contact = %ctx.key, flow = %flow.id, node = %node.id, session = %session.id, "session started");
                }
                Err(StoreError::ActiveSessionExists { .. }) => {
                    // Another writer created the session first: adopt it.
                    let mut existing = self
                        .store
                        .find_active_session(&ctx.key)
                        .await?
                        .ok_or_else(|| StoreError::not_found("session", ctx.key.to_string()))?;
                    existing.flow_id = session.flow_id.clone();
                    existing.current_node_id = session.current_node_id.clone();
                    existing.is_waiting_for_response = true;
                    existing.expected_response = session.expected_response.clone();
                    existing.retry_count = 0;
                    existing.variables = session.variables.clone();
                    existing.last_activity_at = now;
                    self.store.update_session(&existing).await?;
                    session = existing;
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            self.store.update_session(&session).await?;
            debug!(contact = %ctx.key, node = %node.id, session = %session.id, "session waiting for reply");
        }

        ctx.session = Some(session);
        ctx.suspended = true;
        Ok(())
    }
}
