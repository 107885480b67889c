//! Continuation of parked conversations: reply handling and timeouts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::flow::{match_choice, validate_response, ExecutionContext, Executor, ValidationFailure};
use crate::prompting::{render_validation_error, ValidationPromptContext, RETRIES_EXHAUSTED_NOTICE};
use crate::store::Store;
use crate::types::{
    ConversationSession, Flow, FlowNode, InboundMessage, ResponseType, SessionStatus,
};

/// What happened to a session after a reply or a timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Moved on and parked again on another response node.
    Waiting { node_id: String },
    /// Reply rejected; still waiting on the same node.
    Reprompted { failure: ValidationFailure, retry_count: u32 },
    /// Session ended with this status.
    Ended(SessionStatus),
}

pub struct SessionManager {
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, executor: Arc<Executor>) -> Self {
        Self { store, executor }
    }

    /// Handles a reply to a waiting session.
    pub async fn resume(
        &self,
        mut session: ConversationSession,
        message: &InboundMessage,
    ) -> EngineResult<SessionOutcome> {
        let now = Utc::now();
        session.last_activity_at = now;

        let Some(flow) = self.store.get_flow(&session.flow_id).await? else {
            warn!(session = %session.id, flow = %session.flow_id, "session flow no longer exists");
            return self.end(session, SessionStatus::Error, now).await;
        };
        let Some(node) = flow.node(&session.current_node_id) else {
            warn!(session = %session.id, flow = %flow.id, node = %session.current_node_id, "session node no longer exists");
            return self.end(session, SessionStatus::Error, now).await;
        };

        let expected = session.expected_response.clone().unwrap_or_default();
        let reply = message.body.trim().to_string();

        let next = match expected.response_type {
            ResponseType::Choice => match match_choice(&reply, &expected.choices) {
                Some(choice) => Ok(choice
                    .target_node_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .or_else(|| choice_edge_target(&flow, node, &choice.value))),
                None => Err(ValidationFailure::NotAChoice),
            },
            _ => validate_response(message, &expected).map(|()| first_edge_target(&flow, node)),
        };

        let next = match next {
            Ok(next) => next,
            Err(failure) => return self.reject(session, failure, now).await,
        };

        // Stored as received; matching above works on the trimmed text.
        session
            .variables
            .insert("lastResponse".to_string(), message.body.clone());
        if let Some(name) = expected
            .variable_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
        {
            session.variables.insert(name.to_string(), message.body.clone());
        }
        session.response_count += 1;
        session.retry_count = 0;
        session.is_waiting_for_response = false;
        session.expected_response = None;

        let Some(next) = next else {
            info!(session = %session.id, "reply accepted at end of flow");
            return self.end(session, SessionStatus::Completed, now).await;
        };
        session.current_node_id = next.clone();
        self.store.update_session(&session).await?;

        self.continue_run(&flow, &next, session, Some(message.clone()))
            .await
    }

    /// Routes an expired session into its timeout branch, or ends it with `timeout`.
    pub async fn expire(&self, mut session: ConversationSession) -> EngineResult<SessionOutcome> {
        let now = Utc::now();
        let timeout_node = session
            .expected_response
            .as_ref()
            .and_then(|expected| expected.timeout.as_ref())
            .and_then(|timeout| timeout.timeout_node_id.clone())
            .filter(|id| !id.trim().is_empty());

        let Some(timeout_node) = timeout_node else {
            info!(session = %session.id, contact = %session.contact_number, "session timed out");
            return self.end(session, SessionStatus::Timeout, now).await;
        };
        let flow = match self.store.get_flow(&session.flow_id).await? {
            Some(flow) if flow.node(&timeout_node).is_some() => flow,
            _ => {
                warn!(session = %session.id, node = %timeout_node, "timeout node missing; ending session");
                return self.end(session, SessionStatus::Timeout, now).await;
            }
        };

        info!(session = %session.id, node = %timeout_node, "session timed out; following timeout branch");
        session.is_waiting_for_response = false;
        session.expected_response = None;
        session.current_node_id = timeout_node.clone();
        session.last_activity_at = now;
        session.variables.insert("timedOut".to_string(), "true".to_string());
        self.store.update_session(&session).await?;

        self.continue_run(&flow, &timeout_node, session, None).await
    }

    async fn continue_run(
        &self,
        flow: &Flow,
        node_id: &str,
        session: ConversationSession,
        message: Option<InboundMessage>,
    ) -> EngineResult<SessionOutcome> {
        let mut ctx = ExecutionContext::resume(session, message);
        let result = self.executor.run_from(flow, node_id, &mut ctx).await;
        let now = Utc::now();

        let Some(mut session) = ctx.session.take() else {
            return result.map(|()| SessionOutcome::Ended(SessionStatus::Completed));
        };
        match result {
            Err(err) => {
                warn!(session = %session.id, error = %err, "flow run failed; ending session");
                session.variables = ctx.variables;
                session.terminate(SessionStatus::Error, now);
                self.store.update_session(&session).await?;
                Err(err)
            }
            Ok(()) if ctx.suspended => Ok(SessionOutcome::Waiting {
                node_id: session.current_node_id,
            }),
            Ok(()) => {
                session.variables = ctx.variables;
                self.end(session, SessionStatus::Completed, now).await
            }
        }
    }

    async fn reject(
        &self,
        mut session: ConversationSession,
        failure: ValidationFailure,
        now: DateTime<Utc>,
    ) -> EngineResult<SessionOutcome> {
        let expected = session.expected_response.clone().unwrap_or_default();
        session.retry_count += 1;
        let cutoff = expected
            .max_retries
            .or(self.executor.config().max_validation_retries);

        if cutoff.is_some_and(|limit| session.retry_count > limit) {
            info!(session = %session.id, retries = session.retry_count, "retry limit reached; abandoning session");
            if let Err(err) = self
                .executor
                .send_text(&session.key(), RETRIES_EXHAUSTED_NOTICE)
                .await
            {
                warn!(session = %session.id, error = %err, "failed to send closing notice");
            }
            return self.end(session, SessionStatus::Abandoned, now).await;
        }

        let text = render_validation_error(&ValidationPromptContext {
            failure: &failure,
            expected: &expected,
            retries_left: cutoff.map(|limit| limit + 1 - session.retry_count),
        });
        let sent = self.executor.send_text(&session.key(), &text).await;
        if let Err(err) = sent {
            warn!(session = %session.id, error = %err, "failed to send validation error");
            session.terminate(SessionStatus::Error, now);
            self.store.update_session(&session).await?;
            return Err(EngineError::Channel(err));
        }
        session.message_count += 1;
        self.store.update_session(&session).await?;
        Ok(SessionOutcome::Reprompted {
            failure,
            retry_count: session.retry_count,
        })
    }

    async fn end(
        &self,
        mut session: ConversationSession,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> EngineResult<SessionOutcome> {
        session.terminate(status, now);
        self.store.update_session(&session).await?;
        info!(session = %session.id, contact = %session.contact_number, status = status.as_str(), "session ended");
        Ok(SessionOutcome::Ended(status))
    }
}

fn first_edge_target(flow: &Flow, node: &FlowNode) -> Option<String> {
    flow.outgoing(&node.id).next().map(|edge| edge.target.clone())
}

/// Edge tagged with the choice value, else the first outgoing edge.
fn choice_edge_target(flow: &Flow, node: &FlowNode, value: &str) -> Option<String> {
    let wanted = value.trim().to_ascii_lowercase();
    flow.outgoing(&node.id)
        .find(|edge| edge.handle().as_deref() == Some(wanted.as_str()))
        .map(|edge| edge.target.clone())
        .or_else(|| first_edge_target(flow, node))
}
