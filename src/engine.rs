//! Entry point for inbound messages.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::channel::ChannelRegistry;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::flow::{match_trigger, ExecutionContext, Executor};
use crate::session::{SessionManager, SessionOutcome};
use crate::store::Store;
use crate::types::{contact_number, ContactKey, InboundMessage, InstanceKey, SessionStatus};

const SEEN_MESSAGE_CAPACITY: usize = 1024;

type LockMap = HashMap<ContactKey, Arc<AsyncMutex<()>>>;

/// One async mutex per (tenant, instance, contact). Idle entries are dropped
/// when their last guard goes away.
#[derive(Default)]
pub struct ContactLocks {
    locks: Arc<Mutex<LockMap>>,
}

pub struct ContactGuard {
    key: ContactKey,
    locks: Arc<Mutex<LockMap>>,
    _guard: OwnedMutexGuard<()>,
}

fn lock_map(locks: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ContactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &ContactKey) -> ContactGuard {
        let mutex = lock_map(&self.locks)
            .entry(key.clone())
            .or_default()
            .clone();
        let guard = mutex.lock_owned().await;
        ContactGuard {
            key: key.clone(),
            locks: self.locks.clone(),
            _guard: guard,
        }
    }

    /// Contacts that currently hold or wait for a lock.
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ContactGuard {
    fn drop(&mut self) {
        let mut locks = lock_map(&self.locks);
        // One reference lives in the map and one in this guard; any more are waiters.
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) <= 2)
        {
            locks.remove(&self.key);
        }
    }
}

/// Bounded memory of recently handled message ids.
struct SeenMessages {
    inner: Mutex<(VecDeque<String>, HashSet<String>)>,
    capacity: usize,
}

impl SeenMessages {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new((VecDeque::with_capacity(capacity), HashSet::with_capacity(capacity))),
            capacity,
        }
    }

    /// Records `id`; `false` when it was already recorded.
    fn first_sighting(&self, id: String) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (order, set) = &mut *guard;
        if !set.insert(id.clone()) {
            return false;
        }
        order.push_back(id);
        while order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                set.remove(&evicted);
            }
        }
        true
    }
}

struct Queued {
    message: InboundMessage,
    tenant_id: String,
    instance_id: String,
}

/// Pending inbound messages per contact. A contact has an entry exactly while
/// its drain task is running.
#[derive(Default)]
struct InboundQueues {
    pending: Mutex<HashMap<ContactKey, VecDeque<Queued>>>,
}

impl InboundQueues {
    fn lock(&self) -> MutexGuard<'_, HashMap<ContactKey, VecDeque<Queued>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `item`; `true` when the caller must start a drain task.
    fn push(&self, key: &ContactKey, item: Queued) -> bool {
        let mut pending = self.lock();
        match pending.get_mut(key) {
            Some(queue) => {
                queue.push_back(item);
                false
            }
            None => {
                pending.insert(key.clone(), VecDeque::from([item]));
                true
            }
        }
    }

    /// Next message for `key`, or `None` after retiring the contact's entry.
    fn pop(&self, key: &ContactKey) -> Option<Queued> {
        let mut pending = self.lock();
        let next = pending.get_mut(key).and_then(VecDeque::pop_front);
        if next.is_none() {
            pending.remove(key);
        }
        next
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    FromSelf,
    Empty,
    GroupChat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Ignored(IgnoreReason),
    Duplicate,
    /// A waiting session took the message.
    Resumed(SessionOutcome),
    /// `fired` flows ran; `suspended` when one of them parked on a response node.
    Triggered {
        fired: usize,
        failed: usize,
        suspended: bool,
    },
    NoMatch,
}

pub struct FlowEngine {
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    sessions: SessionManager,
    locks: ContactLocks,
    queues: InboundQueues,
    seen: SeenMessages,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        channels: Arc<ChannelRegistry>,
        http: reqwest::Client,
        config: EngineConfig,
    ) -> Self {
        let executor = Arc::new(Executor::new(
            store.clone(),
            channels,
            http,
            config.clone(),
        ));
        Self {
            sessions: SessionManager::new(store.clone(), executor.clone()),
            store,
            executor,
            locks: ContactLocks::new(),
            queues: InboundQueues::default(),
            seen: SeenMessages::new(SEEN_MESSAGE_CAPACITY),
            config,
        }
    }

    pub fn locks(&self) -> &ContactLocks {
        &self.locks
    }

    /// Fire-and-forget entry point; failures are logged, never returned.
    pub fn on_inbound_message(
        self: &Arc<Self>,
        message: InboundMessage,
        tenant_id: String,
        instance_id: String,
    ) {
        self.on_inbound_batch(vec![message], tenant_id, instance_id);
    }

    /// Like [`FlowEngine::on_inbound_message`], for one webhook delivery.
    ///
    /// Each message joins its contact's queue before this returns, so a
    /// contact's messages are handled one at a time in call order. Different
    /// contacts drain concurrently.
    pub fn on_inbound_batch(
        self: &Arc<Self>,
        messages: Vec<InboundMessage>,
        tenant_id: String,
        instance_id: String,
    ) {
        let instance = InstanceKey::new(&tenant_id, &instance_id);
        for message in messages {
            let key = instance.contact(contact_number(&message.from));
            let item = Queued {
                message,
                tenant_id: tenant_id.clone(),
                instance_id: instance_id.clone(),
            };
            if self.queues.push(&key, item) {
                let engine = self.clone();
                tokio::spawn(async move { engine.drain(key).await });
            }
        }
    }

    async fn drain(self: Arc<Self>, key: ContactKey) {
        while let Some(Queued {
            message,
            tenant_id,
            instance_id,
        }) = self.queues.pop(&key)
        {
            let message_id = message.id.clone();
            let handled = AssertUnwindSafe(self.handle_inbound(message, &tenant_id, &instance_id))
                .catch_unwind()
                .await;
            match handled {
                Ok(Ok(outcome)) => {
                    debug!(contact = %key, message = %message_id, ?outcome, "inbound handled")
                }
                Ok(Err(err)) => {
                    error!(contact = %key, message = %message_id, error = %err, "inbound handling failed")
                }
                Err(_) => {
                    error!(contact = %key, message = %message_id, "inbound handler panicked")
                }
            }
        }
    }

    /// Contacts with queued or in-progress inbound messages.
    pub fn pending_contacts(&self) -> usize {
        self.queues.len()
    }

    /// Handles one inbound message to completion (or to the next suspension point).
    pub async fn handle_inbound(
        &self,
        message: InboundMessage,
        tenant_id: &str,
        instance_id: &str,
    ) -> EngineResult<InboundOutcome> {
        if message.from_me {
            return Ok(InboundOutcome::Ignored(IgnoreReason::FromSelf));
        }
        if self.config.ignore_group_chats && message.is_group_chat() {
            return Ok(InboundOutcome::Ignored(IgnoreReason::GroupChat));
        }
        if message.body.trim().is_empty() && !message.has_media() {
            return Ok(InboundOutcome::Ignored(IgnoreReason::Empty));
        }
        if !message.id.is_empty()
            && !self
                .seen
                .first_sighting(format!("{tenant_id}/{instance_id}/{}", message.id))
        {
            debug!(tenant = %tenant_id, instance = %instance_id, message = %message.id, "duplicate delivery dropped");
            return Ok(InboundOutcome::Duplicate);
        }

        let instance = InstanceKey::new(tenant_id, instance_id);
        let key = instance.contact(contact_number(&message.from));
        let _guard = self.locks.lock(&key).await;

        if let Some(session) = self.store.find_active_session(&key).await? {
            if session.is_waiting_for_response {
                debug!(contact = %key, session = %session.id, "resuming waiting session");
                let outcome = self.sessions.resume(session, &message).await?;
                return Ok(InboundOutcome::Resumed(outcome));
            }
        }

        self.run_triggers(&instance, &key, &message).await
    }

    async fn run_triggers(
        &self,
        instance: &InstanceKey,
        key: &ContactKey,
        message: &InboundMessage,
    ) -> EngineResult<InboundOutcome> {
        let flows = self.store.active_flows(instance).await?;
        let mut fired = 0;
        let mut failed = 0;

        for flow in &flows {
            let Some(trigger) = match_trigger(flow, message) else {
                continue;
            };
            info!(contact = %key, flow = %flow.id, node = %trigger.id, "trigger matched");
            fired += 1;

            let mut ctx = ExecutionContext::new(key.clone(), message.contact_name(), Some(message.clone()));
            let result = self.executor.run_from(flow, &trigger.id, &mut ctx).await;

            if let Err(err) = result {
                failed += 1;
                warn!(contact = %key, flow = %flow.id, steps = ctx.steps(), error = %err, "flow run failed");
                if let Some(mut session) = ctx.session.take() {
                    session.terminate(SessionStatus::Error, Utc::now());
                    self.store.update_session(&session).await?;
                }
                continue;
            }
            if ctx.suspended {
                return Ok(InboundOutcome::Triggered {
                    fired,
                    failed,
                    suspended: true,
                });
            }
        }

        if fired == 0 {
            return Ok(InboundOutcome::NoMatch);
        }
        Ok(InboundOutcome::Triggered {
            fired,
            failed,
            suspended: false,
        })
    }

    /// Expires the contact's session if its reply timeout has elapsed by `now`.
    ///
    /// Runs under the contact lock and re-reads the session first, so a reply
    /// that raced the sweep wins.
    pub async fn expire_if_due(
        &self,
        key: &ContactKey,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<SessionOutcome>> {
        let _guard = self.locks.lock(key).await;
        let Some(session) = self.store.find_active_session(key).await? else {
            return Ok(None);
        };
        if !session.timed_out(now) {
            return Ok(None);
        }
        self.sessions.expire(session).await.map(Some)
    }
}
