#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use waflow::channel::{Channel, ChannelRegistry, ConnectionState, MessageHandle};
use waflow::config::EngineConfig;
use waflow::engine::{FlowEngine, InboundOutcome};
use waflow::error::ChannelError;
use waflow::store::{MemoryStore, Store};
use waflow::types::{Flow, InboundMessage, InstanceKey, OutboundMedia};

pub const TENANT: &str = "tenant-1";
pub const INSTANCE: &str = "inst-1";
pub const CONTACT: &str = "5511999990000";

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text { to: String, body: String },
    Media { to: String, url: String, caption: Option<String> },
}

impl Sent {
    pub fn body(&self) -> &str {
        match self {
            Sent::Text { body, .. } => body,
            Sent::Media { caption, .. } => caption.as_deref().unwrap_or(""),
        }
    }
}

/// Channel that records every send and can be switched to fail.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<Sent>>,
    failing: AtomicBool,
    counter: AtomicUsize,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|s| s.body().to_string())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, sent: Sent) -> Result<MessageHandle, ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::Rejected {
                status: 500,
                body: "boom".to_string(),
            });
        }
        self.sent.lock().unwrap().push(sent);
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(MessageHandle {
            id: format!("wamid.{n}"),
        })
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<MessageHandle, ChannelError> {
        self.record(Sent::Text {
            to: chat_id.to_string(),
            body: text.to_string(),
        })
    }

    async fn send_media(
        &self,
        chat_id: &str,
        media: &OutboundMedia,
        caption: Option<&str>,
    ) -> Result<MessageHandle, ChannelError> {
        self.record(Sent::Media {
            to: chat_id.to_string(),
            url: media.url.clone(),
            caption: caption.map(str::to_string),
        })
    }
}

pub fn instance() -> InstanceKey {
    InstanceKey::new(TENANT, INSTANCE)
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub channels: Arc<ChannelRegistry>,
    pub channel: Arc<RecordingChannel>,
    pub engine: Arc<FlowEngine>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let channels = Arc::new(ChannelRegistry::new());
        let channel = Arc::new(RecordingChannel::default());
        channels
            .register(instance(), channel.clone(), ConnectionState::Ready)
            .await;
        let engine = Arc::new(FlowEngine::new(
            store.clone() as Arc<dyn Store>,
            channels.clone(),
            reqwest::Client::new(),
            config,
        ));
        Self {
            store,
            channels,
            channel,
            engine,
        }
    }

    pub async fn add_flow(&self, flow: Flow) {
        self.store.insert_flow(flow).await.unwrap();
    }

    pub async fn send(&self, id: &str, body: &str) -> InboundOutcome {
        self.engine
            .handle_inbound(InboundMessage::text(id, CONTACT, body), TENANT, INSTANCE)
            .await
            .unwrap()
    }

    pub async fn session(&self) -> Option<waflow::types::ConversationSession> {
        use waflow::store::SessionStore;
        self.store
            .find_active_session(&instance().contact(CONTACT))
            .await
            .unwrap()
    }
}

pub fn node(id: &str, kind: &str, config: Value) -> Value {
    json!({
        "id": id,
        "type": kind,
        "position": { "x": 0, "y": 0 },
        "data": { "config": config }
    })
}

pub fn edge(source: &str, target: &str) -> Value {
    json!({ "id": format!("{source}-{target}"), "source": source, "target": target })
}

pub fn tagged_edge(source: &str, target: &str, handle: &str) -> Value {
    json!({
        "id": format!("{source}-{handle}-{target}"),
        "source": source,
        "target": target,
        "sourceHandle": handle
    })
}

pub fn flow(id: &str, nodes: Vec<Value>, edges: Vec<Value>) -> Flow {
    serde_json::from_value(json!({
        "id": id,
        "tenantId": TENANT,
        "instanceId": INSTANCE,
        "name": id,
        "isActive": true,
        "nodes": nodes,
        "edges": edges
    }))
    .unwrap()
}

pub fn send_message(id: &str, text: &str) -> Value {
    node(id, "action", json!({ "actionType": "send_message", "message": text }))
}

pub fn trigger(id: &str, config: Value) -> Value {
    node(id, "trigger", config)
}
