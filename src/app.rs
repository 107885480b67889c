use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::channel::{whatsapp, ChannelRegistry, ConnectionState, WhatsAppCloudChannel};
use crate::config::Config;
use crate::engine::FlowEngine;
use crate::error::{EngineError, StoreError};
use crate::leads::IndiaMartClient;
use crate::scheduler::{LeadIngestor, MessageScheduler, Scheduler};
use crate::store::{MemoryStore, PgStore, Store};
use crate::types::{OutboundMedia, WhatsAppInstance};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub channels: Arc<ChannelRegistry>,
    pub engine: Arc<FlowEngine>,
    pub messages: Arc<MessageScheduler>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn find_instance(
    state: &AppState,
    instance_id: &str,
) -> Result<WhatsAppInstance, axum::response::Response> {
    match state.store.find_whatsapp_instance(instance_id).await {
        Ok(Some(instance)) if instance.enabled => Ok(instance),
        Ok(_) => Err(error_response(StatusCode::NOT_FOUND, "instance not found")),
        Err(err) => {
            error!(instance = %instance_id, error = %err, "instance lookup failed");
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "instance lookup failed"))
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn whatsapp_webhook_verify(
    Path(instance_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let instance = match find_instance(&state, &instance_id).await {
        Ok(instance) => instance,
        Err(response) => return response,
    };

    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == "subscribe"
        && !challenge.is_empty()
        && !instance.verify_token.is_empty()
        && verify_token == instance.verify_token
    {
        return (StatusCode::OK, challenge).into_response();
    }

    error_response(StatusCode::FORBIDDEN, "invalid webhook verification token")
}

async fn whatsapp_webhook_event(
    Path(instance_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let instance = match find_instance(&state, &instance_id).await {
        Ok(instance) => instance,
        Err(response) => return response,
    };

    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if let Err(reason) = whatsapp::verify_signature(&instance.app_secret, signature_header, &body) {
        warn!(instance = %instance_id, %reason, "rejected webhook delivery");
        return error_response(StatusCode::UNAUTHORIZED, "invalid webhook signature");
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let messages = whatsapp::parse_webhook_payload(&payload, &instance.phone_number_id);
    let received = messages.len();
    if received > 0 {
        state
            .engine
            .on_inbound_batch(messages, instance.tenant_id.clone(), instance.instance_id.clone());
    }

    (StatusCode::OK, Json(json!({ "received": true, "messages": received }))).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleMessageBody {
    to: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    media: Option<OutboundMedia>,
    scheduled_at: DateTime<Utc>,
}

async fn schedule_message(
    Path(instance_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScheduleMessageBody>,
) -> impl IntoResponse {
    let instance = match find_instance(&state, &instance_id).await {
        Ok(instance) => instance,
        Err(response) => return response,
    };

    match state
        .messages
        .schedule(&instance.key(), &body.to, &body.body, body.media, body.scheduled_at)
        .await
    {
        Ok(message) => (StatusCode::CREATED, Json(json!(message))).into_response(),
        Err(EngineError::Config(reason)) => error_response(StatusCode::BAD_REQUEST, reason),
        Err(err) => {
            error!(instance = %instance_id, error = %err, "failed to schedule message");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to schedule message")
        }
    }
}

async fn list_channels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "channels": state.channels.snapshot().await }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/instances/{instance_id}/whatsapp/webhook",
            get(whatsapp_webhook_verify).post(whatsapp_webhook_event),
        )
        .route(
            "/api/instances/{instance_id}/messages/scheduled",
            post(schedule_message),
        )
        .route("/api/channels", get(list_channels))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn open_store(config: &Config) -> Result<Arc<dyn Store>, StoreError> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("no DATABASE_URL or POSTGRES_HOST set; using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    };
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    let store = PgStore::new(pool);
    store.migrate().await?;
    Ok(Arc::new(store))
}

async fn register_instances(
    store: &dyn Store,
    channels: &ChannelRegistry,
    http: &reqwest::Client,
    api_base: &str,
) -> Result<usize, StoreError> {
    let mut registered = 0;
    for instance in store.enabled_whatsapp_instances().await? {
        match WhatsAppCloudChannel::from_instance(http.clone(), api_base, &instance) {
            Ok(channel) => {
                channels
                    .register(instance.key(), Arc::new(channel), ConnectionState::Ready)
                    .await;
                registered += 1;
            }
            Err(err) => {
                warn!(tenant = %instance.tenant_id, instance = %instance.instance_id, error = %err, "skipping misconfigured instance");
            }
        }
    }
    Ok(registered)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

pub async fn run() -> Result<(), BoxError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let http = reqwest::Client::new();
    let store = open_store(&config).await?;
    let channels = Arc::new(ChannelRegistry::new());
    let registered =
        register_instances(store.as_ref(), &channels, &http, &config.whatsapp_api_base).await?;
    info!(count = registered, "whatsapp instances registered");

    let engine = Arc::new(FlowEngine::new(
        store.clone(),
        channels.clone(),
        http.clone(),
        config.engine.clone(),
    ));

    let scheduler = Scheduler::new();
    let messages = Arc::new(MessageScheduler::new(
        store.clone(),
        channels.clone(),
        config.scheduler.clone(),
        scheduler.token(),
        scheduler.tracker(),
    ));
    let leads = Arc::new(LeadIngestor::new(
        store.clone(),
        Arc::new(IndiaMartClient::new(http.clone(), &config.indiamart_api_url)),
        scheduler.token(),
        scheduler.tracker(),
    ));
    scheduler.start(
        &config.scheduler,
        store.clone(),
        engine.clone(),
        messages.clone(),
        leads,
    );

    let state = Arc::new(AppState {
        store,
        channels,
        engine,
        messages,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(url = %config.public_base_url, %addr, "waflow server running");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    Ok(())
}
