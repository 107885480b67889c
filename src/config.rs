use std::{env, time::Duration};

/// Process configuration, read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub public_base_url: String,
    pub whatsapp_api_base: String,
    pub indiamart_api_url: String,
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
}

/// Knobs for the flow engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Node executions allowed per run before it is aborted.
    pub max_steps: usize,
    /// Invalid replies tolerated before a session is abandoned; `None` is unlimited.
    pub max_validation_retries: Option<u32>,
    pub webhook_timeout: Duration,
    pub ignore_group_chats: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            max_validation_retries: None,
            webhook_timeout: Duration::from_secs(15),
            ignore_group_chats: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub message_poll_interval: Duration,
    /// Messages due sooner than this get a wake-up timer on creation.
    pub message_near_future: Duration,
    /// `sending` claims older than this are failed as interrupted.
    pub message_processing_window: Duration,
    pub message_batch_size: usize,
    pub lead_poll_interval: Duration,
    pub session_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            message_poll_interval: Duration::from_secs(60),
            message_near_future: Duration::from_secs(300),
            message_processing_window: Duration::from_secs(300),
            message_batch_size: 50,
            lead_poll_interval: Duration::from_secs(60),
            session_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let secs = |key: &str, default: u64| {
            Duration::from_secs(
                var(key)
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(default),
            )
        };

        let port = var("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(4000);
        let public_base_url = var("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();
        let whatsapp_api_base = var("WHATSAPP_API_BASE")
            .unwrap_or_else(|| "https://graph.facebook.com/v21.0".to_string())
            .trim_end_matches('/')
            .to_string();

        let indiamart_api_url = var("INDIAMART_API_URL").unwrap_or_else(|| {
            "https://mapi.indiamart.com/wservce/crm/crmListing/v2/".to_string()
        });

        let engine = EngineConfig {
            max_steps: var("FLOW_MAX_STEPS")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(100),
            max_validation_retries: var("FLOW_MAX_VALIDATION_RETRIES")
                .and_then(|v| v.parse::<u32>().ok()),
            webhook_timeout: secs("WEBHOOK_TIMEOUT_SECS", 15),
            ignore_group_chats: var("IGNORE_GROUP_CHATS")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(true),
        };

        let scheduler = SchedulerConfig {
            message_poll_interval: secs("MESSAGE_POLL_INTERVAL_SECS", 60),
            message_near_future: secs("MESSAGE_NEAR_FUTURE_SECS", 300),
            message_processing_window: secs("MESSAGE_PROCESSING_WINDOW_SECS", 300),
            message_batch_size: 50,
            lead_poll_interval: secs("LEAD_POLL_INTERVAL_SECS", 60),
            session_sweep_interval: secs("SESSION_SWEEP_INTERVAL_SECS", 60),
        };

        Self {
            port,
            database_url: resolve_database_url(&var),
            public_base_url,
            whatsapp_api_base,
            indiamart_api_url,
            engine,
            scheduler,
        }
    }
}

fn resolve_database_url(var: &impl Fn(&str) -> Option<String>) -> Option<String> {
    if let Some(url) = var("DATABASE_URL") {
        return Some(url);
    }
    let host = var("POSTGRES_HOST").or_else(|| var("PGHOST"))?;
    let port = var("POSTGRES_PORT")
        .or_else(|| var("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = var("POSTGRES_USER")
        .or_else(|| var("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = var("POSTGRES_PASSWORD")
        .or_else(|| var("PGPASSWORD"))
        .unwrap_or_default();
    let db = var("POSTGRES_DB")
        .or_else(|| var("PGDATABASE"))
        .unwrap_or_else(|| "waflow".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}
