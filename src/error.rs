use thiserror::Error;

/// Failures raised by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A second active session was about to be created for the same contact.
    #[error("active session already exists for {tenant_id}/{instance_id}/{contact}")]
    ActiveSessionExists {
        tenant_id: String,
        instance_id: String,
        contact: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "row",
                id: String::new(),
            },
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Failures talking to a messaging channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel unavailable for {tenant_id}/{instance_id}: {reason}")]
    Unavailable {
        tenant_id: String,
        instance_id: String,
        reason: String,
    },

    #[error("channel request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("channel rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("channel configuration error: {0}")]
    Config(String),
}

impl ChannelError {
    /// The provider refused our credentials; further sends will fail the same way.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ChannelError::Rejected { status: 401 | 403, .. })
    }
}

/// Problems with a flow definition or with walking its graph.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid node {node_id}: {reason}")]
    InvalidNode { node_id: String, reason: String },

    #[error("edge {edge_id} references unknown node {node_id}")]
    DanglingEdge { edge_id: String, node_id: String },

    #[error("node {node_id} not found in flow {flow_id}")]
    MissingNode { flow_id: String, node_id: String },

    #[error("flow {flow_id} exceeded {limit} steps in one run")]
    StepBudgetExceeded { flow_id: String, limit: usize },
}

/// Error reported by an external lead source.
#[derive(Debug, Error)]
#[error("lead source error {code}: {message}")]
pub struct LeadSourceError {
    pub code: String,
    pub message: String,
}

impl LeadSourceError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for LeadSourceError {
    fn from(err: reqwest::Error) -> Self {
        let code = err
            .status()
            .map(|s| s.as_u16().to_string())
            .unwrap_or_else(|| "REQUEST_ERROR".to_string());
        Self::new(code, err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    LeadSource(#[from] LeadSourceError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
