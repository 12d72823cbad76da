use crate::{
    entity::state::{LifecycleState, ServiceKind},
    service::variant::{Operation, RpcMethod},
};

/// Failure of a single JSON-RPC round-trip to a manager.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("manager unreachable: {0}")]
    Unreachable(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("{message}")]
    Remote { code: Option<i64>, message: String },
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid configuration {0}")]
    ConfigError(#[from] figment::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Transport error in {method}: {reason}")]
    Transport { method: String, reason: String },
    #[error("Malformed response to {method}: {body}")]
    MalformedResponse {
        method: String,
        body: String,
        idempotent: bool,
    },
    #[error("Remote error in {method}: {message}")]
    Remote {
        method: String,
        code: Option<i64>,
        message: String,
        idempotent: bool,
    },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Manager of service {service_id} moved to {address}")]
    StaleManager { service_id: u64, address: String },
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Termination error: {0}")]
    Termination(String),
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: LifecycleState, event: String },
    #[error("Service {0} not found")]
    ServiceNotFound(u64),
    #[error("Node {0} not found")]
    NodeNotFound(String),
    #[error("{operation} is not supported by {kind} services")]
    UnsupportedOperation {
        operation: Operation,
        kind: ServiceKind,
    },
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Unknown role {0}")]
    UnknownRole(String),
    #[error("Custom error: {0}")]
    Custom(String),
}

impl Error {
    /// Attaches the method context to a raw RPC failure.
    pub fn from_rpc(method: &RpcMethod, err: RpcError) -> Self {
        match err {
            RpcError::Unreachable(reason) => Error::Transport {
                method: method.name.to_string(),
                reason,
            },
            RpcError::MalformedResponse(body) => Error::MalformedResponse {
                method: method.name.to_string(),
                body,
                idempotent: method.idempotent,
            },
            RpcError::Remote { code, message } => Error::Remote {
                method: method.name.to_string(),
                code,
                message,
                idempotent: method.idempotent,
            },
        }
    }

    /// Whether a passive poller may absorb this failure and try again later.
    ///
    /// Transport failures are always transient. Malformed responses and
    /// explicit remote errors only count as transient for idempotent calls
    /// such as status fetches.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::MalformedResponse { idempotent, .. } => *idempotent,
            Error::Remote { idempotent, .. } => *idempotent,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
