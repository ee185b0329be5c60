//! Errors - エラー型と分類
//!
//! Every top-level error reports an `ErrorKind` so callers can pick a policy
//! (retry, surface, purge) without matching on variants.

use std::time::Duration;

use thiserror::Error;

/// ErrorKind は実行エラーの分類
///
/// - Connectivity: bus/registry unreachable, retried with backoff
/// - Validation: identity not found, terminal per request
/// - Protocol: malformed payload or publish failure, surfaced, not retried
/// - Timeout: no reply before the deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Validation,
    Protocol,
    Timeout,
}

/// Failures reported by a message bus adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unknown exchange '{0}'")]
    UnknownExchange(String),

    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("queue '{0}' is exclusive to another connection")]
    ExclusiveQueue(String),

    #[error("cannot encode message body: {0}")]
    Encode(String),
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::ConnectionRefused(_) | BusError::ConnectionClosed => ErrorKind::Connectivity,
            _ => ErrorKind::Protocol,
        }
    }
}

/// Failures reported by the identity registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate key '{0}'")]
    DuplicateKey(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Unavailable(_) => ErrorKind::Connectivity,
            RegistryError::DuplicateKey(_) => ErrorKind::Protocol,
        }
    }
}

/// Bring-up of a connection did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectivityError {
    #[error("{target}: gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{0}: manager is shut down")]
    Closed(String),
}

/// A correlation id was registered twice while still outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("correlation id '{0}' is already pending")]
pub struct DuplicateCorrelation(pub String);

/// Failures of one RPC call.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error("no reply for {correlation_id} within {after:?}")]
    Timeout {
        correlation_id: String,
        after: Duration,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Duplicate(#[from] DuplicateCorrelation),
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Connectivity(_) => ErrorKind::Connectivity,
            RpcError::Timeout { .. } => ErrorKind::Timeout,
            RpcError::Protocol(_) | RpcError::Duplicate(_) => ErrorKind::Protocol,
            RpcError::Bus(e) => e.kind(),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Protocol(e.to_string())
    }
}
