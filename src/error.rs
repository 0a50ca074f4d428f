//! Error types for the router.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level fault classes a retry policy can opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    Connect,
    Timeout,
    Connection,
    Decode,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::Connect => "connect",
            FaultKind::Timeout => "timeout",
            FaultKind::Connection => "connection",
            FaultKind::Decode => "decode",
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouterError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Transport error ({}): {message}", kind.as_str())]
    Transport { kind: FaultKind, message: String },

    #[error("Upstream returned status {status}: {message}")]
    UpstreamStatus {
        status: u16,
        message: String,
        body: String,
    },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),
}

impl RouterError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: msg.into(),
        }
    }

    pub fn transport(kind: FaultKind, msg: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: msg.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    pub fn upstream(status: u16, message: impl Into<String>, body: impl Into<String>) -> Self {
        Self::UpstreamStatus {
            status,
            message: message.into(),
            body: body.into(),
        }
    }

    /// Fault class used by retry policies; `None` for status and non-transport errors.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            RouterError::Transport { kind, .. } => Some(*kind),
            RouterError::Decode { .. } => Some(FaultKind::Decode),
            _ => None,
        }
    }

    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            RouterError::UpstreamStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Message shown to callers; upstream errors carry the backend's own text.
    pub fn caller_message(&self) -> String {
        match self {
            RouterError::UpstreamStatus { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Status a collaborator should answer the caller with.
    pub fn http_status(&self) -> u16 {
        match self {
            RouterError::Configuration { .. } => 404,
            RouterError::InvalidRequest { .. } | RouterError::Json(_) => 400,
            RouterError::UpstreamStatus { status, .. } => *status,
            RouterError::Transport {
                kind: FaultKind::Timeout,
                ..
            } => 504,
            _ => 502,
        }
    }

    /// Coarse error class used in caller-facing error bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            RouterError::Configuration { .. } => "not_found_error",
            RouterError::InvalidRequest { .. } | RouterError::Json(_) => "invalid_request_error",
            RouterError::UpstreamStatus { status: 429, .. } => "rate_limit_error",
            RouterError::UpstreamStatus { status, .. } if *status < 500 => "invalid_request_error",
            RouterError::UpstreamStatus { .. } => "api_error",
            RouterError::Transport { .. } => "transport_error",
            RouterError::Decode { .. } => "decode_error",
            _ => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
