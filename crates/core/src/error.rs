use thiserror::Error;

use crate::chat_types::WireError;

/// Failure taxonomy for the chat client.
///
/// Session operations never return these directly; failures are absorbed into
/// the session's `error` observable and callers inspect that instead.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("validation: {message}")]
    Validation { message: String },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("upstream error ({kind}): {message}")]
    Upstream { kind: String, message: String },
    #[error("invariant violation: {message}")]
    InvariantViolation { message: String },
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        ChatError::Validation {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        ChatError::InvariantViolation {
            message: message.into(),
        }
    }

    /// Map a wire-level error chunk onto the taxonomy.
    pub fn upstream(error: WireError) -> Self {
        ChatError::Upstream {
            kind: error.kind,
            message: error.message,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ChatError::Validation { .. })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http status {status}: {sanitized}")]
    HttpStatus {
        status: u16,
        /// Upstream body (sensitive; log only `sanitized`).
        body: String,
        /// Sanitized message for display.
        sanitized: String,
    },
    #[error("network: {0}")]
    Network(String),
    #[error("body read error: {0}")]
    BodyRead(String),
    #[error("stream closed")]
    StreamClosed,
    #[error("other: {0}")]
    Other(String),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn sanitized_message(&self) -> String {
        match self {
            TransportError::HttpStatus { status, .. } => format!("http status {status}"),
            _ => self.to_string(),
        }
    }
}

pub fn http_status_fallback_message(status: u16) -> String {
    format!("http status {status}")
}

pub fn build_http_status_transport_error(status: u16, body: String) -> TransportError {
    TransportError::HttpStatus {
        status,
        body,
        sanitized: http_status_fallback_message(status),
    }
}
