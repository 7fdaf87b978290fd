//! Error types for the AMQP transport
//!
//! Public API calls fail fast with a [`TransportError`]; external collaborators
//! report failures as [`CollaboratorError`]. Nothing in here ever carries a raw
//! device key or SAS token: messages that may embed configuration text go
//! through [`redact_secrets`] first.

use crate::config::ConfigError;
use crate::transport::amqp::messaging::MessagingError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Failure reported by an external collaborator (TLS, SASL, AMQP library,
/// authentication, methods).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed: {reason}")]
pub struct CollaboratorError {
    pub operation: &'static str,
    pub reason: String,
}

impl CollaboratorError {
    pub fn new<S: Into<String>>(operation: &'static str, reason: S) -> Self {
        Self {
            operation,
            reason: reason.into(),
        }
    }
}

/// Main error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Device '{device_id}' is already registered on this transport")]
    DuplicateDevice { device_id: String },

    #[error("Incompatible credentials: {message}")]
    IncompatibleCredentials { message: String },

    #[error("Device handle {handle} is not registered on this transport")]
    DeviceNotRegistered { handle: u64 },

    #[error("Operation not supported by the AMQP transport: {operation}")]
    NotSupported { operation: &'static str },

    #[error("Option '{name}' rejected: {message}")]
    OptionRejected { name: String, message: String },

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TransportError {
    /// Create invalid configuration error
    pub fn invalid_config<S: AsRef<str>>(message: S) -> Self {
        Self::InvalidConfig {
            message: redact_secrets(message.as_ref()),
        }
    }

    /// Create invalid argument error
    pub fn invalid_argument<S: AsRef<str>>(message: S) -> Self {
        Self::InvalidArgument {
            message: redact_secrets(message.as_ref()),
        }
    }

    /// Create incompatible credentials error
    pub fn incompatible_credentials<S: Into<String>>(message: S) -> Self {
        Self::IncompatibleCredentials {
            message: message.into(),
        }
    }

    /// Create rejected option error
    pub fn option_rejected<N: Into<String>, S: Into<String>>(name: N, message: S) -> Self {
        Self::OptionRejected {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Validation errors never mutate state and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TransportError::InvalidConfig { .. }
                | TransportError::InvalidArgument { .. }
                | TransportError::DuplicateDevice { .. }
                | TransportError::IncompatibleCredentials { .. }
                | TransportError::DeviceNotRegistered { .. }
                | TransportError::OptionRejected { .. }
        )
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(sharedaccesskey|sig|key|token|password|secret)\s*[=:]\s*[^\s;&]+")
        .expect("secret pattern is a valid regex")
});

/// Mask credential fragments (`SharedAccessKey=...`, `sig=...`, `token: ...`)
/// and truncate very long messages to 500 bytes.
pub fn redact_secrets(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
