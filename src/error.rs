//! Error types for the mesh.
//!
//! One variant family per subsystem, each carrying a message and whatever
//! identifier is relevant for debugging (node id, instance id, field name).

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Membership engine errors: bind failure, unknown peer, capacity.
    #[error("membership error: {message}")]
    Membership {
        message: String,
        node_id: Option<String>,
    },

    /// Coordinator errors: invalid role transition, task rejected.
    #[error("coordinator error: {message}")]
    Coordinator { message: String },

    /// Instance manager errors: unknown instance, port exhaustion, cap hit.
    #[error("instance manager error: {message}")]
    InstanceManager {
        message: String,
        node_id: Option<String>,
    },

    /// Transport facade errors: connect failure, send on closed channel.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Configuration errors: missing file, malformed TOML, bad value.
    #[error("configuration error: {message}")]
    Config {
        message: String,
        field: Option<String>,
    },

    /// Wrapped I/O error (socket bind, recv, send).
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn membership(message: impl Into<String>) -> Self {
        Error::Membership {
            message: message.into(),
            node_id: None,
        }
    }

    pub fn membership_for(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Membership {
            message: message.into(),
            node_id: Some(node_id.into()),
        }
    }

    pub fn coordinator(message: impl Into<String>) -> Self {
        Error::Coordinator {
            message: message.into(),
        }
    }

    pub fn instance_manager(message: impl Into<String>) -> Self {
        Error::InstanceManager {
            message: message.into(),
            node_id: None,
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            operation: operation.into(),
            source,
        }
    }
}

/// Correlation context attached to an error that crossed a component
/// boundary (e.g. Instance Manager constructing an Engine + Coordinator).
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub correlation_id: uuid::Uuid,
    pub operation: String,
    pub context: std::collections::HashMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4(),
            operation: operation.into(),
            context: std::collections::HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// An [`Error`] paired with an [`ErrorContext`] for cross-component failures.
#[derive(Error, Debug)]
#[error("{error} (operation={}, correlation_id={})", context.operation, context.correlation_id)]
pub struct ContextualError {
    pub error: Error,
    pub context: ErrorContext,
}

impl ContextualError {
    pub fn with_operation(error: Error, operation: impl Into<String>) -> Self {
        Self {
            error,
            context: ErrorContext::new(operation),
        }
    }
}
