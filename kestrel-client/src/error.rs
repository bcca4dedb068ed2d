//! Error types for the Kestrel client library

use kestrel::{CodecError, ErrorCode};

/// Main error type for Kestrel client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Error code returned by a broker
    #[error("Broker error {code} ({kind:?}): {message}")]
    Api {
        code: i16,
        kind: ErrorCode,
        message: String,
    },

    /// Invalid configuration or API misuse, raised before any network activity
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Connection-level failures
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// CRC mismatch or undecodable broker data
    #[error("Corrupt data: {message}")]
    Corruption { message: String },

    /// Wire codec errors other than corruption
    #[error("Codec error: {0}")]
    Codec(#[source] CodecError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Write stream closed")]
    Closed,

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Topic '{topic}' does not exist")]
    TopicNotFound { topic: String },

    #[error("Partition {partition} does not exist for topic '{topic}'")]
    PartitionNotFound { topic: String, partition: i32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Create a broker error from a non-zero wire error code
    pub fn api(code: i16, message: Option<String>) -> Self {
        let kind = ErrorCode::from(code);
        Self::Api {
            code,
            kind,
            message: message.unwrap_or_else(|| kind.message().to_string()),
        }
    }

    /// `None` for code 0, the matching `Api` error otherwise.
    pub fn from_code(code: i16) -> Option<Self> {
        (code != 0).then(|| Self::api(code, None))
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn corruption<S: Into<String>>(message: S) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn topic_not_found<S: Into<String>>(topic: S) -> Self {
        Self::TopicNotFound {
            topic: topic.into(),
        }
    }

    pub fn partition_not_found<S: Into<String>>(topic: S, partition: i32) -> Self {
        Self::PartitionNotFound {
            topic: topic.into(),
            partition,
        }
    }

    /// Broker error kind, if this is a broker error
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Api { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { kind, .. } => kind.is_retriable(),
            Self::Transport { .. } => true,
            Self::Timeout { .. } => true,
            Self::Io(_) => true,
            Self::Codec(CodecError::Io(_)) => true,
            _ => false,
        }
    }

    /// Whether the leader this error came from may have moved.
    pub fn requires_metadata_refresh(&self) -> bool {
        match self {
            Self::Api { kind, .. } => kind.requires_metadata_refresh(),
            Self::Transport { .. } | Self::Io(_) | Self::Codec(CodecError::Io(_)) => true,
            _ => false,
        }
    }

    pub fn requires_coordinator_refresh(&self) -> bool {
        matches!(self, Self::Api { kind, .. } if kind.requires_coordinator_refresh())
    }

    /// The transaction coordinator moved or is still loading; the request
    /// was refused without being applied.
    pub fn is_coordinator_busy(&self) -> bool {
        matches!(
            self,
            Self::Api {
                kind: ErrorCode::CoordinatorLoadInProgress
                    | ErrorCode::CoordinatorNotAvailable
                    | ErrorCode::NotCoordinator,
                ..
            }
        )
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Io(_) | Self::Codec(CodecError::Io(_))
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Corruption(message) => Self::Corruption { message },
            other => Self::Codec(other),
        }
    }
}

// Every command of a failed batch receives its own copy of the error.
impl Clone for ClientError {
    fn clone(&self) -> Self {
        match self {
            Self::Api {
                code,
                kind,
                message,
            } => Self::Api {
                code: *code,
                kind: *kind,
                message: message.clone(),
            },
            Self::Config { message } => Self::config(message.clone()),
            Self::Transport { message } => Self::transport(message.clone()),
            Self::Corruption { message } => Self::corruption(message.clone()),
            Self::Codec(e) => Self::Codec(e.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::Closed => Self::Closed,
            Self::Timeout { timeout_ms } => Self::timeout(*timeout_ms),
            Self::TopicNotFound { topic } => Self::topic_not_found(topic.clone()),
            Self::PartitionNotFound { topic, partition } => {
                Self::partition_not_found(topic.clone(), *partition)
            }
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}
