//! Error types for beadwork.

use std::time::Duration;

/// Abstract error classification shared by every domain error.
///
/// Callers that only need to decide "retry, escalate, or give up" match on
/// this instead of the concrete enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Conflict,
    Unauthorized,
    TransientExternal,
    AuthExternal,
    Budget,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::TransientExternal => "transient-external",
            ErrorKind::AuthExternal => "auth-external",
            ErrorKind::Budget => "budget",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Message bus error: {0}")]
    MessageBus(#[from] MessageBusError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Knowledge error: {0}")]
    Knowledge(#[from] KnowledgeError),

    #[error("Comment error: {0}")]
    Comment(#[from] CommentError),

    #[error("Secrets error: {0}")]
    Secrets(#[from] SecretsError),

    #[error("Feedback error: {0}")]
    Feedback(#[from] FeedbackError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Repo platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::InvalidArgument,
            Error::Database(e) => e.kind(),
            Error::Workflow(e) => e.kind(),
            Error::Dispatch(e) => e.kind(),
            Error::MessageBus(e) => e.kind(),
            Error::Provider(e) => e.kind(),
            Error::Knowledge(e) => e.kind(),
            Error::Comment(e) => e.kind(),
            Error::Secrets(e) => e.kind(),
            Error::Feedback(e) => e.kind(),
            Error::Lock(e) => e.kind(),
            Error::Platform(e) => e.kind(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Durable store errors. Every variant carries the operation name.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("{operation}: {entity} {id} not found")]
    NotFound {
        operation: String,
        entity: String,
        id: String,
    },

    #[error("{operation}: {entity} {id} already exists")]
    Duplicate {
        operation: String,
        entity: String,
        id: String,
    },

    #[error("{operation}: invalid argument: {reason}")]
    InvalidArgument { operation: String, reason: String },

    #[error("{operation}: connection failed: {reason}")]
    Connection { operation: String, reason: String },

    #[error("{operation}: query failed: {reason}")]
    Query { operation: String, reason: String },

    #[error("{operation}: corrupt row: {reason}")]
    Serialization { operation: String, reason: String },
}

impl DatabaseError {
    pub fn not_found(operation: &str, entity: &str, id: impl Into<String>) -> Self {
        DatabaseError::NotFound {
            operation: operation.to_string(),
            entity: entity.to_string(),
            id: id.into(),
        }
    }

    pub fn invalid(operation: &str, reason: impl Into<String>) -> Self {
        DatabaseError::InvalidArgument {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    pub fn query(operation: &str, reason: impl std::fmt::Display) -> Self {
        DatabaseError::Query {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DatabaseError::NotFound { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DatabaseError::NotFound { .. } => ErrorKind::NotFound,
            DatabaseError::Duplicate { .. } => ErrorKind::Conflict,
            DatabaseError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            DatabaseError::Connection { .. } => ErrorKind::TransientExternal,
            DatabaseError::Query { .. } | DatabaseError::Serialization { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

/// Workflow engine errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("Execution {0} not found")]
    ExecutionNotFound(String),

    #[error("Execution {id} is already {status}")]
    AlreadyTerminal { id: String, status: String },

    #[error("no edge found from node '{from}' with condition '{condition}'")]
    NoEdgeFound { from: String, condition: String },

    #[error("Node '{node_key}' not found in workflow {workflow_id}")]
    NodeNotFound {
        workflow_id: String,
        node_key: String,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            WorkflowError::WorkflowNotFound(_)
            | WorkflowError::ExecutionNotFound(_)
            | WorkflowError::NodeNotFound { .. } => ErrorKind::NotFound,
            WorkflowError::AlreadyTerminal { .. } => ErrorKind::Conflict,
            WorkflowError::NoEdgeFound { .. } => ErrorKind::InvalidArgument,
            WorkflowError::Database(e) => e.kind(),
        }
    }
}

/// Dispatcher errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispatch of bead {bead_id} failed: {reason}")]
    Failed { bead_id: String, reason: String },

    #[error("Dispatch budget exhausted for bead {bead_id}: {dispatch_count} dispatches")]
    BudgetExhausted { bead_id: String, dispatch_count: u32 },

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Failed { .. } => ErrorKind::Internal,
            DispatchError::BudgetExhausted { .. } => ErrorKind::Budget,
            DispatchError::Workflow(e) => e.kind(),
            DispatchError::Database(e) => e.kind(),
            DispatchError::Provider(e) => e.kind(),
        }
    }
}

/// Agent message bus errors.
#[derive(Debug, thiserror::Error)]
pub enum MessageBusError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("unsupported message type: {0}")]
    UnsupportedMessageType(String),

    #[error("No agent registry configured; cannot resolve role '{0}'")]
    NoRegistry(String),

    #[error("No agent found for role '{0}'")]
    RoleNotFound(String),

    #[error("Timed out after {0:?} waiting for response")]
    Timeout(Duration),

    #[error("Message bus is closed")]
    Closed,
}

impl MessageBusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessageBusError::InvalidMessage(_) | MessageBusError::UnsupportedMessageType(_) => {
                ErrorKind::InvalidArgument
            }
            MessageBusError::NoRegistry(_) => ErrorKind::Internal,
            MessageBusError::RoleNotFound(_) => ErrorKind::NotFound,
            MessageBusError::Timeout(_) => ErrorKind::Timeout,
            MessageBusError::Closed => ErrorKind::Internal,
        }
    }
}

/// Provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {0} not found")]
    NotFound(String),

    #[error("Provider {provider_id} is not usable: {reason}")]
    Unavailable { provider_id: String, reason: String },

    #[error("Provider {provider_id} request failed: {reason}")]
    RequestFailed { provider_id: String, reason: String },

    #[error("Provider {provider_id} rejected credentials (HTTP {status})")]
    AuthFailed { provider_id: String, status: u16 },

    #[error("Provider {provider_id} rate limited")]
    RateLimited { provider_id: String },

    #[error("Provider {provider_id} returned an invalid response: {reason}")]
    InvalidResponse { provider_id: String, reason: String },

    #[error("Provider request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid model catalog: {0}")]
    InvalidCatalog(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::NotFound(_) => ErrorKind::NotFound,
            ProviderError::Unavailable { .. } | ProviderError::RequestFailed { .. } => {
                ErrorKind::TransientExternal
            }
            ProviderError::AuthFailed { .. } => ErrorKind::AuthExternal,
            ProviderError::RateLimited { .. } => ErrorKind::TransientExternal,
            ProviderError::InvalidResponse { .. } => ErrorKind::TransientExternal,
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::InvalidCatalog(_) => ErrorKind::InvalidArgument,
            ProviderError::Database(e) => e.kind(),
            ProviderError::Secrets(e) => e.kind(),
        }
    }
}

/// Project memory and lesson errors.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Embedding blob of {len} bytes is not a multiple of 4")]
    CorruptEmbedding { len: usize },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl KnowledgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KnowledgeError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            KnowledgeError::CorruptEmbedding { .. } => ErrorKind::Internal,
            KnowledgeError::Database(e) => e.kind(),
        }
    }
}

/// Comment and mention errors.
#[derive(Debug, thiserror::Error)]
pub enum CommentError {
    #[error("Comment {0} not found")]
    NotFound(String),

    #[error("User {user_id} is not the author of comment {comment_id}")]
    NotAuthor { comment_id: String, user_id: String },

    #[error("Invalid comment: {0}")]
    Invalid(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl CommentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommentError::NotFound(_) => ErrorKind::NotFound,
            CommentError::NotAuthor { .. } => ErrorKind::Unauthorized,
            CommentError::Invalid(_) => ErrorKind::InvalidArgument,
            CommentError::Database(e) => e.kind(),
        }
    }
}

/// Secret storage errors.
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("Master key must be at least 32 bytes")]
    InvalidMasterKey,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl SecretsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecretsError::InvalidMasterKey => ErrorKind::InvalidArgument,
            SecretsError::EncryptionFailed(_)
            | SecretsError::DecryptionFailed(_)
            | SecretsError::KeyGeneration(_) => ErrorKind::Internal,
            SecretsError::Database(e) => e.kind(),
        }
    }
}

/// Build/lint/test feedback errors.
#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("Failed to spawn {stage} command '{command}': {reason}")]
    Spawn {
        stage: String,
        command: String,
        reason: String,
    },

    #[error("{stage} timed out after {timeout:?}")]
    Timeout { stage: String, timeout: Duration },
}

impl FeedbackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FeedbackError::Spawn { .. } => ErrorKind::Internal,
            FeedbackError::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// Advisory lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock '{lock_name}' is held by {holder} until {expires_at}")]
    Held {
        lock_name: String,
        holder: String,
        expires_at: String,
    },

    #[error("Lock '{0}' was lost")]
    Lost(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl LockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LockError::Held { .. } => ErrorKind::Conflict,
            LockError::Lost(_) => ErrorKind::Conflict,
            LockError::Database(e) => e.kind(),
        }
    }
}

/// Repo platform (CI, issues, pull requests) errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Failed to run {command}: {reason}")]
    Command { command: String, reason: String },

    #[error("{command} exited with {code}: {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Failed to parse {command} output: {reason}")]
    Parse { command: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl PlatformError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlatformError::Command { .. } | PlatformError::Exit { .. } => ErrorKind::TransientExternal,
            PlatformError::Parse { .. } => ErrorKind::Internal,
            PlatformError::Database(e) => e.kind(),
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_carries_operation() {
        let err = DatabaseError::not_found("get_bead", "bead", "bd-1");
        assert!(err.is_not_found());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "get_bead: bead bd-1 not found");
    }

    #[test]
    fn test_kind_propagates_through_wrappers() {
        let err: Error = WorkflowError::from(DatabaseError::not_found("x", "y", "z")).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: Error = WorkflowError::AlreadyTerminal {
            id: "e1".into(),
            status: "completed".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_unsupported_message_type_text() {
        let err = MessageBusError::UnsupportedMessageType("gossip".into());
        assert_eq!(err.to_string(), "unsupported message type: gossip");
    }
}
