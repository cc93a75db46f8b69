//! Error types for mail-director.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tenant error: {0}")]
    Tenant(#[from] TenantError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Mail provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Fetcher error: {0}")]
    Fetcher(#[from] FetcherError),
}

/// Milliseconds of a duration, saturated to `u64`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tenant id validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TenantError {
    #[error("Invalid tenant id '{uid}': {reason}")]
    Invalid { uid: String, reason: &'static str },
}

/// Durable storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error in collection {collection}: {reason}")]
    Serialization { collection: String, reason: String },
}

/// Resource registry errors: bad uid or a failed tenant initialization.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Tenant(#[from] TenantError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Mail provider errors (wire-level failures reported by a `MailProvider`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("{operation}_timeout_{millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("No mail provider registered for '{0}'")]
    UnknownProvider(String),

    #[error("Missing refresh token")]
    MissingRefreshToken,
}

impl ProviderError {
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis: millis(timeout),
        }
    }
}

/// Classified token refresh failures.
///
/// `MissingRefreshToken` and `InvalidGrant` are terminal: the account needs
/// re-authorization and is not retried until that happens. `Network` is
/// transient and naturally retried by the next scheduled cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Account {account_id} has no refresh token; re-authorization required")]
    MissingRefreshToken { account_id: String },

    #[error("Refresh grant rejected for account {account_id}: {reason}")]
    InvalidGrant { account_id: String, reason: String },

    #[error("Network failure refreshing account {account_id}: {reason}")]
    Network { account_id: String, reason: String },

    #[error("Token refresh failed for account {account_id}: {reason}")]
    Other { account_id: String, reason: String },
}

impl TokenError {
    /// Short classification label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingRefreshToken { .. } => "missing_refresh_token",
            Self::InvalidGrant { .. } => "invalid_grant",
            Self::Network { .. } => "network",
            Self::Other { .. } => "other",
        }
    }

    /// Whether the user must re-authorize the account.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Self::MissingRefreshToken { .. } | Self::InvalidGrant { .. }
        )
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("No LLM provider registered for '{0}'")]
    UnknownProvider(String),

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tool dispatch errors. These never abort an agent loop; the dispatcher
/// turns them into synthetic tool results.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Tool {name} is not available to this actor")]
    NotPermitted { name: String },

    #[error("Invalid arguments for tool {name}: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("tool_timeout_{millis}ms")]
    Timeout { name: String, millis: u64 },
}

/// Conversation thread state errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("Conversation {id} not found")]
    NotFound { id: String },

    #[error("Conversation {id} is finalized")]
    Finalized { id: String },

    #[error("Conversation {id} has expired")]
    Expired { id: String },
}

/// Orchestration engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("engine_step_timeout_{millis}ms")]
    StepTimeout { millis: u64 },

    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Whether a later attempt may succeed unchanged: timeouts, transport
    /// failures, rate limits, 5xx responses and storage hiccups.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StepTimeout { .. } | Self::Storage(_) => true,
            Self::Llm(LlmError::RequestFailed { .. }) => true,
            Self::Llm(LlmError::Http { status, .. }) => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Email pipeline errors. Per-account and per-message failures are logged
/// and isolated; only these escape a cycle.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Fetcher and fetcher manager errors.
#[derive(Debug, thiserror::Error)]
pub enum FetcherError {
    #[error(transparent)]
    Tenant(#[from] TenantError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_errors_render_with_millis_suffix() {
        let err = ProviderError::timeout("list_unread", Duration::from_secs(15));
        assert_eq!(err.to_string(), "list_unread_timeout_15000ms");

        let err = ToolError::Timeout {
            name: "log_note".into(),
            millis: 250,
        };
        assert_eq!(err.to_string(), "tool_timeout_250ms");

        let err = EngineError::StepTimeout { millis: 60_000 };
        assert_eq!(err.to_string(), "engine_step_timeout_60000ms");
    }

    #[test]
    fn terminal_token_errors_require_reauthorization() {
        let missing = TokenError::MissingRefreshToken {
            account_id: "a1".into(),
        };
        let grant = TokenError::InvalidGrant {
            account_id: "a1".into(),
            reason: "revoked".into(),
        };
        let network = TokenError::Network {
            account_id: "a1".into(),
            reason: "dns".into(),
        };
        assert!(missing.requires_reauthorization());
        assert!(grant.requires_reauthorization());
        assert!(!network.requires_reauthorization());
        assert_eq!(grant.kind(), "invalid_grant");
    }

    #[test]
    fn engine_error_transience() {
        assert!(EngineError::StepTimeout { millis: 100 }.is_transient());
        assert!(
            EngineError::Llm(LlmError::Http {
                provider: "openai".into(),
                status: 503,
                body: String::new(),
            })
            .is_transient()
        );
        assert!(
            !EngineError::Llm(LlmError::Http {
                provider: "openai".into(),
                status: 401,
                body: String::new(),
            })
            .is_transient()
        );
        assert!(
            !EngineError::NotFound {
                entity: "director",
                id: "d9".into(),
            }
            .is_transient()
        );
    }
}
