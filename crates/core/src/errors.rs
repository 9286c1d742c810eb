use thiserror::Error;

/// 400-class problems with the request itself. Reported verbatim; never
/// retried.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("question cannot be empty")]
    EmptyQuestion,
    #[error("parameter `k` must be at most 20")]
    InvalidTopK,
    #[error("session id may only contain letters, digits, `-` and `_`")]
    InvalidSessionId,
}

/// Recoverable tool failures. These are captured into the response envelope
/// as data so the client can see what was attempted; they never abort the
/// request on their own.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("language model call failed: {0}")]
    Llm(String),
    #[error("language model rate limit exhausted")]
    RateLimited { retry_after_ms: u64 },
    #[error("embedding request failed: {0}")]
    Embedding(String),
    #[error("generated statement rejected: {0}")]
    SqlRejected(String),
    #[error("outlet query failed: {0}")]
    SqlExecution(String),
    #[error("{tool} call exceeded its {deadline_ms}ms deadline")]
    DeadlineExceeded { tool: &'static str, deadline_ms: u64 },
}

impl ToolError {
    /// One retry/regeneration is allowed for SQL paths; the language model
    /// gets none.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::SqlRejected(_)
                | Self::SqlExecution(_)
                | Self::DeadlineExceeded { tool: "sql", .. }
        )
    }
}

/// Resource exhaustion. Surfaces as 503 with a retry hint.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("language model rate limit exhausted")]
    RateLimited { retry_after_ms: u64 },
    #[error("outlet store connection pool exhausted")]
    PoolExhausted,
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl ServiceError {
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            Self::RateLimited { retry_after_ms } => *retry_after_ms,
            Self::PoolExhausted => 1_000,
            Self::DeadlineExceeded => 5_000,
        }
    }
}

/// Orchestrator-level failure. Everything that is not a captured tool error
/// funnels through here on its way to an HTTP status.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Resource(#[from] ServiceError),
    #[error("internal failure: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Request(inner) => inner.to_string(),
            Self::Resource(_) => {
                "The service is temporarily busy. Please retry shortly.".to_string()
            }
            Self::Internal(_) => "An unexpected internal error occurred.".to_string(),
        }
    }
}
