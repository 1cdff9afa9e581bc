use thiserror::Error;

/// Top-level error type for the Runnel library.
#[derive(Debug, Error)]
pub enum RunnelError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The ambient cancellation signal fired before the operation finished.
    #[error("Operation cancelled")]
    Cancelled,

    /// Nested invocation depth exhausted the configured recursion limit.
    #[error("Recursion limit reached while invoking '{name}'")]
    RecursionLimit { name: String },

    /// Every alternative of a fallback chain failed. `last` is the error of the
    /// final alternative; `prior` holds the earlier failures in attempt order.
    #[error("All {} alternatives failed; last error: {last}", .prior.len() + 1)]
    FallbacksExhausted {
        #[source]
        last: Box<RunnelError>,
        prior: Vec<RunnelError>,
    },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("API request failed: {0}")]
    ApiRequest(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Insufficient quota: {0}")]
    InsufficientQuota(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Template error: {0}")]
    Template(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing variable: {0}")]
    MissingVariable(String),

    #[error("Cannot concatenate chunks: {0}")]
    Concat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ModelError {
    /// Whether a provider call failing with this error may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ApiRequest(_) | Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::Http { status, .. } => is_retryable_status(*status),
            Self::InvalidResponse(_) | Self::Auth(_) | Self::InsufficientQuota(_) => false,
        }
    }
}

/// HTTP statuses worth retrying: request timeout, too many requests and
/// server-side failures. Other 4xx responses will fail the same way again.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

impl RunnelError {
    /// True for the cancellation kind, including a fallback chain whose last
    /// alternative was cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::FallbacksExhausted { last, .. } => last.is_cancelled(),
            _ => false,
        }
    }

    /// Network, timeout and rate-limit failures. These are the errors
    /// `AsyncCaller` retries.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Model(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Failures that repeating the same call will not fix: parse, template
    /// and validation errors, non-retryable HTTP statuses and `Other`.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Model(e) => !e.is_transient(),
            Self::Tool(_) | Self::Chain(_) | Self::Serialization(_) | Self::Other(_) => true,
            Self::Cancelled | Self::RecursionLimit { .. } | Self::FallbacksExhausted { .. } => false,
        }
    }

    /// Errors that must never be retried nor handed to a fallback, whatever
    /// the predicate says.
    pub fn is_unhandleable(&self) -> bool {
        self.is_cancelled() || matches!(self, Self::RecursionLimit { .. })
    }
}

pub type Result<T> = std::result::Result<T, RunnelError>;
