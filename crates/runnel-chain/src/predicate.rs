use std::sync::Arc;

use runnel_core::error::RunnelError;

/// Which errors a retry or fallback wrapper should handle.
///
/// Cancellation and recursion-limit errors are never handled, whatever the
/// variant says.
#[derive(Clone, Default)]
pub enum ErrorPredicate {
    /// Every error.
    #[default]
    All,
    /// Network, timeout and rate-limit failures only.
    Transient,
    Custom(Arc<dyn Fn(&RunnelError) -> bool + Send + Sync>),
}

impl ErrorPredicate {
    pub fn custom(f: impl Fn(&RunnelError) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    pub fn matches(&self, error: &RunnelError) -> bool {
        if error.is_unhandleable() {
            return false;
        }
        match self {
            Self::All => true,
            Self::Transient => error.is_transient(),
            Self::Custom(f) => f(error),
        }
    }
}

impl std::fmt::Debug for ErrorPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "All"),
            Self::Transient => write!(f, "Transient"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}
