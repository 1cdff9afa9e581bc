pub mod binding;
pub mod branch;
pub mod configurable;
pub mod each;
pub mod fallbacks;
pub mod lambda;
pub mod mock;
pub mod parallel;
pub mod parser;
pub mod predicate;
pub mod prompt;
pub mod retry;

use serde_json::Value;

use runnel_core::config::RunnableConfig;
use runnel_core::runnable::Runnable;

use crate::binding::RunnableBinding;
use crate::each::RunnableEach;
use crate::fallbacks::RunnableWithFallbacks;
use crate::retry::{RetryConfig, RunnableRetry};

/// Wrapper constructors available on every Runnable.
pub trait ChainExt: Runnable + Sized {
    /// Retry failed calls according to `config`.
    fn with_retry(self, config: RetryConfig) -> RunnableRetry<Self> {
        RunnableRetry::new(self, config)
    }

    /// Try `fallbacks` in order when this Runnable fails.
    fn with_fallbacks<R>(
        self,
        fallbacks: impl IntoIterator<Item = R>,
    ) -> RunnableWithFallbacks<Self::Input, Self::Output>
    where
        Self: 'static,
        R: Runnable<Input = Self::Input, Output = Self::Output> + 'static,
    {
        fallbacks
            .into_iter()
            .fold(RunnableWithFallbacks::new(self), |chain, fallback| {
                chain.with_fallback(fallback)
            })
    }

    /// Store `config` as defaults that the caller's config overrides.
    fn with_config(self, config: RunnableConfig) -> RunnableBinding<Self> {
        RunnableBinding::new(self).with_config(config)
    }

    /// Force the call option `key` to `value` on every call.
    fn bind(self, key: impl Into<String>, value: Value) -> RunnableBinding<Self> {
        RunnableBinding::new(self).bind(key, value)
    }

    /// Apply this Runnable to every element of a `Vec`.
    fn map_each(self) -> RunnableEach<Self> {
        RunnableEach::new(self)
    }
}

impl<T: Runnable + Sized> ChainExt for T {}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::binding::RunnableBinding;
    pub use crate::branch::RunnableBranch;
    pub use crate::configurable::RunnableConfigurableAlternatives;
    pub use crate::each::RunnableEach;
    pub use crate::fallbacks::RunnableWithFallbacks;
    pub use crate::lambda::RunnableLambda;
    pub use crate::mock::MockChatModel;
    pub use crate::parallel::RunnableParallel;
    pub use crate::parser::StringOutputParser;
    pub use crate::predicate::ErrorPredicate;
    pub use crate::prompt::PromptTemplate;
    pub use crate::retry::{RetryConfig, RunnableRetry};
    pub use crate::ChainExt;
}
