use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use runnel_core::callbacks::RunType;
use runnel_core::chunk::ChunkStream;
use runnel_core::config::RunnableConfig;
use runnel_core::error::Result;
use runnel_core::runnable::{BatchOptions, Runnable};

/// A Runnable with stored config and fixed call arguments.
///
/// Precedence:
/// - [`with_config`](Self::with_config) stores *defaults*. The caller's
///   config is merged on top, so anything the caller sets wins.
/// - [`bind`](Self::bind) stores *forced* call options, e.g. a `stop`
///   sequence for a model. They override the caller's call options.
///
/// A binding opens no run of its own; every method delegates to the wrapped
/// runnable with the effective config.
pub struct RunnableBinding<R> {
    inner: R,
    config: RunnableConfig,
    kwargs: HashMap<String, Value>,
}

impl<R: Runnable> RunnableBinding<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            config: RunnableConfig::default(),
            kwargs: HashMap::new(),
        }
    }

    /// Layer more defaults on top of the stored ones.
    pub fn with_config(mut self, config: RunnableConfig) -> Self {
        self.config = self.config.merge(&config);
        self
    }

    pub fn bind(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Config the wrapped runnable sees for a call made with `caller`.
    pub fn effective_config(&self, caller: &RunnableConfig) -> RunnableConfig {
        let mut merged = self.config.merge(caller);
        merged
            .call_options
            .extend(self.kwargs.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

#[async_trait]
impl<R: Runnable> Runnable for RunnableBinding<R> {
    type Input = R::Input;
    type Output = R::Output;

    fn name(&self) -> String {
        self.inner.name()
    }

    fn run_type(&self) -> RunType {
        self.inner.run_type()
    }

    fn opens_run(&self) -> bool {
        self.inner.opens_run()
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        self.inner.invoke(input, &self.effective_config(config)).await
    }

    async fn batch_with_options(
        &self,
        inputs: Vec<Self::Input>,
        config: &RunnableConfig,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Self::Output>>> {
        self.inner
            .batch_with_options(inputs, &self.effective_config(config), options)
            .await
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        self.inner.stream(input, &self.effective_config(config))
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        self.inner.transform(input, &self.effective_config(config))
    }

    async fn invoke_as_child(
        &self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> Result<Self::Output> {
        self.inner
            .invoke_as_child(input, &self.effective_config(config))
            .await
    }

    fn transform_as_child<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        self.inner
            .transform_as_child(input, &self.effective_config(config))
    }
}
