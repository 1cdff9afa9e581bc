use async_trait::async_trait;

use runnel_core::callbacks::RunType;
use runnel_core::chunk::{Chunk, ChunkStream};
use runnel_core::config::RunnableConfig;
use runnel_core::error::{ChainError, Result, RunnelError};
use runnel_core::runnable::{BatchOptions, BoxRunnable, Runnable};

/// Picks one of several Runnables at call time from
/// `config.configurable[key]`.
///
/// Without the key the default alternative runs. An unknown alternative
/// name fails with `ChainError::InvalidConfig`. The selected Runnable is
/// called directly; no extra run is opened.
pub struct RunnableConfigurableAlternatives<I, O> {
    key: String,
    default_key: String,
    alternatives: Vec<(String, BoxRunnable<I, O>)>,
}

impl<I: Chunk, O: Chunk> RunnableConfigurableAlternatives<I, O> {
    pub fn new<R>(key: impl Into<String>, default_key: impl Into<String>, default: R) -> Self
    where
        R: Runnable<Input = I, Output = O> + 'static,
    {
        let default_key = default_key.into();
        Self {
            key: key.into(),
            alternatives: vec![(default_key.clone(), Box::new(default))],
            default_key,
        }
    }

    pub fn with_alternative<R>(mut self, name: impl Into<String>, alternative: R) -> Self
    where
        R: Runnable<Input = I, Output = O> + 'static,
    {
        let name = name.into();
        let alternative: BoxRunnable<I, O> = Box::new(alternative);
        match self.alternatives.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = alternative,
            None => self.alternatives.push((name, alternative)),
        }
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn default_alternative(&self) -> &BoxRunnable<I, O> {
        // `new` always stores the default first.
        &self.alternatives[0].1
    }

    /// The alternative `config` asks for.
    pub fn select(&self, config: &RunnableConfig) -> Result<&BoxRunnable<I, O>> {
        let Some(choice) = config.configurable.get(&self.key) else {
            return Ok(self.default_alternative());
        };
        let wanted = choice.as_str().ok_or_else(|| {
            RunnelError::from(ChainError::InvalidConfig(format!(
                "configurable '{}' must be a string, got {choice}",
                self.key
            )))
        })?;
        self.alternatives
            .iter()
            .find(|(name, _)| name == wanted)
            .map(|(_, runnable)| runnable)
            .ok_or_else(|| {
                ChainError::InvalidConfig(format!(
                    "unknown alternative '{wanted}' for '{}' (default '{}')",
                    self.key, self.default_key
                ))
                .into()
            })
    }
}

#[async_trait]
impl<I: Chunk, O: Chunk> Runnable for RunnableConfigurableAlternatives<I, O> {
    type Input = I;
    type Output = O;

    fn name(&self) -> String {
        self.default_alternative().name()
    }

    fn run_type(&self) -> RunType {
        self.default_alternative().run_type()
    }

    fn opens_run(&self) -> bool {
        self.default_alternative().opens_run()
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        self.select(config)?.invoke(input, config).await
    }

    async fn batch_with_options(
        &self,
        inputs: Vec<Self::Input>,
        config: &RunnableConfig,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Self::Output>>> {
        self.select(config)?
            .batch_with_options(inputs, config, options)
            .await
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        match self.select(config) {
            Ok(runnable) => runnable.stream(input, config),
            Err(e) => failed(e),
        }
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        match self.select(config) {
            Ok(runnable) => runnable.transform(input, config),
            Err(e) => failed(e),
        }
    }

    async fn invoke_as_child(
        &self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> Result<Self::Output> {
        self.select(config)?.invoke_as_child(input, config).await
    }

    fn transform_as_child<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        match self.select(config) {
            Ok(runnable) => runnable.transform_as_child(input, config),
            Err(e) => failed(e),
        }
    }
}

fn failed<'a, T: Send + 'a>(error: RunnelError) -> ChunkStream<'a, T> {
    Box::pin(futures::stream::once(async move { Err(error) }))
}
