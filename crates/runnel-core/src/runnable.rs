use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::callbacks::RunType;
use crate::chunk::{collect_chunks, once, Chunk, ChunkStream};
use crate::config::RunnableConfig;
use crate::error::{Result, RunnelError};
use crate::traced::{call_with_config, transform_with_config, Traced};

pub use crate::sequence::RunnableSequence;

/// Options for [`Runnable::batch_with_options`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Return per-input errors instead of failing the whole batch.
    pub return_exceptions: bool,
    /// Overrides the config's `max_concurrency` for this batch.
    pub max_concurrency: Option<usize>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_return_exceptions(mut self, yes: bool) -> Self {
        self.return_exceptions = yes;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }
}

/// Core abstraction for composable, async computation units.
///
/// Every component in a Runnel pipeline (prompts, models, parsers, tools)
/// implements this trait. Only [`invoke`](Runnable::invoke) is required;
/// batching, streaming and transforming have working defaults built on it.
/// Components are composed with `.pipe()` and the wrappers in `runnel-chain`.
#[async_trait]
pub trait Runnable: Send + Sync {
    type Input: Chunk;
    type Output: Chunk;

    /// Display name of the runs this component opens.
    fn name(&self) -> String {
        short_type_name::<Self>()
    }

    fn run_type(&self) -> RunType {
        RunType::Chain
    }

    /// Process a single input and return a result.
    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output>;

    /// Process multiple inputs concurrently, failing on the first error.
    ///
    /// Output order matches input order.
    async fn batch(
        &self,
        inputs: Vec<Self::Input>,
        config: &RunnableConfig,
    ) -> Result<Vec<Self::Output>> {
        self.batch_with_options(inputs, config, &BatchOptions::default())
            .await?
            .into_iter()
            .collect()
    }

    /// Process multiple inputs with at most `max_concurrency` in flight.
    ///
    /// With `return_exceptions` every input gets its own result; otherwise
    /// the first error is returned and inputs not yet started never start.
    /// Cancellation always fails the whole batch.
    async fn batch_with_options(
        &self,
        inputs: Vec<Self::Input>,
        config: &RunnableConfig,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Self::Output>>> {
        run_batch(inputs, config, options, |input| self.invoke(input, config)).await
    }

    /// Stream output chunks for a single input.
    ///
    /// Default implementation yields a single item from `invoke`.
    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        let config = config.clone();
        futures::stream::once(async move { self.invoke(input, &config).await }).boxed()
    }

    /// Map a stream of input chunks to a stream of output chunks.
    ///
    /// Default implementation concatenates the whole input before calling
    /// `stream`, so it only starts once upstream is done. An empty input
    /// stream yields nothing.
    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        let config = config.clone();
        Box::pin(async_stream::stream! {
            match collect_chunks(input).await {
                Ok(Some(whole)) => {
                    let mut inner = self.stream(whole, &config);
                    while let Some(item) = inner.next().await {
                        yield item;
                    }
                }
                Ok(None) => {}
                Err(e) => yield Err(e),
            }
        })
    }

    /// Whether `invoke` and `transform` already open a run of their own.
    /// Composites wrap components that don't in a run when nesting them.
    #[doc(hidden)]
    fn opens_run(&self) -> bool {
        false
    }

    /// Number of sequence steps this component contributes when piped.
    #[doc(hidden)]
    fn steps_len(&self) -> usize {
        1
    }

    /// Invoke as a nested child, guaranteeing a run of its own.
    #[doc(hidden)]
    async fn invoke_as_child(
        &self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> Result<Self::Output> {
        if self.opens_run() {
            self.invoke(input, config).await
        } else {
            call_with_config(self.name(), self.run_type(), input, config, |input, child| async move {
                self.invoke(input, &child).await
            })
            .await
        }
    }

    /// Transform as a nested child, guaranteeing a run of its own.
    #[doc(hidden)]
    fn transform_as_child<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        if self.opens_run() {
            self.transform(input, config)
        } else {
            transform_with_config(self.name(), self.run_type(), None, config, move |child| {
                self.transform(input, &child)
            })
        }
    }

    /// Invoke as step `offset + 1` of an enclosing sequence.
    #[doc(hidden)]
    async fn invoke_as_step(
        &self,
        input: Self::Input,
        config: &RunnableConfig,
        offset: usize,
    ) -> Result<Self::Output> {
        let config = config.tagged(step_tag(offset));
        self.invoke_as_child(input, &config).await
    }

    /// Transform as step `offset + 1` of an enclosing sequence.
    #[doc(hidden)]
    fn transform_as_step<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
        offset: usize,
    ) -> ChunkStream<'a, Self::Output> {
        self.transform_as_child(input, &config.tagged(step_tag(offset)))
    }
}

pub(crate) fn step_tag(offset: usize) -> String {
    format!("seq:step:{}", offset + 1)
}

/// Type name without module path or generic arguments.
pub fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Shared batch driver: runs `f` over `inputs` with bounded concurrency and
/// returns results in input order.
pub async fn run_batch<I, O, F, Fut>(
    inputs: Vec<I>,
    config: &RunnableConfig,
    options: &BatchOptions,
    f: F,
) -> Result<Vec<Result<O>>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<O>>,
{
    config.ensure_not_cancelled()?;
    let len = inputs.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    let limit = options
        .max_concurrency
        .or(config.max_concurrency)
        .unwrap_or(len)
        .max(1);

    let f = &f;
    let mut pending = futures::stream::iter(inputs.into_iter().enumerate())
        .map(|(index, input)| async move { (index, f(input).await) })
        .buffer_unordered(limit);

    let mut slots: Vec<Option<Result<O>>> = (0..len).map(|_| None).collect();
    config
        .run_cancellable(async {
            while let Some((index, result)) = pending.next().await {
                match result {
                    Err(e) if !options.return_exceptions || e.is_cancelled() => return Err(e),
                    other => slots[index] = Some(other),
                }
            }
            Ok(())
        })
        .await?;

    slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| RunnelError::Other("batch slot left empty".into())))
        .collect()
}

/// Extension trait providing `.pipe()` and friends for composing Runnables.
pub trait RunnableExt: Runnable + Sized {
    /// Compose this Runnable with another, creating a sequence where
    /// the output of `self` feeds into the input of `next`.
    fn pipe<R>(self, next: R) -> RunnableSequence<Self, R>
    where
        R: Runnable<Input = Self::Output>,
    {
        RunnableSequence::new(self, next)
    }

    /// Give this component its own run with the given name and type.
    fn traced(self, name: impl Into<String>, run_type: RunType) -> Traced<Self> {
        Traced::new(self, name, run_type)
    }

    fn boxed(self) -> BoxRunnable<Self::Input, Self::Output>
    where
        Self: 'static,
    {
        Box::new(self)
    }

    fn shared(self) -> ArcRunnable<Self::Input, Self::Output>
    where
        Self: 'static,
    {
        Arc::new(self)
    }
}

impl<T: Runnable + Sized> RunnableExt for T {}

pub type BoxRunnable<I, O> = Box<dyn Runnable<Input = I, Output = O>>;
pub type ArcRunnable<I, O> = Arc<dyn Runnable<Input = I, Output = O>>;

macro_rules! delegate_runnable {
    ($ty:ty) => {
        #[async_trait]
        impl<R: Runnable + ?Sized> Runnable for $ty {
            type Input = R::Input;
            type Output = R::Output;

            fn name(&self) -> String {
                (**self).name()
            }

            fn run_type(&self) -> RunType {
                (**self).run_type()
            }

            async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
                (**self).invoke(input, config).await
            }

            async fn batch_with_options(
                &self,
                inputs: Vec<Self::Input>,
                config: &RunnableConfig,
                options: &BatchOptions,
            ) -> Result<Vec<Result<Self::Output>>> {
                (**self).batch_with_options(inputs, config, options).await
            }

            fn stream<'a>(
                &'a self,
                input: Self::Input,
                config: &RunnableConfig,
            ) -> ChunkStream<'a, Self::Output> {
                (**self).stream(input, config)
            }

            fn transform<'a>(
                &'a self,
                input: ChunkStream<'a, Self::Input>,
                config: &RunnableConfig,
            ) -> ChunkStream<'a, Self::Output> {
                (**self).transform(input, config)
            }

            fn opens_run(&self) -> bool {
                (**self).opens_run()
            }

            fn steps_len(&self) -> usize {
                (**self).steps_len()
            }

            async fn invoke_as_child(
                &self,
                input: Self::Input,
                config: &RunnableConfig,
            ) -> Result<Self::Output> {
                (**self).invoke_as_child(input, config).await
            }

            fn transform_as_child<'a>(
                &'a self,
                input: ChunkStream<'a, Self::Input>,
                config: &RunnableConfig,
            ) -> ChunkStream<'a, Self::Output> {
                (**self).transform_as_child(input, config)
            }

            async fn invoke_as_step(
                &self,
                input: Self::Input,
                config: &RunnableConfig,
                offset: usize,
            ) -> Result<Self::Output> {
                (**self).invoke_as_step(input, config, offset).await
            }

            fn transform_as_step<'a>(
                &'a self,
                input: ChunkStream<'a, Self::Input>,
                config: &RunnableConfig,
                offset: usize,
            ) -> ChunkStream<'a, Self::Output> {
                (**self).transform_as_step(input, config, offset)
            }
        }
    };
}

delegate_runnable!(Box<R>);
delegate_runnable!(Arc<R>);

/// A Runnable that passes its input through unchanged, chunk by chunk when
/// transforming.
pub struct RunnablePassthrough<T>(PhantomData<fn() -> T>);

impl<T> RunnablePassthrough<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for RunnablePassthrough<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Chunk> Runnable for RunnablePassthrough<T> {
    type Input = T;
    type Output = T;

    async fn invoke(&self, input: Self::Input, _config: &RunnableConfig) -> Result<Self::Output> {
        Ok(input)
    }

    fn stream<'a>(&'a self, input: T, _config: &RunnableConfig) -> ChunkStream<'a, T> {
        once(input)
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a, T>,
        _config: &RunnableConfig,
    ) -> ChunkStream<'a, T> {
        input
    }
}
