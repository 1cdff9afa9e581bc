use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use runnel_core::callbacks::RunType;
use runnel_core::chunk::Chunk;
use runnel_core::config::RunnableConfig;
use runnel_core::error::Result;
use runnel_core::runnable::Runnable;
use runnel_core::traced::call_with_config;

type AsyncFn<I, O> =
    dyn Fn(I, RunnableConfig) -> Pin<Box<dyn Future<Output = Result<O>> + Send>> + Send + Sync;

/// A Runnable that wraps an async closure.
///
/// Every call opens a run. The closure receives the child config of that
/// run, so runnables it invokes nest underneath.
pub struct RunnableLambda<I, O> {
    func: Arc<AsyncFn<I, O>>,
    name: Option<String>,
    run_type: RunType,
}

impl<I, O> Clone for RunnableLambda<I, O> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
            name: self.name.clone(),
            run_type: self.run_type,
        }
    }
}

impl<I, O> RunnableLambda<I, O>
where
    I: Chunk,
    O: Chunk,
{
    /// Create a new `RunnableLambda` from an async function.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(I, RunnableConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |input, config| Box::pin(func(input, config))),
            name: None,
            run_type: RunType::Chain,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_run_type(mut self, run_type: RunType) -> Self {
        self.run_type = run_type;
        self
    }
}

#[async_trait]
impl<I, O> Runnable for RunnableLambda<I, O>
where
    I: Chunk,
    O: Chunk,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "RunnableLambda".into())
    }

    fn run_type(&self) -> RunType {
        self.run_type
    }

    fn opens_run(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_config(self.name(), self.run_type, input, config, |input, child| {
            (self.func)(input, child)
        })
        .await
    }
}
