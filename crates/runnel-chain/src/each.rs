use async_trait::async_trait;

use runnel_core::config::RunnableConfig;
use runnel_core::error::Result;
use runnel_core::runnable::{run_batch, BatchOptions, Runnable};
use runnel_core::traced::call_with_config;

/// Maps a Runnable over every element of a `Vec` input.
///
/// Elements run as a batch under one run, so `max_concurrency` applies and
/// the output keeps the input order.
pub struct RunnableEach<R> {
    inner: R,
}

impl<R: Runnable> RunnableEach<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: Runnable> Runnable for RunnableEach<R> {
    type Input = Vec<R::Input>;
    type Output = Vec<R::Output>;

    fn name(&self) -> String {
        format!("RunnableEach<{}>", self.inner.name())
    }

    fn opens_run(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_config(self.name(), self.inner.run_type(), input, config, |inputs, child| async move {
            run_batch(inputs, &child, &BatchOptions::default(), |item| {
                self.inner.invoke_as_child(item, &child)
            })
            .await?
            .into_iter()
            .collect()
        })
        .await
    }
}
