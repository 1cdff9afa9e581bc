use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use runnel_core::backoff::BackoffPolicy;
use runnel_core::callbacks::RunType;
use runnel_core::chunk::{collect_chunks, once, Chunk, ChunkStream};
use runnel_core::config::RunnableConfig;
use runnel_core::error::{Result, RunnelError};
use runnel_core::runnable::{run_batch, BatchOptions, Runnable};
use runnel_core::traced::{call_with_run, open_run, transform_with_run};

use crate::predicate::ErrorPredicate;

/// Settings for [`RunnableRetry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempt_number: usize,
    pub backoff: BackoffPolicy,
    #[serde(skip)]
    pub retry_on: ErrorPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempt_number: 3,
            backoff: BackoffPolicy::default(),
            retry_on: ErrorPredicate::All,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempt_number(mut self, attempts: usize) -> Self {
        self.max_attempt_number = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_on(mut self, predicate: ErrorPredicate) -> Self {
        self.retry_on = predicate;
        self
    }
}

/// Re-runs a Runnable when it fails with a retryable error.
///
/// The wrapper opens its own run and every attempt is a child of it; the
/// second and later attempts are tagged `retry:attempt:N`. Streams are only
/// retried while no chunk has been emitted. Batches retry only the inputs
/// that failed.
pub struct RunnableRetry<R> {
    inner: R,
    config: RetryConfig,
}

impl<R: Runnable> RunnableRetry<R> {
    pub fn new(inner: R, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn attempt_config(child: &RunnableConfig, attempt: usize) -> RunnableConfig {
        if attempt == 1 {
            child.clone()
        } else {
            child.tagged(format!("retry:attempt:{attempt}"))
        }
    }

    fn should_retry(&self, error: &RunnelError, attempt: usize, config: &RunnableConfig) -> bool {
        attempt < self.config.max_attempt_number
            && self.config.retry_on.matches(error)
            && !config.is_cancelled()
    }

    fn retrying_stream<'a>(
        &'a self,
        input: R::Input,
        child: RunnableConfig,
        run: std::sync::Arc<runnel_core::callbacks::RunManager>,
    ) -> ChunkStream<'a, R::Output> {
        Box::pin(async_stream::stream! {
            let mut attempt = 1;
            loop {
                let attempt_config = Self::attempt_config(&child, attempt);
                let mut inner = self.inner.transform_as_child(once(input.clone()), &attempt_config);
                let mut emitted = false;
                let mut failure = None;
                while let Some(item) = inner.next().await {
                    match item {
                        Ok(chunk) => {
                            emitted = true;
                            yield Ok(chunk);
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                drop(inner);

                match failure {
                    None => return,
                    Some(e) if !emitted && self.should_retry(&e, attempt, &child) => {
                        run.on_retry(attempt, &e);
                        if let Err(cancelled) = child.sleep(self.config.backoff.delay(attempt as u32)).await {
                            yield Err(cancelled);
                            return;
                        }
                        attempt += 1;
                    }
                    Some(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl<R: Runnable> Runnable for RunnableRetry<R> {
    type Input = R::Input;
    type Output = R::Output;

    fn name(&self) -> String {
        format!("RunnableRetry<{}>", self.inner.name())
    }

    fn run_type(&self) -> RunType {
        self.inner.run_type()
    }

    fn opens_run(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_run(self.name(), self.run_type(), input, config, |input, child, run| async move {
            let mut attempt = 1;
            loop {
                let attempt_config = Self::attempt_config(&child, attempt);
                match self.inner.invoke_as_child(input.clone(), &attempt_config).await {
                    Ok(output) => return Ok(output),
                    Err(e) if self.should_retry(&e, attempt, &child) => {
                        run.on_retry(attempt, &e);
                        child.sleep(self.config.backoff.delay(attempt as u32)).await?;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await
    }

    async fn batch_with_options(
        &self,
        inputs: Vec<Self::Input>,
        config: &RunnableConfig,
        options: &BatchOptions,
    ) -> Result<Vec<Result<Self::Output>>> {
        let (run, child) = open_run(self.name(), self.run_type(), config, || {
            Value::Array(inputs.iter().map(Chunk::to_trace).collect())
        })?;

        let mut slots: Vec<Option<Result<Self::Output>>> = (0..inputs.len()).map(|_| None).collect();
        let mut pending: Vec<usize> = (0..inputs.len()).collect();
        let per_input = options.clone().with_return_exceptions(true);

        let outcome = child
            .run_cancellable(async {
                let mut attempt = 1;
                while !pending.is_empty() {
                    let attempt_config = Self::attempt_config(&child, attempt);
                    let subset = pending.iter().map(|&i| inputs[i].clone()).collect();
                    let results = run_batch(subset, &attempt_config, &per_input, |input| {
                        self.inner.invoke_as_child(input, &attempt_config)
                    })
                    .await?;

                    let mut failed = Vec::new();
                    for (index, result) in pending.iter().copied().zip(results) {
                        if let Err(e) = &result {
                            if e.is_cancelled() {
                                return Err(RunnelError::Cancelled);
                            }
                            if self.should_retry(e, attempt, &child) {
                                failed.push(index);
                            }
                        }
                        slots[index] = Some(result);
                    }

                    if let Some(Some(Err(e))) = failed.first().map(|&i| slots[i].as_ref()) {
                        run.on_retry(attempt, e);
                        child.sleep(self.config.backoff.delay(attempt as u32)).await?;
                    }
                    pending = failed;
                    attempt += 1;
                }
                Ok(())
            })
            .await;

        if let Err(e) = outcome {
            run.fail(&e);
            return Err(e);
        }

        let results: Vec<Result<Self::Output>> = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(RunnelError::Other("batch slot left empty".into()))))
            .collect();

        if !options.return_exceptions {
            if let Some(position) = results.iter().position(|r| r.is_err()) {
                let error = results
                    .into_iter()
                    .nth(position)
                    .and_then(|r| r.err())
                    .unwrap_or_else(|| RunnelError::Other("batch error vanished".into()));
                run.fail(&error);
                return Err(error);
            }
        }

        if run.has_handlers() {
            let traced: Vec<Value> = results
                .iter()
                .map(|r| match r {
                    Ok(v) => v.to_trace(),
                    Err(e) => serde_json::json!({ "error": e.to_string() }),
                })
                .collect();
            run.end(&Value::Array(traced));
        } else {
            run.end(&Value::Null);
        }
        Ok(results)
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        let traced_input = input.to_trace();
        transform_with_run(
            self.name(),
            self.run_type(),
            Some(traced_input),
            config,
            move |child, run| self.retrying_stream(input, child, run),
        )
    }

    /// The input stream cannot be replayed, so it is buffered before the
    /// first attempt.
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
}
