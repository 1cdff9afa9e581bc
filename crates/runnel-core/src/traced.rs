use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;

use crate::callbacks::{CallbackManager, RunManager, RunType};
use crate::chunk::{Chunk, ChunkStream};
use crate::config::RunnableConfig;
use crate::error::{Result, RunnelError};
use crate::runnable::Runnable;

/// Open a run for `name` under `config` and build the config for the work
/// nested inside it.
///
/// Fails with `RecursionLimit` when `config` has no depth left and with
/// `Cancelled` when the signal has already fired; no run is opened then.
/// `input` is only evaluated when someone listens.
pub fn open_run(
    name: impl Into<String>,
    run_type: RunType,
    config: &RunnableConfig,
    input: impl FnOnce() -> Value,
) -> Result<(RunManager, RunnableConfig)> {
    let name = name.into();
    if config.remaining_depth() == 0 {
        return Err(RunnelError::RecursionLimit { name });
    }
    config.ensure_not_cancelled()?;

    let manager = CallbackManager::configure(config);
    let traced_input = if manager.handlers().is_empty() {
        Value::Null
    } else {
        input()
    };
    let run = manager.start_run(
        config.run_name.clone().unwrap_or(name),
        run_type,
        &traced_input,
        config.run_id,
    );
    let child = config.child(run.get_child(None));
    Ok((run, child))
}

/// Run `f` inside a new run named `name`.
///
/// `f` gets a child config whose callbacks are parented to the run, plus the
/// run itself for events such as retries. The run is closed with the output
/// or error; it is aborted if the signal fires while `f` is pending.
pub async fn call_with_run<I, O, F, Fut>(
    name: impl Into<String>,
    run_type: RunType,
    input: I,
    config: &RunnableConfig,
    f: F,
) -> Result<O>
where
    I: Chunk,
    O: Chunk,
    F: FnOnce(I, RunnableConfig, Arc<RunManager>) -> Fut,
    Fut: Future<Output = Result<O>>,
{
    let (run, child) = open_run(name, run_type, config, || input.to_trace())?;
    let run = Arc::new(run);

    match config.run_cancellable(f(input, child, run.clone())).await {
        Ok(output) => {
            if run.has_handlers() {
                run.end(&output.to_trace());
            } else {
                run.end(&Value::Null);
            }
            Ok(output)
        }
        Err(e) => {
            run.fail(&e);
            Err(e)
        }
    }
}

/// [`call_with_run`] for bodies that only need the child config.
pub async fn call_with_config<I, O, F, Fut>(
    name: impl Into<String>,
    run_type: RunType,
    input: I,
    config: &RunnableConfig,
    f: F,
) -> Result<O>
where
    I: Chunk,
    O: Chunk,
    F: FnOnce(I, RunnableConfig) -> Fut,
    Fut: Future<Output = Result<O>>,
{
    call_with_run(name, run_type, input, config, |input, child, _run| f(input, child)).await
}

/// Streaming counterpart of [`call_with_run`].
///
/// `input` is the traced input when known up front; transforms whose input
/// is itself a stream pass `None`. Every chunk `f`'s stream yields is
/// reported through `on_chunk`, and the run ends with the concatenation of
/// all chunks. Dropping the returned stream early aborts the run.
pub fn transform_with_run<'a, O, F>(
    name: impl Into<String>,
    run_type: RunType,
    input: Option<Value>,
    config: &RunnableConfig,
    f: F,
) -> ChunkStream<'a, O>
where
    O: Chunk,
    F: FnOnce(RunnableConfig, Arc<RunManager>) -> ChunkStream<'a, O> + Send + 'a,
{
    let name = name.into();
    let config = config.clone();
    Box::pin(async_stream::stream! {
        let (run, child) = match open_run(name, run_type, &config, || input.unwrap_or(Value::Null)) {
            Ok(opened) => opened,
            Err(e) => {
                yield Err(e);
                return;
            }
        };
        let run = Arc::new(run);
        let mut inner = f(child, run.clone());
        let mut collected: Option<O> = None;

        loop {
            let next = match &config.signal {
                Some(signal) => tokio::select! {
                    biased;
                    _ = signal.cancelled() => Some(Err(RunnelError::Cancelled)),
                    next = inner.next() => next,
                },
                None => inner.next().await,
            };
            match next {
                None => break,
                Some(Ok(chunk)) => {
                    if run.has_handlers() {
                        run.on_chunk(&chunk.to_trace());
                        collected = Some(match collected.take() {
                            Some(acc) => acc.concat(chunk.clone()).unwrap_or_else(|_| chunk.clone()),
                            None => chunk.clone(),
                        });
                    }
                    yield Ok(chunk);
                }
                Some(Err(e)) => {
                    drop(inner);
                    run.fail(&e);
                    yield Err(e);
                    return;
                }
            }
        }

        let output = collected.map(|c| c.to_trace()).unwrap_or(Value::Null);
        run.end(&output);
    })
}

/// [`transform_with_run`] for bodies that only need the child config.
pub fn transform_with_config<'a, O, F>(
    name: impl Into<String>,
    run_type: RunType,
    input: Option<Value>,
    config: &RunnableConfig,
    f: F,
) -> ChunkStream<'a, O>
where
    O: Chunk,
    F: FnOnce(RunnableConfig) -> ChunkStream<'a, O> + Send + 'a,
{
    transform_with_run(name, run_type, input, config, move |child, _run| f(child))
}

/// Gives a leaf runnable its own run with a chosen name and run type.
///
/// Built with [`RunnableExt::traced`](crate::runnable::RunnableExt::traced).
pub struct Traced<R> {
    inner: R,
    name: String,
    run_type: RunType,
}

impl<R> Traced<R> {
    pub fn new(inner: R, name: impl Into<String>, run_type: RunType) -> Self {
        Self {
            inner,
            name: name.into(),
            run_type,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: Runnable> Runnable for Traced<R> {
    type Input = R::Input;
    type Output = R::Output;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn run_type(&self) -> RunType {
        self.run_type
    }

    fn opens_run(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_config(
            self.name.clone(),
            self.run_type,
            input,
            config,
            |input, child| async move { self.inner.invoke(input, &child).await },
        )
        .await
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        let traced_input = input.to_trace();
        transform_with_config(
            self.name.clone(),
            self.run_type,
            Some(traced_input),
            config,
            move |child| self.inner.stream(input, &child),
        )
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        transform_with_config(
            self.name.clone(),
            self.run_type,
            None,
            config,
            move |child| self.inner.transform(input, &child),
        )
    }
}
