use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde_json::{Map, Value};

use runnel_core::callbacks::RunType;
use runnel_core::chunk::{once, Chunk, ChunkStream};
use runnel_core::config::RunnableConfig;
use runnel_core::error::{Result, RunnelError};
use runnel_core::runnable::{BoxRunnable, Runnable};
use runnel_core::traced::{call_with_config, transform_with_config};

/// Runs several branches on the same input and collects their outputs into
/// a JSON object keyed by branch name.
///
/// Branch outputs are serialized with `serde_json`, so branches of
/// different output types can live in one map.
pub struct RunnableParallel<I> {
    branches: Vec<(String, BoxRunnable<I, Value>)>,
    name: Option<String>,
}

impl<I: Chunk> Default for RunnableParallel<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Chunk> RunnableParallel<I> {
    pub fn new() -> Self {
        Self {
            branches: Vec::new(),
            name: None,
        }
    }

    /// Add a branch. A branch with the same key is replaced.
    pub fn with_branch<R>(mut self, key: impl Into<String>, branch: R) -> Self
    where
        R: Runnable<Input = I> + 'static,
    {
        let key = key.into();
        let branch: BoxRunnable<I, Value> = Box::new(IntoValue(branch));
        match self.branches.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = branch,
            None => self.branches.push((key, branch)),
        }
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(|(k, _)| k.as_str())
    }

    fn branch_tag(key: &str) -> String {
        format!("map:key:{key}")
    }

    /// Feeds every input chunk to each branch and interleaves their output
    /// as `{key: chunk}` objects.
    fn tee<'a>(&'a self, input: ChunkStream<'a, I>, child: RunnableConfig) -> ChunkStream<'a, Value> {
        let mut senders = Vec::with_capacity(self.branches.len());
        let mut outputs: Vec<BoxStream<'a, Result<Value>>> =
            Vec::with_capacity(self.branches.len() + 1);

        for (key, branch) in &self.branches {
            let (tx, rx) = mpsc::unbounded::<Result<I>>();
            senders.push(tx);
            let key = key.clone();
            let step_config = child.tagged(Self::branch_tag(&key));
            let output = branch
                .transform_as_child(rx.boxed(), &step_config)
                .map(move |item| {
                    item.map(|chunk| {
                        let mut partial = Map::new();
                        partial.insert(key.clone(), chunk);
                        Value::Object(partial)
                    })
                });
            outputs.push(output.boxed());
        }

        // Senders are dropped once upstream ends, closing every branch input.
        // An upstream error reaches every branch first, so none of them
        // mistakes a truncated input for a complete one.
        let pump = stream::unfold(Some((input, senders)), |state| async move {
            let (mut input, senders) = state?;
            match input.next().await? {
                Ok(chunk) => {
                    for tx in &senders {
                        let _ = tx.unbounded_send(Ok(chunk.clone()));
                    }
                    Some((None, Some((input, senders))))
                }
                Err(e) => {
                    for tx in &senders {
                        let _ = tx.unbounded_send(Err(upstream_failure(&e)));
                    }
                    Some((Some(Err::<Value, _>(e)), None))
                }
            }
        })
        .filter_map(futures::future::ready);
        outputs.push(pump.boxed());

        stream::select_all(outputs).boxed()
    }
}

#[async_trait]
impl<I: Chunk> Runnable for RunnableParallel<I> {
    type Input = I;
    type Output = Value;

    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            let keys: Vec<_> = self.keys().collect();
            format!("RunnableParallel<{}>", keys.join(","))
        })
    }

    fn opens_run(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_config(self.name(), RunType::Chain, input, config, |input, child| async move {
            let limit = child.max_concurrency.unwrap_or(self.branches.len()).max(1);
            let calls: Vec<_> = self
                .branches
                .iter()
                .map(|(key, branch)| {
                    let step_config = child.tagged(Self::branch_tag(key));
                    let input = input.clone();
                    let key = key.clone();
                    async move {
                        let output = branch.invoke_as_child(input, &step_config).await?;
                        Ok::<_, RunnelError>((key, output))
                    }
                })
                .collect();
            let outputs: Vec<(String, Value)> = stream::iter(calls)
                .buffer_unordered(limit)
                .try_collect()
                .await?;
            Ok(Value::Object(outputs.into_iter().collect()))
        })
        .await
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        let traced_input = input.to_trace();
        transform_with_config(self.name(), RunType::Chain, Some(traced_input), config, move |child| {
            self.tee(once(input), child)
        })
    }

    /// Every branch consumes the input concurrently, so `max_concurrency`
    /// does not apply here.
    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        transform_with_config(self.name(), RunType::Chain, None, config, move |child| {
            self.tee(input, child)
        })
    }
}

/// Copy of an input-stream error for one branch.
fn upstream_failure(error: &RunnelError) -> RunnelError {
    if error.is_cancelled() {
        RunnelError::Cancelled
    } else {
        RunnelError::Other(format!("input stream failed: {error}"))
    }
}

/// Serializes a branch's output so it fits in the aggregate object.
struct IntoValue<R>(R);

#[async_trait]
impl<R: Runnable> Runnable for IntoValue<R> {
    type Input = R::Input;
    type Output = Value;

    fn name(&self) -> String {
        self.0.name()
    }

    fn run_type(&self) -> RunType {
        self.0.run_type()
    }

    fn opens_run(&self) -> bool {
        self.0.opens_run()
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Value> {
        Ok(serde_json::to_value(self.0.invoke(input, config).await?)?)
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Value> {
        to_values(self.0.transform(input, config))
    }

    async fn invoke_as_child(&self, input: Self::Input, config: &RunnableConfig) -> Result<Value> {
        Ok(serde_json::to_value(self.0.invoke_as_child(input, config).await?)?)
    }

    fn transform_as_child<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Value> {
        to_values(self.0.transform_as_child(input, config))
    }
}

fn to_values<'a, T: Chunk>(stream: ChunkStream<'a, T>) -> ChunkStream<'a, Value> {
    stream
        .map(|item| item.and_then(|chunk| Ok(serde_json::to_value(chunk)?)))
        .boxed()
}
