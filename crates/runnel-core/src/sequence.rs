use async_trait::async_trait;

use crate::callbacks::RunType;
use crate::chunk::{once, ChunkStream};
use crate::config::RunnableConfig;
use crate::error::Result;
use crate::runnable::Runnable;
use crate::traced::{call_with_config, transform_with_config};

/// A Runnable composed of two sequential Runnables.
///
/// Longer chains are nested pairs, but they trace as one flat sequence: a
/// single run with one child per leaf step, tagged `seq:step:1..N`, no matter
/// how the `pipe` calls were grouped.
pub struct RunnableSequence<A, B> {
    first: A,
    second: B,
    name: Option<String>,
}

impl<A, B> RunnableSequence<A, B>
where
    A: Runnable,
    B: Runnable<Input = A::Output>,
{
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn first(&self) -> &A {
        &self.first
    }

    pub fn second(&self) -> &B {
        &self.second
    }
}

#[async_trait]
impl<A, B> Runnable for RunnableSequence<A, B>
where
    A: Runnable,
    B: Runnable<Input = A::Output>,
{
    type Input = A::Input;
    type Output = B::Output;

    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "RunnableSequence".into())
    }

    fn run_type(&self) -> RunType {
        RunType::Chain
    }

    fn opens_run(&self) -> bool {
        true
    }

    fn steps_len(&self) -> usize {
        self.first.steps_len() + self.second.steps_len()
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_config(self.name(), RunType::Chain, input, config, |input, child| async move {
            self.invoke_as_step(input, &child, 0).await
        })
        .await
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        let traced_input = crate::chunk::Chunk::to_trace(&input);
        transform_with_config(
            self.name(),
            RunType::Chain,
            Some(traced_input),
            config,
            move |child| self.transform_as_step(once(input), &child, 0),
        )
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        transform_with_config(self.name(), RunType::Chain, None, config, move |child| {
            self.transform_as_step(input, &child, 0)
        })
    }

    // Nested sequences splice their steps into the enclosing one.

    async fn invoke_as_step(
        &self,
        input: Self::Input,
        config: &RunnableConfig,
        offset: usize,
    ) -> Result<Self::Output> {
        let mid = self.first.invoke_as_step(input, config, offset).await?;
        config.ensure_not_cancelled()?;
        self.second
            .invoke_as_step(mid, config, offset + self.first.steps_len())
            .await
    }

    fn transform_as_step<'a>(
        &'a self,
        input: ChunkStream<'a, Self::Input>,
        config: &RunnableConfig,
        offset: usize,
    ) -> ChunkStream<'a, Self::Output> {
        let upstream = self.first.transform_as_step(input, config, offset);
        self.second
            .transform_as_step(upstream, config, offset + self.first.steps_len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;

    use super::*;
    use crate::callbacks::{RunCollector, RunStatus};
    use crate::chunk::collect_chunks;
    use crate::error::RunnelError;
    use crate::runnable::{RunnableExt, RunnablePassthrough};

    struct AddOne;

    #[async_trait]
    impl Runnable for AddOne {
        type Input = i32;
        type Output = i32;

        async fn invoke(&self, input: i32, _config: &RunnableConfig) -> Result<i32> {
            Ok(input + 1)
        }
    }

    struct MultiplyTwo;

    #[async_trait]
    impl Runnable for MultiplyTwo {
        type Input = i32;
        type Output = i32;

        async fn invoke(&self, input: i32, _config: &RunnableConfig) -> Result<i32> {
            Ok(input * 2)
        }
    }

    struct FailRunnable;

    #[async_trait]
    impl Runnable for FailRunnable {
        type Input = i32;
        type Output = i32;

        async fn invoke(&self, _input: i32, _config: &RunnableConfig) -> Result<i32> {
            Err(RunnelError::Other("intentional failure".into()))
        }
    }

    struct ToText;

    #[async_trait]
    impl Runnable for ToText {
        type Input = i32;
        type Output = String;

        async fn invoke(&self, input: i32, _config: &RunnableConfig) -> Result<String> {
            Ok(input.to_string())
        }
    }

    /// Streams each character of its input separately.
    struct Spell;

    #[async_trait]
    impl Runnable for Spell {
        type Input = String;
        type Output = String;

        async fn invoke(&self, input: String, _config: &RunnableConfig) -> Result<String> {
            Ok(input)
        }

        fn stream<'a>(&'a self, input: String, _config: &RunnableConfig) -> ChunkStream<'a, String> {
            let chunks: Vec<Result<String>> = input.chars().map(|c| Ok(c.to_string())).collect();
            futures::stream::iter(chunks).boxed()
        }
    }

    fn collecting() -> (Arc<RunCollector>, RunnableConfig) {
        let collector = Arc::new(RunCollector::new());
        let config = RunnableConfig::new().with_handler(collector.clone());
        (collector, config)
    }

    #[tokio::test]
    async fn pipe_two_runnables() {
        let chain = AddOne.pipe(MultiplyTwo);
        let config = RunnableConfig::default();
        // (5 + 1) * 2 = 12
        assert_eq!(chain.invoke(5, &config).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn pipe_with_type_change() {
        let chain = AddOne.pipe(ToText);
        let config = RunnableConfig::default();
        assert_eq!(chain.invoke(9, &config).await.unwrap(), "10");
    }

    #[tokio::test]
    async fn error_is_recorded_on_failing_step_and_sequence() {
        let (collector, config) = collecting();
        let chain = AddOne.pipe(FailRunnable).pipe(MultiplyTwo);
        let err = chain.invoke(5, &config).await.unwrap_err();
        assert_eq!(err.to_string(), "intentional failure");

        let runs = collector.runs();
        // sequence + two steps; the third never starts
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[1].status, RunStatus::Succeeded);
        assert_eq!(runs[2].name, "FailRunnable");
        assert_eq!(runs[2].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn steps_are_tagged_children() {
        let (collector, config) = collecting();
        let chain = AddOne.pipe(MultiplyTwo).pipe(AddOne);
        assert_eq!(chain.steps_len(), 3);
        chain.invoke(1, &config).await.unwrap();

        let root = collector.roots().remove(0);
        assert_eq!(root.name, "RunnableSequence");
        let children = collector.children(root.run_id);
        assert_eq!(children.len(), 3);
        for (i, child) in children.iter().enumerate() {
            assert!(child.tags.contains(&format!("seq:step:{}", i + 1)));
        }
    }

    #[tokio::test]
    async fn grouping_does_not_change_trace_shape() {
        let (left_collector, left_config) = collecting();
        let left = AddOne.pipe(MultiplyTwo).pipe(AddOne);
        let (right_collector, right_config) = collecting();
        let right = AddOne.pipe(MultiplyTwo.pipe(AddOne));

        assert_eq!(
            left.invoke(3, &left_config).await.unwrap(),
            right.invoke(3, &right_config).await.unwrap()
        );

        let shape = |collector: &RunCollector| {
            collector
                .runs()
                .iter()
                .map(|r| (r.name.clone(), r.tags.clone(), r.parent_run_id.is_some()))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&left_collector), shape(&right_collector));
        assert_eq!(left_collector.depth(), 2);
    }

    #[tokio::test]
    async fn step_tags_are_not_inherited_by_grandchildren() {
        let (collector, config) = collecting();
        let inner = AddOne.traced("inner", RunType::Tool);
        let outer = inner.traced("outer", RunType::Chain);
        let chain = AddOne.pipe(outer);
        chain.invoke(1, &config).await.unwrap();

        let outer_run = collector.find_by_name("outer").remove(0);
        let inner_run = collector.find_by_name("inner").remove(0);
        assert!(outer_run.tags.contains(&"seq:step:2".to_string()));
        assert!(!inner_run.tags.iter().any(|t| t.starts_with("seq:step")));
    }

    #[tokio::test]
    async fn stream_flows_through_incremental_steps() {
        let (collector, config) = collecting();
        let chain = AddOne
            .pipe(ToText)
            .pipe(RunnablePassthrough::new())
            .with_name("digits");
        let chunks: Vec<_> = chain.stream(41, &config).collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(*chunks[0].as_ref().unwrap(), "42");

        let root = collector.roots().remove(0);
        assert_eq!(root.name, "digits");
        assert_eq!(root.inputs, serde_json::json!(41));
        assert_eq!(root.outputs, Some(serde_json::json!("42")));
        assert_eq!(collector.children(root.run_id).len(), 3);
    }

    #[tokio::test]
    async fn streaming_last_step_emits_many_chunks() {
        let (_collector, config) = collecting();
        let chain = AddOne.pipe(ToText).pipe(Spell);
        let chunks: Vec<String> = chain
            .stream(122, &config)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["1", "2", "3"]);
        let whole = collect_chunks(chain.stream(122, &config)).await.unwrap();
        assert_eq!(whole.as_deref(), Some("123"));
    }

    #[tokio::test]
    async fn recursion_limit_counts_nesting() {
        let chain = AddOne.pipe(MultiplyTwo);
        // the sequence consumes one level, the steps need another
        let config = RunnableConfig::new().with_recursion_limit(1);
        let err = chain.invoke(1, &config).await.unwrap_err();
        assert!(matches!(err, RunnelError::RecursionLimit { .. }));

        let config = RunnableConfig::new().with_recursion_limit(2);
        assert_eq!(chain.invoke(1, &config).await.unwrap(), 4);
    }
}
