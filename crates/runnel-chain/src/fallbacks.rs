use async_trait::async_trait;
use futures::StreamExt;

use runnel_core::callbacks::RunType;
use runnel_core::chunk::{collect_chunks, once, Chunk, ChunkStream};
use runnel_core::config::RunnableConfig;
use runnel_core::error::{Result, RunnelError};
use runnel_core::runnable::{BoxRunnable, Runnable};
use runnel_core::traced::{call_with_config, transform_with_config};

use crate::predicate::ErrorPredicate;

/// Tries a primary Runnable, then each fallback in order, on the same input.
///
/// Returns the first success. Every attempt is a child run of the wrapper's
/// run. Errors the predicate rejects, cancellation included, are returned
/// as-is without trying further alternatives. When every alternative fails
/// the result is [`RunnelError::FallbacksExhausted`].
pub struct RunnableWithFallbacks<I, O> {
    runnables: Vec<BoxRunnable<I, O>>,
    handle: ErrorPredicate,
    name: Option<String>,
}

impl<I: Chunk, O: Chunk> RunnableWithFallbacks<I, O> {
    pub fn new<R>(primary: R) -> Self
    where
        R: Runnable<Input = I, Output = O> + 'static,
    {
        Self {
            runnables: vec![Box::new(primary)],
            handle: ErrorPredicate::All,
            name: None,
        }
    }

    pub fn with_fallback<R>(mut self, fallback: R) -> Self
    where
        R: Runnable<Input = I, Output = O> + 'static,
    {
        self.runnables.push(Box::new(fallback));
        self
    }

    /// Only errors matching `predicate` move on to the next alternative.
    pub fn handle(mut self, predicate: ErrorPredicate) -> Self {
        self.handle = predicate;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn len(&self) -> usize {
        self.runnables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runnables.is_empty()
    }

    fn exhausted(mut errors: Vec<RunnelError>) -> RunnelError {
        match errors.pop() {
            Some(last) => RunnelError::FallbacksExhausted {
                last: Box::new(last),
                prior: errors,
            },
            None => RunnelError::Other("no alternatives to try".into()),
        }
    }

    fn stream_alternatives<'a>(&'a self, input: I, child: RunnableConfig) -> ChunkStream<'a, O> {
        Box::pin(async_stream::stream! {
            let mut errors = Vec::new();
            for runnable in &self.runnables {
                if let Err(e) = child.ensure_not_cancelled() {
                    yield Err(e);
                    return;
                }
                let mut attempt = runnable.transform_as_child(once(input.clone()), &child);
                match attempt.next().await {
                    None => return,
                    Some(Ok(first)) => {
                        yield Ok(first);
                        while let Some(item) = attempt.next().await {
                            yield item;
                        }
                        return;
                    }
                    Some(Err(e)) if self.handle.matches(&e) => errors.push(e),
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            yield Err(Self::exhausted(errors));
        })
    }
}

#[async_trait]
impl<I: Chunk, O: Chunk> Runnable for RunnableWithFallbacks<I, O> {
    type Input = I;
    type Output = O;

    fn name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.runnables.first().map(|r| r.name()))
            .unwrap_or_else(|| "RunnableWithFallbacks".into())
    }

    fn run_type(&self) -> RunType {
        self.runnables
            .first()
            .map(|r| r.run_type())
            .unwrap_or(RunType::Chain)
    }

    fn opens_run(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_config(self.name(), self.run_type(), input, config, |input, child| async move {
            let mut errors = Vec::new();
            for runnable in &self.runnables {
                child.ensure_not_cancelled()?;
                match runnable.invoke_as_child(input.clone(), &child).await {
                    Ok(output) => return Ok(output),
                    Err(e) if self.handle.matches(&e) => {
                        tracing::debug!(error = %e, "alternative failed, trying next");
                        errors.push(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(Self::exhausted(errors))
        })
        .await
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        let traced_input = input.to_trace();
        transform_with_config(
            self.name(),
            self.run_type(),
            Some(traced_input),
            config,
            move |child| self.stream_alternatives(input, child),
        )
    }

    /// Buffers the input so every alternative can see all of it.
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

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::lambda::RunnableLambda;
    use crate::ChainExt;
    use runnel_core::callbacks::{RunCollector, RunStatus};
    use runnel_core::error::ChainError;
    use runnel_core::runnable::BatchOptions;
    use runnel_core::prelude::CancellationToken;

    fn failing(name: &str, message: &'static str) -> RunnableLambda<String, String> {
        RunnableLambda::new(move |_s: String, _| async move {
            Err::<String, _>(RunnelError::Other(message.into()))
        })
        .with_name(name)
    }

    fn upper(name: &str) -> RunnableLambda<String, String> {
        RunnableLambda::new(|s: String, _| async move { Ok(s.to_uppercase()) }).with_name(name)
    }

    #[tokio::test]
    async fn primary_success_skips_fallbacks() {
        let collector = Arc::new(RunCollector::new());
        let config = RunnableConfig::new().with_handler(collector.clone());
        let chain = upper("primary").with_fallbacks([upper("backup")]);
        assert_eq!(chain.invoke("hi".into(), &config).await.unwrap(), "HI");
        assert!(collector.find_by_name("backup").is_empty());
    }

    #[tokio::test]
    async fn each_attempt_is_a_child_run() {
        let collector = Arc::new(RunCollector::new());
        let config = RunnableConfig::new().with_handler(collector.clone());
        let chain = failing("primary", "boom")
            .with_fallbacks([upper("backup")])
            .with_name("guarded");
        assert_eq!(chain.invoke("hi".into(), &config).await.unwrap(), "HI");

        let root = collector.roots().remove(0);
        assert_eq!(root.name, "guarded");
        assert_eq!(root.status, RunStatus::Succeeded);
        let children = collector.children(root.run_id);
        let names: Vec<_> = children.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["primary", "backup"]);
        assert_eq!(children[0].status, RunStatus::Failed);
        assert_eq!(children[1].status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn all_failing_reports_every_error() {
        let chain = failing("a", "first")
            .with_fallbacks([failing("b", "second"), failing("c", "third")]);
        let err = chain.invoke("x".into(), &RunnableConfig::default()).await.unwrap_err();
        match err {
            RunnelError::FallbacksExhausted { last, prior } => {
                assert_eq!(last.to_string(), "third");
                let prior: Vec<_> = prior.iter().map(|e| e.to_string()).collect();
                assert_eq!(prior, vec!["first", "second"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unhandled_errors_skip_fallbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let backup = RunnableLambda::new(move |s: String, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(s) }
        });
        let chain = failing("primary", "plain failure")
            .with_fallbacks([backup])
            .handle(ErrorPredicate::custom(|e| {
                matches!(e, RunnelError::Chain(ChainError::Parse(_)))
            }));
        let err = chain.invoke("x".into(), &RunnableConfig::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "plain failure");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_never_falls_back() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cancelled = RunnableLambda::new(|_s: String, _| async move {
            Err::<String, _>(RunnelError::Cancelled)
        });
        let backup = RunnableLambda::new(move |s: String, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(s) }
        });
        let chain = cancelled.with_fallbacks([backup]);
        let err = chain.invoke("x".into(), &RunnableConfig::default()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let token = CancellationToken::new();
        token.cancel();
        let config = RunnableConfig::new().with_signal(token);
        let err = upper("p").with_fallbacks([upper("q")]).invoke("x".into(), &config).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn batch_falls_back_per_input() {
        let picky = RunnableLambda::new(|s: String, _| async move {
            if s.starts_with('!') {
                Err(RunnelError::Other("bang".into()))
            } else {
                Ok(s)
            }
        });
        let chain = picky.with_fallbacks([upper("loud")]);
        let out = chain
            .batch(vec!["a".into(), "!b".into(), "c".into()], &RunnableConfig::default())
            .await
            .unwrap();
        assert_eq!(out, vec!["a", "!B", "c"]);

        let all_bad = failing("a", "nope").with_fallbacks([failing("b", "still nope")]);
        let options = BatchOptions::new().with_return_exceptions(true);
        let results = all_bad
            .batch_with_options(vec!["x".into(), "y".into()], &RunnableConfig::default(), &options)
            .await
            .unwrap();
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(RunnelError::FallbacksExhausted { .. }))));
    }

    #[tokio::test]
    async fn stream_falls_back_before_first_chunk() {
        let chain = failing("primary", "boom").with_fallbacks([upper("backup")]);
        let chunks: Vec<_> = chain
            .stream("ok".into(), &RunnableConfig::default())
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap(), "OK");
    }
}
