//! E2E tests for concurrency limits, retries, fallbacks and cancellation
//! across composed pipelines.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use runnel_chain::prelude::*;
use runnel_core::backoff::BackoffPolicy;
use runnel_core::caller::{AsyncCaller, AsyncCallerConfig};
use runnel_core::callbacks::{RunCollector, RunStatus};
use runnel_core::config::RunnableConfig;
use runnel_core::error::{ModelError, RunnelError};
use runnel_core::prelude::CancellationToken;
use runnel_core::runnable::{BatchOptions, Runnable, RunnableExt};

fn no_retry_caller() -> AsyncCaller {
    AsyncCaller::new(AsyncCallerConfig::new().with_max_retries(0))
}

fn instant_retry(attempts: usize) -> RetryConfig {
    RetryConfig::new()
        .with_max_attempt_number(attempts)
        .with_backoff(BackoffPolicy::none())
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_never_exceeds_max_concurrency() {
    let model = Arc::new(MockChatModel::echo().with_latency(Duration::from_millis(20)));
    let inputs: Vec<String> = (0..10).map(|i| format!("item {i}")).collect();
    let config = RunnableConfig::new().with_max_concurrency(3);

    let out = model.batch(inputs.clone(), &config).await.unwrap();
    assert_eq!(out, inputs);
    assert_eq!(model.peak_concurrency(), 3);
    assert_eq!(model.call_count(), 10);
}

#[tokio::test(start_paused = true)]
async fn caller_budget_is_shared_between_models() {
    let caller = AsyncCaller::new(AsyncCallerConfig::new().with_max_concurrency(2));
    let first = Arc::new(
        MockChatModel::echo()
            .with_caller(caller.clone())
            .with_latency(Duration::from_millis(10)),
    );
    let second = Arc::new(
        MockChatModel::echo()
            .with_caller(caller.clone())
            .with_latency(Duration::from_millis(10)),
    );
    let inputs: Vec<String> = (0..4).map(|i| i.to_string()).collect();
    let config = RunnableConfig::default();

    let (a, b) = tokio::join!(
        first.batch(inputs.clone(), &config),
        second.batch(inputs.clone(), &config)
    );
    assert_eq!(a.unwrap(), inputs);
    assert_eq!(b.unwrap(), inputs);
    assert!(first.peak_concurrency() + second.peak_concurrency() <= 4);
    assert!(first.peak_concurrency() <= 2 && second.peak_concurrency() <= 2);
    assert_eq!(caller.available_permits(), Some(2));
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retry_makes_exactly_max_attempts() {
    let collector = Arc::new(RunCollector::new());
    let config = RunnableConfig::new().with_handler(collector.clone());
    let model = MockChatModel::with_response("never")
        .with_caller(no_retry_caller())
        .with_transient_failures(10);
    let retry = model.with_retry(instant_retry(3));

    let err = retry.invoke("x".into(), &config).await.unwrap_err();
    assert!(matches!(err, RunnelError::Model(ModelError::ApiRequest(_))));

    let root = collector.roots().remove(0);
    assert_eq!(root.status, RunStatus::Failed);
    assert_eq!(root.retries, 2);
    let attempts = collector.children(root.run_id);
    assert_eq!(attempts.len(), 3);
    assert!(attempts[0].tags.is_empty());
    assert_eq!(attempts[1].tags, vec!["retry:attempt:2"]);
    assert_eq!(attempts[2].tags, vec!["retry:attempt:3"]);
    assert!(attempts.iter().all(|r| r.status == RunStatus::Failed));
}

#[tokio::test]
async fn retry_inside_a_sequence_recovers() {
    let model = MockChatModel::with_response("recovered")
        .with_caller(no_retry_caller())
        .with_transient_failures(1);
    let chain = PromptTemplate::from_template("{q}")
        .pipe(model.with_retry(instant_retry(2)))
        .pipe(StringOutputParser);
    let out = chain
        .invoke(json!({"q": "?"}), &RunnableConfig::default())
        .await
        .unwrap();
    assert_eq!(out, "recovered");
}

// ---------------------------------------------------------------------------
// Fallbacks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fallback_model_answers_when_primary_fails() {
    let collector = Arc::new(RunCollector::new());
    let config = RunnableConfig::new().with_handler(collector.clone());
    let primary = MockChatModel::with_response("primary")
        .with_caller(no_retry_caller())
        .with_transient_failures(1);
    let backup = MockChatModel::with_response("backup");
    let chain = primary.with_fallbacks([backup]);

    assert_eq!(chain.invoke("x".into(), &config).await.unwrap(), "backup");

    let root = collector.roots().remove(0);
    let children = collector.children(root.run_id);
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].status, RunStatus::Failed);
    assert_eq!(children[1].status, RunStatus::Succeeded);
    assert_eq!(children[1].outputs, Some(json!("backup")));
}

#[tokio::test]
async fn exhausted_fallbacks_carry_every_error() {
    let failing = |n: usize| {
        MockChatModel::with_response("unused")
            .with_caller(no_retry_caller())
            .with_transient_failures(n)
    };
    let chain = failing(1).with_fallbacks([failing(1), failing(1)]);
    match chain.invoke("x".into(), &RunnableConfig::default()).await {
        Err(RunnelError::FallbacksExhausted { prior, .. }) => assert_eq!(prior.len(), 2),
        other => panic!("unexpected result: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancelling_a_batch_stops_unstarted_inputs() {
    let collector = Arc::new(RunCollector::new());
    let token = CancellationToken::new();
    let config = RunnableConfig::new()
        .with_handler(collector.clone())
        .with_signal(token.clone())
        .with_max_concurrency(2);
    let model = MockChatModel::echo().with_latency(Duration::from_millis(10));
    let inputs: Vec<String> = (0..6).map(|i| i.to_string()).collect();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            token.cancel();
        })
    };
    let err = model.batch(inputs, &config).await.unwrap_err();
    canceller.await.unwrap();

    assert!(err.is_cancelled());
    assert_eq!(model.call_count(), 4);
    let statuses: Vec<_> = collector.runs().iter().map(|r| r.status).collect();
    assert_eq!(statuses.iter().filter(|s| **s == RunStatus::Succeeded).count(), 2);
    assert_eq!(statuses.iter().filter(|s| **s == RunStatus::Aborted).count(), 2);
}

#[tokio::test]
async fn return_exceptions_still_fails_on_cancel() {
    let token = CancellationToken::new();
    token.cancel();
    let config = RunnableConfig::new().with_signal(token);
    let model = MockChatModel::echo();
    let options = BatchOptions::new().with_return_exceptions(true);
    let err = model
        .batch_with_options(vec!["a".into()], &config, &options)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(model.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_stream_aborts_its_runs() {
    let collector = Arc::new(RunCollector::new());
    let token = CancellationToken::new();
    let config = RunnableConfig::new()
        .with_handler(collector.clone())
        .with_signal(token.clone());
    let chain = PromptTemplate::from_template("{q}")
        .pipe(MockChatModel::echo().with_latency(Duration::from_secs(60)));

    let mut stream = chain.stream(json!({"q": "slow"}), &config);
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
    });
    let first = stream.next().await.unwrap();
    assert!(first.unwrap_err().is_cancelled());
    assert!(stream.next().await.is_none());
    drop(stream);
    canceller.await.unwrap();

    let root = collector.roots().remove(0);
    assert_ne!(root.status, RunStatus::Succeeded);
    let model_run = collector.find_by_name("MockChatModel").remove(0);
    assert_eq!(model_run.status, RunStatus::Aborted);
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

#[tokio::test]
async fn default_stream_is_a_single_chunk() {
    let collector = Arc::new(RunCollector::new());
    let config = RunnableConfig::new().with_handler(collector.clone());
    let lambda = RunnableLambda::new(|x: i32, _| async move { Ok(x * 7) });
    let chunks: Vec<_> = lambda.stream(6, &config).collect().await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(*chunks[0].as_ref().unwrap(), 42);
    assert_eq!(collector.runs().len(), 1);
}
