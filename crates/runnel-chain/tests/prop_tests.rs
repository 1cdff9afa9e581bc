use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::TryStreamExt;
use proptest::prelude::*;
use serde_json::{json, Value};

use runnel_chain::prelude::*;
use runnel_core::backoff::BackoffPolicy;
use runnel_core::callbacks::RunCollector;
use runnel_core::chunk::Chunk;
use runnel_core::config::RunnableConfig;
use runnel_core::error::RunnelError;
use runnel_core::runnable::Runnable;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

/// Fails the first `failures` calls, then echoes its input.
fn flaky(failures: usize, calls: Arc<AtomicUsize>) -> RunnableLambda<i32, i32> {
    RunnableLambda::new(move |x: i32, _| {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < failures {
                Err(RunnelError::Other(format!("failure {}", n + 1)))
            } else {
                Ok(x)
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Property-based tests
// ---------------------------------------------------------------------------

proptest! {
    /// A retried call makes min(failures + 1, max_attempts) attempts and
    /// succeeds exactly when failures < max_attempts.
    #[test]
    fn retry_attempt_count(failures in 0usize..8, max_attempts in 1usize..6) {
        let rt = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let collector = Arc::new(RunCollector::new());
        let config = RunnableConfig::new().with_handler(collector.clone());
        let retry = flaky(failures, calls.clone()).with_retry(
            RetryConfig::new()
                .with_max_attempt_number(max_attempts)
                .with_backoff(BackoffPolicy::none()),
        );

        let result = rt.block_on(retry.invoke(5, &config));
        let expected_attempts = (failures + 1).min(max_attempts);
        prop_assert_eq!(calls.load(Ordering::SeqCst), expected_attempts);
        prop_assert_eq!(result.is_ok(), failures < max_attempts);

        let root = collector.roots().remove(0);
        prop_assert_eq!(collector.children(root.run_id).len(), expected_attempts);
        prop_assert_eq!(root.retries, expected_attempts - 1);
    }

    /// Fallbacks return the output of the first alternative that succeeds
    /// and never touch the ones after it.
    #[test]
    fn fallbacks_stop_at_first_success(pattern in prop::collection::vec(any::<bool>(), 1..6)) {
        let rt = runtime();
        let counters: Vec<Arc<AtomicUsize>> =
            pattern.iter().map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let alternatives: Vec<RunnableLambda<i32, i32>> = pattern
            .iter()
            .zip(&counters)
            .enumerate()
            .map(|(i, (&ok, counter))| {
                let counter = counter.clone();
                RunnableLambda::new(move |_x: i32, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if ok {
                            Ok(i as i32)
                        } else {
                            Err(RunnelError::Other(format!("alternative {i} failed")))
                        }
                    }
                })
            })
            .collect();
        let mut alternatives = alternatives.into_iter();
        let primary = alternatives.next().unwrap();
        let chain = primary.with_fallbacks(alternatives);

        let result = rt.block_on(chain.invoke(0, &RunnableConfig::default()));
        match pattern.iter().position(|ok| *ok) {
            Some(winner) => {
                prop_assert_eq!(result.unwrap(), winner as i32);
                for (i, counter) in counters.iter().enumerate() {
                    prop_assert_eq!(counter.load(Ordering::SeqCst), usize::from(i <= winner));
                }
            }
            None => match result {
                Err(RunnelError::FallbacksExhausted { prior, .. }) => {
                    prop_assert_eq!(prior.len(), pattern.len() - 1);
                }
                other => prop_assert!(false, "unexpected result: {:?}", other),
            },
        }
    }

    /// Concatenating the streamed `{key: chunk}` partials of a map gives the
    /// same object as invoking it.
    #[test]
    fn parallel_stream_concat_matches_invoke(
        words in prop::collection::vec("[a-z]{1,6}", 1..4),
        text in "[a-z ]{1,12}",
    ) {
        let rt = runtime();
        let mut map = RunnableParallel::new();
        for (i, word) in words.iter().enumerate() {
            let word = word.clone();
            map = map.with_branch(
                format!("k{i}"),
                RunnableLambda::new(move |s: String, _| {
                    let word = word.clone();
                    async move { Ok(format!("{word}:{s}")) }
                }),
            );
        }
        map = map.with_branch("model", MockChatModel::echo());

        let config = RunnableConfig::default();
        let invoked = rt.block_on(map.invoke(text.clone(), &config)).unwrap();
        let chunks: Vec<Value> = rt
            .block_on(map.stream(text.clone(), &config).try_collect())
            .unwrap();
        let merged = chunks
            .into_iter()
            .try_fold(json!({}), |acc, chunk| acc.concat(chunk))
            .unwrap();
        prop_assert_eq!(merged, invoked);
    }

    /// Bound call options always win over the caller's.
    #[test]
    fn bound_options_override_caller(bound in "[a-z]{1,5}", caller in "[a-z]{1,5}") {
        let rt = runtime();
        let echo = RunnableLambda::new(|_x: i32, config: RunnableConfig| async move {
            Ok(config.call_options.get("mode").cloned().unwrap_or(Value::Null))
        });
        let binding = echo.bind("mode", json!(bound.clone()));
        let config = RunnableConfig::new().with_call_option("mode", json!(caller));
        let seen = rt.block_on(binding.invoke(0, &config)).unwrap();
        prop_assert_eq!(seen, json!(bound));
    }
}
