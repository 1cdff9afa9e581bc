use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use runnel_core::caller::AsyncCaller;
use runnel_core::callbacks::RunType;
use runnel_core::chunk::{Chunk, ChunkStream};
use runnel_core::config::RunnableConfig;
use runnel_core::error::{ModelError, Result};
use runnel_core::runnable::Runnable;
use runnel_core::traced::{call_with_config, transform_with_config};

enum Script {
    Responses(Vec<String>),
    Echo,
}

/// A mock chat model that returns preset responses and tracks call counts.
///
/// Every provider call goes through an [`AsyncCaller`], so the mock obeys
/// the caller's concurrency limit and retries the transient failures
/// scripted with [`with_transient_failures`](Self::with_transient_failures).
/// A `stop` call option (a string or an array of strings) truncates the
/// response before the first stop sequence. Streaming yields one chunk per
/// character.
pub struct MockChatModel {
    script: Script,
    caller: AsyncCaller,
    latency: Option<Duration>,
    failures: AtomicUsize,
    call_count: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockChatModel {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            caller: AsyncCaller::default(),
            latency: None,
            failures: AtomicUsize::new(0),
            call_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a `MockChatModel` that cycles through the given responses.
    pub fn new(responses: Vec<String>) -> Self {
        Self::with_script(Script::Responses(responses))
    }

    /// Create a `MockChatModel` that always returns the same response.
    pub fn with_response(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// A model that answers with its prompt.
    pub fn echo() -> Self {
        Self::with_script(Script::Echo)
    }

    pub fn with_caller(mut self, caller: AsyncCaller) -> Self {
        self.caller = caller;
        self
    }

    /// Delay every provider call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `n` provider calls with a transient API error.
    pub fn with_transient_failures(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// Get the number of provider calls made, retries included.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Most provider calls seen in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn generate(&self, prompt: &str, config: &RunnableConfig) -> Result<String> {
        let text = self
            .caller
            .call_with_signal(config.signal.as_ref(), || self.complete_once(prompt))
            .await?;
        Ok(apply_stop(text, config.call_options.get("stop")))
    }

    async fn complete_once(&self, prompt: &str) -> Result<String> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ModelError::ApiRequest(format!("scripted failure on call {}", idx + 1)).into());
        }

        match &self.script {
            Script::Echo => Ok(prompt.to_string()),
            Script::Responses(responses) if responses.is_empty() => {
                Err(ModelError::InvalidResponse("no scripted responses".into()).into())
            }
            Script::Responses(responses) => Ok(responses[idx % responses.len()].clone()),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn apply_stop(mut text: String, stop: Option<&Value>) -> String {
    let sequences: Vec<&str> = match stop {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    let cut = sequences
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s))
        .min();
    if let Some(cut) = cut {
        text.truncate(cut);
    }
    text
}

#[async_trait]
impl Runnable for MockChatModel {
    type Input = String;
    type Output = String;

    fn name(&self) -> String {
        "MockChatModel".into()
    }

    fn run_type(&self) -> RunType {
        RunType::Llm
    }

    fn opens_run(&self) -> bool {
        true
    }

    async fn invoke(&self, input: Self::Input, config: &RunnableConfig) -> Result<Self::Output> {
        call_with_config(self.name(), RunType::Llm, input, config, |input, child| async move {
            self.generate(&input, &child).await
        })
        .await
    }

    fn stream<'a>(
        &'a self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> ChunkStream<'a, Self::Output> {
        let traced_input = input.to_trace();
        transform_with_config(self.name(), RunType::Llm, Some(traced_input), config, move |child| {
            Box::pin(async_stream::stream! {
                match self.generate(&input, &child).await {
                    Ok(text) => {
                        for ch in text.chars() {
                            yield Ok(ch.to_string());
                        }
                    }
                    Err(e) => yield Err(e),
                }
            })
        })
    }
}
