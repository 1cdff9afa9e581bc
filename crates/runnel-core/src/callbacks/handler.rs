use serde_json::Value;

use crate::error::RunnelError;

use super::run::RunInfo;

/// Observer of run lifecycle events.
///
/// Every method has an empty default so handlers only implement what they
/// care about. Handlers are called synchronously from the task that drives
/// the run and must not block.
pub trait CallbackHandler: Send + Sync {
    /// A run started. `input` is `null` for transform runs whose input is
    /// still streaming in.
    fn on_start(&self, run: &RunInfo, input: &Value) {
        let _ = (run, input);
    }

    fn on_end(&self, run: &RunInfo, output: &Value) {
        let _ = (run, output);
    }

    fn on_error(&self, run: &RunInfo, error: &RunnelError) {
        let _ = (run, error);
    }

    /// One streamed output chunk (or token, for LLM leaves).
    fn on_chunk(&self, run: &RunInfo, chunk: &Value) {
        let _ = (run, chunk);
    }

    /// Attempt `attempt` (1-based) failed with `error` and will be retried.
    fn on_retry(&self, run: &RunInfo, attempt: usize, error: &RunnelError) {
        let _ = (run, attempt, error);
    }

    /// The run was torn down by cancellation, or abandoned before it closed.
    fn on_abort(&self, run: &RunInfo) {
        let _ = run;
    }
}
