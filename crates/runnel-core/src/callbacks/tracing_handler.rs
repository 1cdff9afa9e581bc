use serde_json::Value;

use crate::error::RunnelError;

use super::handler::CallbackHandler;
use super::run::RunInfo;

/// Forwards run lifecycle events to the `tracing` ecosystem.
///
/// Events are emitted under the `runnel::run` target. Chunk events are
/// logged at `TRACE`, everything else at `DEBUG` or above.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHandler {
    /// Include serialized inputs and outputs in the events.
    pub log_payloads: bool,
}

impl TracingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payloads(mut self) -> Self {
        self.log_payloads = true;
        self
    }
}

impl CallbackHandler for TracingHandler {
    fn on_start(&self, run: &RunInfo, input: &Value) {
        if self.log_payloads {
            tracing::debug!(
                target: "runnel::run",
                run_id = %run.run_id,
                parent_run_id = ?run.parent_run_id,
                run_type = %run.run_type,
                tags = ?run.tags,
                input = %input,
                "[{}] start",
                run.name
            );
        } else {
            tracing::debug!(
                target: "runnel::run",
                run_id = %run.run_id,
                parent_run_id = ?run.parent_run_id,
                run_type = %run.run_type,
                tags = ?run.tags,
                "[{}] start",
                run.name
            );
        }
    }

    fn on_end(&self, run: &RunInfo, output: &Value) {
        let elapsed_ms = (chrono::Utc::now() - run.start_time).num_milliseconds();
        if self.log_payloads {
            tracing::debug!(
                target: "runnel::run",
                run_id = %run.run_id,
                elapsed_ms,
                output = %output,
                "[{}] end",
                run.name
            );
        } else {
            tracing::debug!(target: "runnel::run", run_id = %run.run_id, elapsed_ms, "[{}] end", run.name);
        }
    }

    fn on_error(&self, run: &RunInfo, error: &RunnelError) {
        tracing::warn!(
            target: "runnel::run",
            run_id = %run.run_id,
            error = %error,
            "[{}] error",
            run.name
        );
    }

    fn on_chunk(&self, run: &RunInfo, chunk: &Value) {
        tracing::trace!(target: "runnel::run", run_id = %run.run_id, chunk = %chunk, "[{}] chunk", run.name);
    }

    fn on_retry(&self, run: &RunInfo, attempt: usize, error: &RunnelError) {
        tracing::info!(
            target: "runnel::run",
            run_id = %run.run_id,
            attempt,
            error = %error,
            "[{}] retry",
            run.name
        );
    }

    fn on_abort(&self, run: &RunInfo) {
        tracing::warn!(target: "runnel::run", run_id = %run.run_id, "[{}] aborted", run.name);
    }
}
