use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::RunnelError;

use super::handler::CallbackHandler;
use super::run::{Run, RunInfo, RunStatus};

/// Handler that records every run it observes into an in-memory tree.
#[derive(Default)]
pub struct RunCollector {
    runs: Mutex<Vec<Run>>,
}

impl RunCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Run>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, run_id: Uuid, f: impl FnOnce(&mut Run)) {
        let mut runs = self.lock();
        if let Some(run) = runs.iter_mut().find(|r| r.run_id == run_id) {
            f(run);
        }
    }

    /// All runs in start order.
    pub fn runs(&self) -> Vec<Run> {
        self.lock().clone()
    }

    pub fn get(&self, run_id: Uuid) -> Option<Run> {
        self.lock().iter().find(|r| r.run_id == run_id).cloned()
    }

    /// Runs without a parent.
    pub fn roots(&self) -> Vec<Run> {
        self.lock()
            .iter()
            .filter(|r| r.parent_run_id.is_none())
            .cloned()
            .collect()
    }

    /// Direct children of `run_id` in start order.
    pub fn children(&self, run_id: Uuid) -> Vec<Run> {
        self.lock()
            .iter()
            .filter(|r| r.parent_run_id == Some(run_id))
            .cloned()
            .collect()
    }

    pub fn find_by_name(&self, name: &str) -> Vec<Run> {
        self.lock()
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }

    /// Depth of the deepest run; a lone root has depth 1.
    pub fn depth(&self) -> usize {
        let runs = self.lock();
        runs.iter()
            .map(|run| {
                let mut depth = 1;
                let mut parent = run.parent_run_id;
                while let Some(pid) = parent {
                    depth += 1;
                    parent = runs
                        .iter()
                        .find(|r| r.run_id == pid)
                        .and_then(|r| r.parent_run_id);
                }
                depth
            })
            .max()
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl CallbackHandler for RunCollector {
    fn on_start(&self, run: &RunInfo, input: &Value) {
        let mut runs = self.lock();
        if let Some(parent_id) = run.parent_run_id {
            if let Some(parent) = runs.iter_mut().find(|r| r.run_id == parent_id) {
                parent.child_run_ids.push(run.run_id);
            }
        }
        runs.push(Run::started(run, input.clone()));
    }

    fn on_end(&self, run: &RunInfo, output: &Value) {
        self.update(run.run_id, |r| {
            r.status = RunStatus::Succeeded;
            r.outputs = Some(output.clone());
            r.end_time = Some(Utc::now());
        });
    }

    fn on_error(&self, run: &RunInfo, error: &RunnelError) {
        self.update(run.run_id, |r| {
            r.status = RunStatus::Failed;
            r.error = Some(error.to_string());
            r.end_time = Some(Utc::now());
        });
    }

    fn on_chunk(&self, run: &RunInfo, chunk: &Value) {
        self.update(run.run_id, |r| r.chunks.push(chunk.clone()));
    }

    fn on_retry(&self, run: &RunInfo, _attempt: usize, _error: &RunnelError) {
        self.update(run.run_id, |r| r.retries += 1);
    }

    fn on_abort(&self, run: &RunInfo) {
        self.update(run.run_id, |r| {
            r.status = RunStatus::Aborted;
            r.end_time = Some(Utc::now());
        });
    }
}
