use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of work a run records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Chain,
    Llm,
    Tool,
    Retriever,
    Parser,
    Prompt,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chain => "chain",
            Self::Llm => "llm",
            Self::Tool => "tool",
            Self::Retriever => "retriever",
            Self::Parser => "parser",
            Self::Prompt => "prompt",
        }
    }
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chain" => Ok(Self::Chain),
            "llm" => Ok(Self::Llm),
            "tool" => Ok(Self::Tool),
            "retriever" => Ok(Self::Retriever),
            "parser" => Ok(Self::Parser),
            "prompt" => Ok(Self::Prompt),
            other => Err(format!("unknown run type: '{other}'")),
        }
    }
}

/// Lifecycle state of a run.
///
/// `Pending -> Running -> {Succeeded, Failed, Aborted}`; the three terminal
/// states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, Self::Aborted) => true,
            (Self::Running, Self::Succeeded | Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown run status: '{other}'")),
        }
    }
}

/// Identity of a run as seen by callback handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    /// Id of the root run of the tree this run belongs to.
    pub trace_id: Uuid,
    pub name: String,
    pub run_type: RunType,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, Value>,
    pub start_time: DateTime<Utc>,
}

/// A complete record of one run, as assembled by
/// [`RunCollector`](super::RunCollector).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub trace_id: Uuid,
    pub name: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, Value>,
    pub child_run_ids: Vec<Uuid>,
    /// Streamed chunks reported through `on_chunk`, in arrival order.
    pub chunks: Vec<Value>,
    /// Number of failed attempts reported through `on_retry`.
    pub retries: usize,
}

impl Run {
    pub(crate) fn started(info: &RunInfo, inputs: Value) -> Self {
        Self {
            run_id: info.run_id,
            parent_run_id: info.parent_run_id,
            trace_id: info.trace_id,
            name: info.name.clone(),
            run_type: info.run_type,
            status: RunStatus::Running,
            start_time: info.start_time,
            end_time: None,
            inputs,
            outputs: None,
            error: None,
            tags: info.tags.clone(),
            metadata: info.metadata.clone(),
            child_run_ids: Vec::new(),
            chunks: Vec::new(),
            retries: 0,
        }
    }

    pub fn latency_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}
