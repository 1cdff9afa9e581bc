use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::config::RunnableConfig;
use crate::error::RunnelError;

use super::handler::CallbackHandler;
use super::run::{RunInfo, RunStatus, RunType};
use super::Callbacks;

struct Node {
    info: Arc<RunInfo>,
    handlers: Vec<Arc<dyn CallbackHandler>>,
    status: RunStatus,
    children: Vec<Uuid>,
}

/// Status book-keeping for every run of one trace.
///
/// Each root run gets a fresh registry that its descendants share, so the
/// nodes go away with the last manager of the trace. Nodes are only ever
/// added or moved forward through the run state machine.
#[derive(Default)]
pub(crate) struct RunRegistry {
    nodes: Mutex<HashMap<Uuid, Node>>,
}

impl RunRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Node>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, info: Arc<RunInfo>, handlers: Vec<Arc<dyn CallbackHandler>>) {
        let mut nodes = self.lock();
        if let Some(parent) = info.parent_run_id.and_then(|id| nodes.get_mut(&id)) {
            parent.children.push(info.run_id);
        }
        nodes.insert(
            info.run_id,
            Node {
                info,
                handlers,
                status: RunStatus::Pending,
                children: Vec::new(),
            },
        );
    }

    /// Move `run_id` to `next` if the state machine allows it.
    fn transition(&self, run_id: Uuid, next: RunStatus) -> bool {
        let mut nodes = self.lock();
        match nodes.get_mut(&run_id) {
            Some(node) if node.status.can_transition_to(next) => {
                node.status = next;
                true
            }
            _ => false,
        }
    }

    fn status(&self, run_id: Uuid) -> Option<RunStatus> {
        self.lock().get(&run_id).map(|n| n.status)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    /// Mark every still-open descendant of `run_id` as aborted and return
    /// them so their handlers can be notified outside the lock.
    fn abort_descendants(&self, run_id: Uuid) -> Vec<(Arc<RunInfo>, Vec<Arc<dyn CallbackHandler>>)> {
        let mut nodes = self.lock();
        let mut aborted = Vec::new();
        let mut stack: Vec<Uuid> = nodes
            .get(&run_id)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if let Some(node) = nodes.get_mut(&id) {
                stack.extend(node.children.iter().copied());
                if node.status.can_transition_to(RunStatus::Aborted) {
                    node.status = RunStatus::Aborted;
                    aborted.push((node.info.clone(), node.handlers.clone()));
                }
            }
        }
        aborted
    }
}

/// Factory for runs at one level of the run tree.
///
/// A manager carries the handlers, tags and metadata that apply to the runs
/// it starts. The inheritable subset is passed on to managers returned by
/// [`RunManager::get_child`]; the local subset applies only at this level.
#[derive(Clone, Default)]
pub struct CallbackManager {
    handlers: Vec<Arc<dyn CallbackHandler>>,
    inheritable_handlers: Vec<Arc<dyn CallbackHandler>>,
    tags: Vec<String>,
    inheritable_tags: Vec<String>,
    metadata: HashMap<String, Value>,
    inheritable_metadata: HashMap<String, Value>,
    parent_run_id: Option<Uuid>,
    trace_id: Option<Uuid>,
    /// Set only on managers nested under a run.
    registry: Option<Arc<RunRegistry>>,
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackManager")
            .field("handlers", &self.handlers.len())
            .field("tags", &self.tags)
            .field("parent_run_id", &self.parent_run_id)
            .finish()
    }
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the manager for a call from its config: the configured manager
    /// (or handler list) extended with the config's tags and metadata.
    pub fn configure(config: &RunnableConfig) -> Self {
        let mut manager = match &config.callbacks {
            Some(Callbacks::Manager(m)) => m.clone(),
            Some(Callbacks::Handlers(handlers)) => {
                let mut m = Self::new();
                for h in handlers {
                    m.add_handler(h.clone(), true);
                }
                m
            }
            None => Self::new(),
        };
        let fresh: Vec<String> = config
            .tags
            .iter()
            .filter(|t| !manager.tags.contains(t))
            .cloned()
            .collect();
        manager.add_tags(fresh, true);
        manager.add_metadata(
            config
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
            true,
        );
        manager
    }

    pub fn with_handler(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.add_handler(handler, true);
        self
    }

    /// Register a handler. Inheritable handlers also observe every nested run.
    pub fn add_handler(&mut self, handler: Arc<dyn CallbackHandler>, inherit: bool) {
        if !self.handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            self.handlers.push(handler.clone());
        }
        if inherit && !self.inheritable_handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            self.inheritable_handlers.push(handler);
        }
    }

    /// Add tags, moving an already present tag to the end.
    pub fn add_tags(&mut self, tags: impl IntoIterator<Item = String>, inherit: bool) {
        for tag in tags {
            self.tags.retain(|t| t != &tag);
            if inherit {
                self.inheritable_tags.retain(|t| t != &tag);
                self.inheritable_tags.push(tag.clone());
            }
            self.tags.push(tag);
        }
    }

    pub fn add_metadata(&mut self, metadata: impl IntoIterator<Item = (String, Value)>, inherit: bool) {
        for (key, value) in metadata {
            if inherit {
                self.inheritable_metadata.insert(key.clone(), value.clone());
            }
            self.metadata.insert(key, value);
        }
    }

    /// A copy of this manager with one extra tag on the runs it starts
    /// directly. Used for step labels such as `seq:step:2`.
    pub fn with_local_tag(&self, tag: impl Into<String>) -> Self {
        let mut manager = self.clone();
        manager.add_tags([tag.into()], false);
        manager
    }

    /// Combine two managers. Handlers are unioned, `other`'s tags come last
    /// and `other`'s metadata and parent win.
    pub fn merge(&self, other: &CallbackManager) -> Self {
        let mut merged = self.clone();
        for h in &other.handlers {
            let inherit = other.inheritable_handlers.iter().any(|i| Arc::ptr_eq(i, h));
            merged.add_handler(h.clone(), inherit);
        }
        for tag in &other.tags {
            let inherit = other.inheritable_tags.contains(tag);
            merged.add_tags([tag.clone()], inherit);
        }
        for (k, v) in &other.metadata {
            let inherit = other.inheritable_metadata.contains_key(k);
            merged.add_metadata([(k.clone(), v.clone())], inherit);
        }
        if other.parent_run_id.is_some() {
            merged.parent_run_id = other.parent_run_id;
            merged.trace_id = other.trace_id;
            merged.registry = other.registry.clone();
        }
        merged
    }

    pub fn handlers(&self) -> &[Arc<dyn CallbackHandler>] {
        &self.handlers
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn parent_run_id(&self) -> Option<Uuid> {
        self.parent_run_id
    }

    /// Open a run and fire `on_start` on every handler.
    pub fn start_run(
        &self,
        name: impl Into<String>,
        run_type: RunType,
        input: &Value,
        run_id: Option<Uuid>,
    ) -> RunManager {
        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let info = Arc::new(RunInfo {
            run_id,
            parent_run_id: self.parent_run_id,
            trace_id: self.trace_id.unwrap_or(run_id),
            name: name.into(),
            run_type,
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            start_time: Utc::now(),
        });

        let registry = self.registry.clone().unwrap_or_default();
        registry.register(info.clone(), self.handlers.clone());
        tracing::debug!(
            run_id = %info.run_id,
            parent_run_id = ?info.parent_run_id,
            name = %info.name,
            run_type = %info.run_type,
            "run started"
        );
        for h in &self.handlers {
            h.on_start(&info, input);
        }
        registry.transition(run_id, RunStatus::Running);

        RunManager {
            info,
            handlers: self.handlers.clone(),
            inheritable_handlers: self.inheritable_handlers.clone(),
            inheritable_tags: self.inheritable_tags.clone(),
            inheritable_metadata: self.inheritable_metadata.clone(),
            registry,
        }
    }
}

/// Handle on one open run.
///
/// Closing methods (`end`, `fail`, `abort`) take effect once; later calls
/// are ignored. A `RunManager` dropped while its run is still open aborts
/// the run, which covers futures dropped mid-flight and streams the
/// consumer stopped pulling.
pub struct RunManager {
    info: Arc<RunInfo>,
    handlers: Vec<Arc<dyn CallbackHandler>>,
    inheritable_handlers: Vec<Arc<dyn CallbackHandler>>,
    inheritable_tags: Vec<String>,
    inheritable_metadata: HashMap<String, Value>,
    registry: Arc<RunRegistry>,
}

impl std::fmt::Debug for RunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunManager")
            .field("run_id", &self.info.run_id)
            .field("name", &self.info.name)
            .finish()
    }
}

impl RunManager {
    pub fn run_id(&self) -> Uuid {
        self.info.run_id
    }

    pub fn parent_run_id(&self) -> Option<Uuid> {
        self.info.parent_run_id
    }

    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    /// Whether anyone is listening. Lets callers skip serializing payloads.
    pub fn has_handlers(&self) -> bool {
        !self.handlers.is_empty()
    }

    pub fn status(&self) -> RunStatus {
        self.registry
            .status(self.info.run_id)
            .unwrap_or(RunStatus::Pending)
    }

    /// Manager for runs nested under this one, optionally with an extra
    /// local tag on the immediate children.
    pub fn get_child(&self, tag: Option<&str>) -> CallbackManager {
        let mut manager = CallbackManager {
            handlers: Vec::new(),
            inheritable_handlers: Vec::new(),
            tags: Vec::new(),
            inheritable_tags: Vec::new(),
            metadata: HashMap::new(),
            inheritable_metadata: HashMap::new(),
            parent_run_id: Some(self.info.run_id),
            trace_id: Some(self.info.trace_id),
            registry: Some(self.registry.clone()),
        };
        for h in &self.inheritable_handlers {
            manager.add_handler(h.clone(), true);
        }
        manager.add_tags(self.inheritable_tags.iter().cloned(), true);
        manager.add_metadata(
            self.inheritable_metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
            true,
        );
        if let Some(tag) = tag {
            manager.add_tags([tag.to_string()], false);
        }
        manager
    }

    pub fn on_chunk(&self, chunk: &Value) {
        for h in &self.handlers {
            h.on_chunk(&self.info, chunk);
        }
    }

    pub fn on_retry(&self, attempt: usize, error: &RunnelError) {
        tracing::warn!(
            run_id = %self.info.run_id,
            name = %self.info.name,
            attempt,
            error = %error,
            "attempt failed, retrying"
        );
        for h in &self.handlers {
            h.on_retry(&self.info, attempt, error);
        }
    }

    /// Close the run successfully.
    pub fn end(&self, output: &Value) {
        if !self.registry.transition(self.info.run_id, RunStatus::Succeeded) {
            tracing::warn!(run_id = %self.info.run_id, "run already closed, ignoring end");
            return;
        }
        tracing::debug!(run_id = %self.info.run_id, name = %self.info.name, "run succeeded");
        for h in &self.handlers {
            h.on_end(&self.info, output);
        }
    }

    /// Close the run with an error. A cancellation error aborts the run
    /// instead, so the run tree distinguishes the two.
    pub fn fail(&self, error: &RunnelError) {
        if error.is_cancelled() {
            self.abort();
            return;
        }
        if !self.registry.transition(self.info.run_id, RunStatus::Failed) {
            tracing::warn!(run_id = %self.info.run_id, "run already closed, ignoring error");
            return;
        }
        tracing::debug!(
            run_id = %self.info.run_id,
            name = %self.info.name,
            error = %error,
            "run failed"
        );
        for h in &self.handlers {
            h.on_error(&self.info, error);
        }
    }

    /// Abort the run and every descendant that is still open.
    pub fn abort(&self) {
        if self.registry.transition(self.info.run_id, RunStatus::Aborted) {
            tracing::debug!(run_id = %self.info.run_id, name = %self.info.name, "run aborted");
            for h in &self.handlers {
                h.on_abort(&self.info);
            }
        }
        for (info, handlers) in self.registry.abort_descendants(self.info.run_id) {
            tracing::debug!(run_id = %info.run_id, name = %info.name, "orphaned run aborted");
            for h in &handlers {
                h.on_abort(&info);
            }
        }
    }
}

impl Drop for RunManager {
    fn drop(&mut self) {
        if !self.status().is_terminal() {
            self.abort();
        }
    }
}
