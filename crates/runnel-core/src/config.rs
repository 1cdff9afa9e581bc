use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::callbacks::{CallbackHandler, CallbackManager, Callbacks};
use crate::error::{Result, RunnelError};

pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Configuration passed through the Runnable chain.
///
/// Every field is optional in the sense that an empty value means "inherit".
/// Callbacks and the cancellation signal are runtime-only and skipped by serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnableConfig {
    /// Tags for filtering and categorization.
    pub tags: Vec<String>,

    /// Arbitrary metadata key-value pairs.
    pub metadata: HashMap<String, Value>,

    #[serde(skip)]
    pub callbacks: Option<Callbacks>,

    /// Display name for the run started with this config.
    pub run_name: Option<String>,

    /// Arbitrary configurable values accessible by runnables.
    pub configurable: HashMap<String, Value>,

    /// Keyword call arguments, e.g. a `stop` sequence for a model.
    pub call_options: HashMap<String, Value>,

    /// Remaining nesting depth, [`DEFAULT_RECURSION_LIMIT`] when unset.
    /// Decremented at every traced boundary.
    pub recursion_limit: Option<usize>,

    /// Cap on concurrent sub-operations in a batch or fan-out.
    pub max_concurrency: Option<usize>,

    /// Id for the run started with this config. Never inherited.
    pub run_id: Option<Uuid>,

    #[serde(skip)]
    pub signal: Option<CancellationToken>,
}

impl Default for RunnableConfig {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            metadata: HashMap::new(),
            callbacks: None,
            run_name: None,
            configurable: HashMap::new(),
            call_options: HashMap::new(),
            recursion_limit: None,
            max_concurrency: None,
            run_id: None,
            signal: None,
        }
    }
}

impl RunnableConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_configurable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.configurable.insert(key.into(), value);
        self
    }

    pub fn with_call_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.call_options.insert(key.into(), value);
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = Some(limit);
        self
    }

    /// Nesting depth left before `RecursionLimit` is raised.
    pub fn remaining_depth(&self) -> usize {
        self.recursion_limit.unwrap_or(DEFAULT_RECURSION_LIMIT)
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_run_name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Append a handler, extending whatever callbacks are already set.
    pub fn with_handler(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.callbacks = Some(match self.callbacks.take() {
            None => Callbacks::Handlers(vec![handler]),
            Some(Callbacks::Handlers(mut handlers)) => {
                handlers.push(handler);
                Callbacks::Handlers(handlers)
            }
            Some(Callbacks::Manager(mut manager)) => {
                manager.add_handler(handler, true);
                Callbacks::Manager(manager)
            }
        });
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.as_ref().is_some_and(|s| s.is_cancelled())
    }

    pub fn ensure_not_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RunnelError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` to completion unless the signal fires first, in which
    /// case `fut` is dropped and `Cancelled` is returned.
    pub async fn run_cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match &self.signal {
            Some(signal) => {
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => Err(RunnelError::Cancelled),
                    result = fut => result,
                }
            }
            None => fut.await,
        }
    }

    /// Sleep that wakes early with `Cancelled` when the signal fires.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run_cancellable(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    /// Overlay `overlay` on top of `self` without touching either.
    ///
    /// Tags concatenate; metadata, configurable and call options merge
    /// shallowly with `overlay` winning; callbacks combine; scalar options
    /// are taken from `overlay` when it sets them.
    pub fn merge(&self, overlay: &RunnableConfig) -> RunnableConfig {
        let mut merged = self.clone();
        merged.tags.extend(overlay.tags.iter().cloned());
        merged
            .metadata
            .extend(overlay.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .configurable
            .extend(overlay.configurable.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .call_options
            .extend(overlay.call_options.iter().map(|(k, v)| (k.clone(), v.clone())));

        merged.callbacks = match (&self.callbacks, &overlay.callbacks) {
            (Some(base), Some(top)) => Some(base.merge(top)),
            (base, top) => top.clone().or_else(|| base.clone()),
        };

        if overlay.recursion_limit.is_some() {
            merged.recursion_limit = overlay.recursion_limit;
        }
        if overlay.max_concurrency.is_some() {
            merged.max_concurrency = overlay.max_concurrency;
        }
        if overlay.run_id.is_some() {
            merged.run_id = overlay.run_id;
        }
        if overlay.run_name.is_some() {
            merged.run_name = overlay.run_name.clone();
        }
        if overlay.signal.is_some() {
            merged.signal = overlay.signal.clone();
        }
        merged
    }

    /// Config for work nested under a run: carries the run's child manager,
    /// one less level of recursion, and drops the per-run id and name.
    pub fn child(&self, manager: CallbackManager) -> RunnableConfig {
        let mut child = self.clone();
        child.callbacks = Some(Callbacks::Manager(manager));
        child.recursion_limit = Some(self.remaining_depth().saturating_sub(1));
        child.run_id = None;
        child.run_name = None;
        child
    }

    /// Same config with an extra tag on the next run only, such as
    /// `seq:step:2`. Runs nested further down do not inherit it.
    pub fn tagged(&self, tag: impl Into<String>) -> RunnableConfig {
        let manager = match &self.callbacks {
            Some(Callbacks::Manager(m)) => m.with_local_tag(tag),
            _ => CallbackManager::configure(self).with_local_tag(tag),
        };
        let mut tagged = self.clone();
        tagged.callbacks = Some(Callbacks::Manager(manager));
        tagged
    }
}

/// Fold configs left to right with [`RunnableConfig::merge`].
pub fn merge_configs<'a>(configs: impl IntoIterator<Item = &'a RunnableConfig>) -> RunnableConfig {
    configs
        .into_iter()
        .fold(RunnableConfig::default(), |acc, next| acc.merge(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::RunCollector;

    #[test]
    fn default_config() {
        let config = RunnableConfig::default();
        assert!(config.tags.is_empty());
        assert!(config.metadata.is_empty());
        assert_eq!(config.remaining_depth(), DEFAULT_RECURSION_LIMIT);
        assert!(config.configurable.is_empty());
        assert!(config.run_id.is_none());
        assert!(!config.is_cancelled());
    }

    #[test]
    fn builder_methods() {
        let config = RunnableConfig::new()
            .with_tag("test")
            .with_tag("debug")
            .with_metadata("key", serde_json::json!("value"))
            .with_recursion_limit(50)
            .with_max_concurrency(4)
            .with_run_name("custom");

        assert_eq!(config.tags, vec!["test", "debug"]);
        assert_eq!(config.metadata["key"], serde_json::json!("value"));
        assert_eq!(config.recursion_limit, Some(50));
        assert_eq!(config.max_concurrency, Some(4));
        assert_eq!(config.run_name.as_deref(), Some("custom"));
    }

    #[test]
    fn merge_concatenates_tags_and_overlay_wins() {
        let base = RunnableConfig::new()
            .with_tags(["a", "shared"])
            .with_metadata("k", serde_json::json!(1))
            .with_metadata("base_only", serde_json::json!(true))
            .with_configurable("model", serde_json::json!("small"));
        let overlay = RunnableConfig::new()
            .with_tags(["shared", "b"])
            .with_metadata("k", serde_json::json!(2))
            .with_configurable("model", serde_json::json!("large"))
            .with_max_concurrency(2);

        let merged = base.merge(&overlay);
        assert_eq!(merged.tags, vec!["a", "shared", "shared", "b"]);
        assert_eq!(merged.metadata["k"], serde_json::json!(2));
        assert_eq!(merged.metadata["base_only"], serde_json::json!(true));
        assert_eq!(merged.configurable["model"], serde_json::json!("large"));
        assert_eq!(merged.max_concurrency, Some(2));

        // Inputs untouched.
        assert_eq!(base.tags, vec!["a", "shared"]);
        assert_eq!(base.metadata["k"], serde_json::json!(1));
        assert!(base.max_concurrency.is_none());
    }

    #[test]
    fn merge_keeps_base_scalars_when_overlay_is_default() {
        let base = RunnableConfig::new()
            .with_recursion_limit(10)
            .with_max_concurrency(3)
            .with_run_name("base");
        let merged = base.merge(&RunnableConfig::default());
        assert_eq!(merged.recursion_limit, Some(10));
        assert_eq!(merged.max_concurrency, Some(3));
        assert_eq!(merged.run_name.as_deref(), Some("base"));
    }

    #[test]
    fn merge_takes_any_limit_the_overlay_sets() {
        let base = RunnableConfig::new().with_recursion_limit(1000);
        for limit in [0, 24, DEFAULT_RECURSION_LIMIT, 26] {
            let merged = base.merge(&RunnableConfig::new().with_recursion_limit(limit));
            assert_eq!(merged.remaining_depth(), limit);
        }
    }

    #[test]
    fn merge_combines_handlers() {
        let a = Arc::new(RunCollector::new());
        let b = Arc::new(RunCollector::new());
        let merged = RunnableConfig::new()
            .with_handler(a)
            .merge(&RunnableConfig::new().with_handler(b));
        match merged.callbacks {
            Some(Callbacks::Handlers(handlers)) => assert_eq!(handlers.len(), 2),
            other => panic!("unexpected callbacks: {other:?}"),
        }
    }

    #[test]
    fn merge_configs_folds_in_order() {
        let a = RunnableConfig::new().with_tag("a").with_run_name("first");
        let b = RunnableConfig::new().with_tag("b");
        let c = RunnableConfig::new().with_tag("c").with_run_name("last");
        let merged = merge_configs([&a, &b, &c]);
        assert_eq!(merged.tags, vec!["a", "b", "c"]);
        assert_eq!(merged.run_name.as_deref(), Some("last"));
    }

    #[test]
    fn child_decrements_and_clears_run_identity() {
        let id = Uuid::new_v4();
        let config = RunnableConfig::new()
            .with_run_id(id)
            .with_run_name("root")
            .with_tag("kept");
        let child = config.child(CallbackManager::new());
        assert_eq!(child.recursion_limit, Some(DEFAULT_RECURSION_LIMIT - 1));
        assert!(child.run_id.is_none());
        assert!(child.run_name.is_none());
        assert_eq!(child.tags, vec!["kept"]);
        assert!(matches!(child.callbacks, Some(Callbacks::Manager(_))));
    }

    #[test]
    fn child_saturates_at_zero() {
        let config = RunnableConfig::new().with_recursion_limit(0);
        assert_eq!(config.child(CallbackManager::new()).recursion_limit, Some(0));
    }

    #[test]
    fn tagged_adds_local_tag_only() {
        let config = RunnableConfig::new().with_tag("user");
        let tagged = config.tagged("seq:step:1");
        match &tagged.callbacks {
            Some(Callbacks::Manager(m)) => {
                assert!(m.tags().contains(&"seq:step:1".to_string()));
                assert!(m.tags().contains(&"user".to_string()));
            }
            other => panic!("unexpected callbacks: {other:?}"),
        }
        assert_eq!(tagged.tags, vec!["user"]);
    }

    #[tokio::test]
    async fn run_cancellable_short_circuits() {
        let token = CancellationToken::new();
        let config = RunnableConfig::new().with_signal(token.clone());
        token.cancel();
        let result = config
            .run_cancellable(async { Ok::<_, RunnelError>(1) })
            .await;
        assert!(matches!(result, Err(RunnelError::Cancelled)));
        assert!(config.ensure_not_cancelled().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_wakes_on_cancel() {
        let token = CancellationToken::new();
        let config = RunnableConfig::new().with_signal(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let result = config.sleep(Duration::from_secs(3600)).await;
        assert!(matches!(result, Err(RunnelError::Cancelled)));
        canceller.await.unwrap();
    }

    #[test]
    fn serde_roundtrip_skips_runtime_fields() {
        let config = RunnableConfig::new()
            .with_tag("test")
            .with_metadata("foo", serde_json::json!(42))
            .with_signal(CancellationToken::new());
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RunnableConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.tags, config.tags);
        assert_eq!(deserialized.metadata, config.metadata);
        assert_eq!(deserialized.recursion_limit, config.recursion_limit);
        assert!(deserialized.signal.is_none());
    }

    #[test]
    fn deserialize_partial_json() {
        let config: RunnableConfig =
            serde_json::from_str(r#"{"tags":["x"],"max_concurrency":3}"#).unwrap();
        assert_eq!(config.tags, vec!["x"]);
        assert_eq!(config.max_concurrency, Some(3));
        assert!(config.recursion_limit.is_none());
        assert_eq!(config.remaining_depth(), DEFAULT_RECURSION_LIMIT);
    }
}
