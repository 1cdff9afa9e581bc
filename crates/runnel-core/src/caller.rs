use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::error::{ModelError, Result, RunnelError};

/// Settings for [`AsyncCaller`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncCallerConfig {
    /// Calls allowed in flight at once across every clone of the caller.
    /// `None` means unbounded.
    pub max_concurrency: Option<usize>,
    /// Extra attempts after the first one for transient failures.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Default for AsyncCallerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            max_retries: 6,
            backoff: BackoffPolicy::default(),
            timeout_ms: None,
        }
    }
}

impl AsyncCallerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Gate for calls to an external service: bounded concurrency plus retry of
/// transient failures with backoff.
///
/// Clones share the same concurrency budget. A permit is held for one
/// attempt and released while backing off.
#[derive(Debug, Clone)]
pub struct AsyncCaller {
    config: AsyncCallerConfig,
    semaphore: Option<Arc<Semaphore>>,
}

impl Default for AsyncCaller {
    fn default() -> Self {
        Self::new(AsyncCallerConfig::default())
    }
}

impl AsyncCaller {
    pub fn new(config: AsyncCallerConfig) -> Self {
        let semaphore = config
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self { config, semaphore }
    }

    pub fn config(&self) -> &AsyncCallerConfig {
        &self.config
    }

    /// Permits currently free, or `None` when unbounded.
    pub fn available_permits(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_with_signal(None, f).await
    }

    /// Like [`call`](Self::call), but the permit wait, the attempt itself and
    /// every backoff sleep end early with `Cancelled` once `signal` fires.
    pub async fn call_with_signal<T, F, Fut>(
        &self,
        signal: Option<&CancellationToken>,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0u32;
        loop {
            let result = cancellable(signal, self.attempt(&mut f)).await;
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retries < self.config.max_retries => {
                    retries += 1;
                    let mut delay = self.config.backoff.delay(retries);
                    if let RunnelError::Model(ModelError::RateLimited {
                        retry_after_secs: Some(secs),
                    }) = &e
                    {
                        delay = delay.max(Duration::from_secs(*secs));
                    }
                    tracing::debug!(retry = retries, ?delay, error = %e, "transient failure, backing off");
                    cancellable(signal, async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt<T, F, Fut>(&self, f: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = match &self.semaphore {
            Some(semaphore) => Some(
                semaphore
                    .acquire()
                    .await
                    .map_err(|_| RunnelError::Other("caller semaphore closed".into()))?,
            ),
            None => None,
        };
        match self.config.timeout() {
            Some(limit) => tokio::time::timeout(limit, f())
                .await
                .map_err(|_| RunnelError::from(ModelError::Timeout(limit)))?,
            None => f().await,
        }
    }
}

async fn cancellable<T>(
    signal: Option<&CancellationToken>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match signal {
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
