pub mod backoff;
pub mod caller;
pub mod callbacks;
pub mod chunk;
pub mod config;
pub mod error;
pub mod runnable;
pub mod sequence;
pub mod traced;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backoff::BackoffPolicy;
    pub use crate::caller::{AsyncCaller, AsyncCallerConfig};
    pub use crate::callbacks::{
        CallbackHandler, CallbackManager, Callbacks, Run, RunCollector, RunManager, RunStatus,
        RunType, TracingHandler,
    };
    pub use crate::chunk::{collect_chunks, Chunk, ChunkStream};
    pub use crate::config::{merge_configs, RunnableConfig};
    pub use crate::error::{ChainError, ModelError, Result, RunnelError, ToolError};
    pub use crate::runnable::{
        ArcRunnable, BatchOptions, BoxRunnable, Runnable, RunnableExt, RunnablePassthrough,
        RunnableSequence,
    };
    pub use crate::traced::{
        call_with_config, call_with_run, open_run, transform_with_config, transform_with_run,
        Traced,
    };
    pub use tokio_util::sync::CancellationToken;
}
