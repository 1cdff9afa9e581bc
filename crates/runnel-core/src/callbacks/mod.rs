pub mod collector;
pub mod handler;
pub mod manager;
pub mod run;
pub mod tracing_handler;

use std::sync::Arc;

pub use self::collector::RunCollector;
pub use self::handler::CallbackHandler;
pub use self::manager::{CallbackManager, RunManager};
pub use self::run::{Run, RunInfo, RunStatus, RunType};
pub use self::tracing_handler::TracingHandler;

/// Callbacks carried by a [`RunnableConfig`](crate::config::RunnableConfig):
/// either bare handlers or a manager to extend.
#[derive(Clone)]
pub enum Callbacks {
    Handlers(Vec<Arc<dyn CallbackHandler>>),
    Manager(CallbackManager),
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handlers(h) => f.debug_tuple("Handlers").field(&h.len()).finish(),
            Self::Manager(m) => f.debug_tuple("Manager").field(m).finish(),
        }
    }
}

impl Callbacks {
    /// Combine two callback sets; `overlay`'s manager takes precedence.
    pub fn merge(&self, overlay: &Callbacks) -> Callbacks {
        match (self, overlay) {
            (Self::Handlers(a), Self::Handlers(b)) => {
                let mut handlers = a.clone();
                for h in b {
                    if !handlers.iter().any(|x| Arc::ptr_eq(x, h)) {
                        handlers.push(h.clone());
                    }
                }
                Self::Handlers(handlers)
            }
            (Self::Handlers(a), Self::Manager(m)) | (Self::Manager(m), Self::Handlers(a)) => {
                let mut manager = m.clone();
                for h in a {
                    manager.add_handler(h.clone(), true);
                }
                Self::Manager(manager)
            }
            (Self::Manager(a), Self::Manager(b)) => Self::Manager(a.merge(b)),
        }
    }
}
