//! The capability every schedulable task exposes, and the registry that binds
//! method references to implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, SchedulerError};
use crate::types::QueueItem;

/// A unit of application work the scheduler can run.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Perform the work. Any error (or panic) is recorded as a job failure.
    async fn start(&self) -> anyhow::Result<()>;

    /// Decide what to do with a queue item whose worker died mid-run.
    ///
    /// `true` puts the item back for a fresh worker; `false` discards it.
    fn reschedule(&self, _item: &QueueItem) -> bool {
        false
    }
}

/// Method reference → backend lookup.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `method` to `backend`, replacing any previous binding.
    pub fn register(&mut self, method: impl Into<String>, backend: impl Backend + 'static) {
        self.register_arc(method, Arc::new(backend));
    }

    pub fn register_arc(&mut self, method: impl Into<String>, backend: Arc<dyn Backend>) {
        self.backends.insert(method.into(), backend);
    }

    pub fn resolve(&self, method: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(method)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownMethod {
                method: method.to_string(),
            })
    }

    pub fn contains(&self, method: &str) -> bool {
        self.backends.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}
