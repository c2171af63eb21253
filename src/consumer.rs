//! Consumer boundary
//!
//! The consumer is the external script's controller as seen from the bridge. At
//! most one consumer is registered at a time; every entry point is invoked from
//! the scheduler task (or from registration) and never concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::midi::RawEvent;

/// Lifecycle entry points implemented by the external script
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn on_script_start(&self) -> anyhow::Result<()>;

    async fn on_script_stop(&self) -> anyhow::Result<()>;

    /// The host switched project or its track layout changed
    async fn on_project_load(&self) -> anyhow::Result<()>;

    /// One tick's worth of MIDI input, possibly empty
    async fn host_callback(&self, midi: Vec<RawEvent>) -> anyhow::Result<()>;
}

/// Holder for the currently registered consumer
#[derive(Default)]
pub struct ConsumerSlot {
    inner: RwLock<Option<Arc<dyn Consumer>>>,
}

impl ConsumerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current consumer, if any
    pub fn get(&self) -> Option<Arc<dyn Consumer>> {
        self.inner.read().clone()
    }

    /// Install a consumer, returning the one it replaces
    pub fn set(&self, consumer: Arc<dyn Consumer>) -> Option<Arc<dyn Consumer>> {
        self.inner.write().replace(consumer)
    }

    pub fn take(&self) -> Option<Arc<dyn Consumer>> {
        self.inner.write().take()
    }

    /// Remove the consumer only if it is this one
    pub fn take_if(&self, consumer: &Arc<dyn Consumer>) -> bool {
        let mut inner = self.inner.write();
        let same = inner
            .as_ref()
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(consumer)));
        if same {
            *inner = None;
        }
        same
    }

    pub fn is_registered(&self) -> bool {
        self.inner.read().is_some()
    }
}
