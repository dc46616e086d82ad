//! Process-wide reporting components.
//!
//! A [`ReportingContext`] owns one cache, one invalidation manager, one
//! controller and one queue. Build it once at startup and pass it (or its
//! parts) to consumers. Write paths that cannot take a parameter reach the
//! installed context through [`invalidate_cache_on_data_change`].

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use stockview_cache::{CacheInvalidationManager, CacheManager, WriteOperation};

use crate::controller::AsyncReportController;
use crate::queue::TaskQueueManager;
use crate::registry::GeneratorRegistry;
use crate::settings::Settings;

static INSTALLED: OnceCell<Arc<ReportingContext>> = OnceCell::new();

#[derive(Debug)]
pub struct ReportingContext {
    pub cache: Arc<CacheManager>,
    pub invalidation: Arc<CacheInvalidationManager>,
    pub controller: Arc<AsyncReportController>,
    pub queue: Arc<TaskQueueManager>,
}

impl ReportingContext {
    /// Build every component from validated settings.
    pub fn new(settings: &Settings, registry: GeneratorRegistry) -> Self {
        let cache = Arc::new(CacheManager::new(settings.cache.clone()));
        let invalidation = Arc::new(CacheInvalidationManager::new(cache.clone()));
        let controller = Arc::new(AsyncReportController::new(
            settings.controller.clone(),
            registry,
        ));
        let queue = Arc::new(TaskQueueManager::new(
            settings.queue.clone(),
            controller.clone(),
        ));

        Self {
            cache,
            invalidation,
            controller,
            queue,
        }
    }

    /// Install `self` as the process-wide context. The first install wins;
    /// later calls hand back the context they tried to install.
    pub fn install(self: Arc<Self>) -> Result<(), Arc<Self>> {
        INSTALLED.set(self)?;
        info!("reporting context installed");
        Ok(())
    }

    pub fn installed() -> Option<&'static Arc<ReportingContext>> {
        INSTALLED.get()
    }

    /// Evict cached reports depending on `collection`.
    pub fn invalidate_on_data_change(&self, collection: &str, operation: WriteOperation) -> usize {
        self.invalidation.invalidate_by_collection(collection, operation)
    }

    /// Stop the queue, then the controller behind it, then the cache sweeper.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        self.controller.shutdown();
        self.cache.shutdown();
    }
}

/// Write-path hook: evict reports built from `collection` in the installed
/// context. Returns 0 when no context is installed.
pub fn invalidate_cache_on_data_change(collection: &str, operation: WriteOperation) -> usize {
    match ReportingContext::installed() {
        Some(ctx) => ctx.invalidate_on_data_change(collection, operation),
        None => {
            debug!(collection, "no reporting context installed, nothing to invalidate");
            0
        }
    }
}
