//! Shared gateway state.
//!
//! [`GatewayState`] holds the resources shared across all request handlers:
//! the configuration, the worker pool, the render cache, and the state
//! reporter. It is cloned per request, so shared pieces sit behind `Arc`.

use std::sync::Arc;

use crawlserver_common::{GatewayConfig, GatewayError};

use crate::cache::RenderCache;
use crate::pool::WorkerPool;
use crate::reporter::StateReporter;

/// Shared state across all request handlers.
#[derive(Clone)]
pub struct GatewayState {
    config: Arc<GatewayConfig>,
    pool: WorkerPool,
    cache: Arc<RenderCache>,
    reporter: Arc<StateReporter>,
}

impl GatewayState {
    /// Build the gateway state, spawning the worker pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the workers cannot be spawned.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let reporter = Arc::new(StateReporter::new());
        let pool = WorkerPool::new(&config, Arc::clone(&reporter))?;
        let cache = Arc::new(RenderCache::new(config.cache_capacity));

        Ok(Self {
            config: Arc::new(config),
            pool,
            cache,
            reporter,
        })
    }

    /// Gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The render cache.
    pub fn cache(&self) -> &RenderCache {
        &self.cache
    }

    /// The state reporter.
    pub fn reporter(&self) -> &StateReporter {
        &self.reporter
    }
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("cached_pages", &self.cache.len())
            .field("live_workers", &self.pool.live_workers())
            .finish_non_exhaustive()
    }
}
