//! Engine builder for flexible construction.
//!
//! The builder is the one place the engine's injectable pieces come
//! together: the validated [`EngineConfig`], the [`ImageFetcher`] doing the
//! actual network and decode work, and the [`Clock`] stamping cache
//! recency. Only the fetcher is mandatory.

use std::sync::Arc;

use crate::cache::ImageFetcher;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::types::{Clock, EngineConfig, TickClock};

/// Builder for [`Engine`] with injectable fetcher and clock.
pub struct EngineBuilder {
    config: EngineConfig,
    fetcher: Option<Arc<dyn ImageFetcher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            fetcher: None,
            clock: None,
        }
    }

    /// Set the engine configuration. Validated at `build`.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the image fetcher. Required.
    pub fn fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Set the recency clock. Defaults to a monotonic tick counter.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Enable or disable the background worker mirror, overriding the
    /// configuration.
    pub fn with_worker(mut self, enabled: bool) -> Self {
        self.config.worker_enabled = enabled;
        self
    }

    /// Validate the configuration and build the engine.
    pub fn build(self) -> Result<Engine> {
        self.config.validate().map_err(EngineError::InvalidConfig)?;
        let Some(fetcher) = self.fetcher else {
            return Err(EngineError::InvalidConfig(
                "an image fetcher is required".to_string(),
            ));
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(TickClock::new()));
        Ok(Engine::from_parts(self.config, fetcher, clock))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
