//! Configuration, statistics and clock types for the engine.
//!
//! `EngineConfig` is plain serde data so hosts can ship tuning as JSON next
//! to their canvas settings.

use serde::de::Error;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cache::CacheStats;
use crate::lod::CdnProvider;
use crate::region::LoaderStats;
use crate::spatial_index::IndexStats;

/// Scheduling hint attached to image loads.
///
/// Purely advisory bookkeeping today; loads run when requested. The region
/// loader tags its sweep and upgrade loads `Low`, direct callers default to
/// `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadPriority {
    /// Needed for the current frame
    High,
    /// Requested by the caller without urgency
    #[default]
    Normal,
    /// Speculative prefetch
    Low,
}

/// Engine configuration
///
/// Designed to be easily serializable and loadable from JSON while keeping
/// complexity minimal. Every field has a default, so a partial document is
/// enough.
///
/// # Example
///
/// ```rust
/// use stickerboard::EngineConfig;
///
/// // Create default config
/// let config = EngineConfig::default();
/// assert!(config.validate().is_ok());
///
/// // Load from JSON
/// let json = r#"{
///     "max_memory_bytes": 52428800,
///     "cell_size": 256.0,
///     "prefetch_depth": 2
/// }"#;
/// let config: EngineConfig = serde_json::from_str(json).unwrap();
/// assert_eq!(config.cell_size, 256.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Memory budget for decoded images in bytes
    #[serde(default = "EngineConfig::default_max_memory_bytes")]
    pub max_memory_bytes: usize,

    /// Side length of a prefetch region in canvas units
    #[serde(default = "EngineConfig::default_cell_size")]
    pub cell_size: f64,

    /// Rings of neighbor regions loaded around the viewport
    #[serde(default = "EngineConfig::default_prefetch_depth")]
    pub prefetch_depth: u32,

    /// Number of images a sweep loads between yields
    #[serde(default = "EngineConfig::default_load_batch_size")]
    pub load_batch_size: usize,

    /// Base viewport query padding in canvas units at zoom 1
    #[serde(default = "EngineConfig::default_viewport_padding")]
    pub viewport_padding: f64,

    /// Snap distance in canvas units
    #[serde(default = "EngineConfig::default_snap_threshold")]
    pub snap_threshold: f64,

    /// Maximum number of images refreshed by one zoom-change upgrade pass
    #[serde(default = "EngineConfig::default_upgrade_pass_limit")]
    pub upgrade_pass_limit: usize,

    /// How long a bridge call waits for the worker before falling back
    #[serde(default = "EngineConfig::default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,

    /// Whether the background index mirror is started at all
    #[serde(default = "EngineConfig::default_worker_enabled")]
    pub worker_enabled: bool,

    /// Extra CDN providers recognized for URL rewriting, on top of the
    /// built-in table
    #[serde(default)]
    pub cdn_providers: Vec<CdnProvider>,
}

impl EngineConfig {
    const fn default_max_memory_bytes() -> usize {
        100 * 1024 * 1024
    }

    const fn default_cell_size() -> f64 {
        512.0
    }

    const fn default_prefetch_depth() -> u32 {
        1
    }

    const fn default_load_batch_size() -> usize {
        10
    }

    const fn default_viewport_padding() -> f64 {
        100.0
    }

    const fn default_snap_threshold() -> f64 {
        5.0
    }

    const fn default_upgrade_pass_limit() -> usize {
        24
    }

    const fn default_worker_timeout_ms() -> u64 {
        250
    }

    const fn default_worker_enabled() -> bool {
        true
    }

    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn with_cell_size(mut self, cell_size: f64) -> Self {
        assert!(
            cell_size.is_finite() && cell_size > 0.0,
            "Cell size must be finite and positive"
        );
        self.cell_size = cell_size;
        self
    }

    pub fn with_prefetch_depth(mut self, depth: u32) -> Self {
        self.prefetch_depth = depth;
        self
    }

    pub fn with_load_batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "Load batch size must be greater than zero");
        self.load_batch_size = batch_size;
        self
    }

    pub fn with_viewport_padding(mut self, padding: f64) -> Self {
        self.viewport_padding = padding;
        self
    }

    pub fn with_snap_threshold(mut self, threshold: f64) -> Self {
        self.snap_threshold = threshold;
        self
    }

    pub fn with_upgrade_pass_limit(mut self, limit: usize) -> Self {
        self.upgrade_pass_limit = limit;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Run without the background index mirror.
    pub fn without_worker(mut self) -> Self {
        self.worker_enabled = false;
        self
    }

    /// Register an additional CDN provider for URL rewriting.
    pub fn with_cdn_provider(mut self, provider: CdnProvider) -> Self {
        self.cdn_providers.push(provider);
        self
    }

    /// Get the worker timeout as a Duration
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.max_memory_bytes == 0 {
            return Err("Memory budget must be greater than zero".to_string());
        }

        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err("Cell size must be finite and positive".to_string());
        }

        if self.load_batch_size == 0 {
            return Err("Load batch size must be greater than zero".to_string());
        }

        if !self.viewport_padding.is_finite() || self.viewport_padding < 0.0 {
            return Err("Viewport padding must be finite and non-negative".to_string());
        }

        if !self.snap_threshold.is_finite() || self.snap_threshold < 0.0 {
            return Err("Snap threshold must be finite and non-negative".to_string());
        }

        if self.worker_timeout_ms == 0 {
            return Err("Worker timeout must be greater than zero".to_string());
        }

        for provider in &self.cdn_providers {
            if provider.host_suffix.is_empty()
                || provider.width_param.is_empty()
                || provider.quality_param.is_empty()
            {
                return Err("CDN providers need a host suffix and parameter names".to_string());
            }
        }

        Ok(())
    }

    /// Load configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: EngineConfig = serde_json::from_str(json)?;
        if let Err(e) = config.validate() {
            return Err(Error::custom(e));
        }
        Ok(config)
    }

    /// Save configuration as JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: Self::default_max_memory_bytes(),
            cell_size: Self::default_cell_size(),
            prefetch_depth: Self::default_prefetch_depth(),
            load_batch_size: Self::default_load_batch_size(),
            viewport_padding: Self::default_viewport_padding(),
            snap_threshold: Self::default_snap_threshold(),
            upgrade_pass_limit: Self::default_upgrade_pass_limit(),
            worker_timeout_ms: Self::default_worker_timeout_ms(),
            worker_enabled: Self::default_worker_enabled(),
            cdn_providers: Vec::new(),
        }
    }
}

/// Source of LRU recency stamps.
///
/// Only ordering matters, not wall time. Injecting the clock keeps eviction
/// order reproducible in tests.
pub trait Clock: Send + Sync {
    /// Next stamp; later calls return larger values.
    fn now(&self) -> u64;
}

/// Default clock: a monotonic counter.
#[derive(Debug, Default)]
pub struct TickClock {
    ticks: AtomicU64,
}

impl TickClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for TickClock {
    fn now(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    value: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stamp returned by subsequent `now` calls.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Move the stamp forward.
    pub fn advance(&self, ticks: u64) {
        self.value.fetch_add(ticks, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Combined statistics across the engine's parts.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Spatial index statistics
    pub index: IndexStats,
    /// Image cache statistics
    pub cache: CacheStats,
    /// Region loader statistics
    pub loader: LoaderStats,
    /// Whether a worker mirror is currently attached
    pub worker_attached: bool,
}
