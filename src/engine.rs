//! Engine facade: per-frame culling, asset streaming, and worker fallback.
//!
//! One `Engine` owns one of everything: the synchronous [`SpatialIndex`],
//! the shared [`ImageCache`], the [`RegionLoader`], and (when enabled) the
//! [`WorkerBridge`]. The render host calls [`Engine::set_elements`] on every
//! structural change, then [`Engine::render_pass`] and
//! [`Engine::stream_assets`] each frame.
//!
//! Worker policy: background queries try the worker first and fall back to
//! the synchronous index on any worker error. The first failure of an
//! incident is logged at warn, repeats at debug, and a later success arms
//! the warning again.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use geo::Rect;
use stickerboard_types::{CanvasElement, ViewportBounds};

use crate::builder::EngineBuilder;
use crate::cache::{ImageCache, ImageFetcher};
use crate::error::{EngineError, Result};
use crate::lod::{self, LodLevel, LodSettings};
use crate::region::RegionLoader;
use crate::spatial::{self, SnapResult};
use crate::spatial_index::SpatialIndex;
use crate::types::{Clock, EngineConfig, EngineStats};
use crate::worker::WorkerBridge;

/// Sentinel for "no stream pass has happened yet".
const LOD_NONE: u8 = u8::MAX;

/// One frame's draw list with the LOD context it was culled under.
#[derive(Debug)]
pub struct RenderPass<'a> {
    /// Visible elements in paint order (ascending z_index).
    pub elements: Vec<&'a CanvasElement>,
    /// The tier the zoom factor selected.
    pub lod: LodLevel,
    /// Settings of that tier (quality, toggles, minimum sizes).
    pub settings: &'static LodSettings,
    /// Hint: draw in slices of this size, yielding to input in between.
    pub batch_size: usize,
}

/// Canvas render engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use stickerboard::cache::ImageFetcher;
/// use stickerboard::engine::Engine;
/// use stickerboard::types::EngineConfig;
/// use stickerboard_types::{CanvasElement, ViewportBounds};
///
/// # fn fetcher() -> Arc<dyn ImageFetcher> { unimplemented!() }
/// let mut engine = Engine::new(EngineConfig::default(), fetcher())?;
/// engine.set_elements(&[CanvasElement::sticker(
///     "logo", "https://images.unsplash.com/photo-1", 40.0, 40.0, 256.0, 256.0,
/// )]);
///
/// let viewport = ViewportBounds::new(0.0, 0.0, 1280.0, 800.0);
/// let pass = engine.render_pass(&viewport, 1.0);
/// assert_eq!(pass.elements.len(), 1);
/// engine.stream_assets(&viewport, 1.0);
/// # stickerboard::Result::Ok(())
/// ```
pub struct Engine {
    config: EngineConfig,
    index: SpatialIndex,
    cache: ImageCache,
    loader: RegionLoader,
    worker: Option<WorkerBridge>,
    /// True while the worker is failing; gates the once-per-incident warn.
    worker_degraded: AtomicBool,
    /// Tier of the last `stream_assets` call, `LOD_NONE` before the first.
    last_stream_lod: AtomicU8,
}

impl Engine {
    /// Build an engine with a validated config and the default tick clock.
    pub fn new(config: EngineConfig, fetcher: Arc<dyn ImageFetcher>) -> Result<Self> {
        EngineBuilder::new().config(config).fetcher(fetcher).build()
    }

    pub(crate) fn from_parts(
        config: EngineConfig,
        fetcher: Arc<dyn ImageFetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut providers = lod::default_providers().to_vec();
        providers.extend(config.cdn_providers.iter().cloned());
        let cache = ImageCache::with_providers(config.max_memory_bytes, fetcher, clock, providers);

        let loader = RegionLoader::new(&config, cache.clone());
        let worker = config
            .worker_enabled
            .then(|| WorkerBridge::spawn(config.worker_timeout()));

        Self {
            config,
            index: SpatialIndex::new(),
            cache,
            loader,
            worker,
            worker_degraded: AtomicBool::new(false),
            last_stream_lod: AtomicU8::new(LOD_NONE),
        }
    }

    // ===== Structural changes =====

    /// Replace the element list everywhere: the synchronous index, the
    /// loader's snapshot, and (when attached) the worker mirror.
    ///
    /// The full list is resent to the worker on every call; if the resend
    /// fails the engine keeps running on the synchronous index alone.
    pub fn set_elements(&mut self, elements: &[CanvasElement]) {
        self.index.load(elements.to_vec());
        self.loader.set_elements(elements);

        if let Some(worker) = &self.worker {
            match worker.load_elements(elements) {
                Ok(count) => {
                    self.note_worker_recovery();
                    log::debug!("Worker mirror now holds {count} elements");
                }
                Err(err) => self.note_worker_failure("element resend", &err),
            }
        }
    }

    // ===== Per-frame work =====

    /// Cull and order the draw list for one frame.
    ///
    /// Elements are kept when their padded-viewport query hit is visible,
    /// has opacity above zero, and projects larger than the active tier's
    /// minimum render size. The result is sorted ascending by z_index.
    pub fn render_pass(&self, viewport: &ViewportBounds, zoom: f64) -> RenderPass<'_> {
        let padding = spatial::padding_for_zoom(self.config.viewport_padding, zoom);
        let lod = lod::lod_for_zoom(zoom);

        let mut elements: Vec<&CanvasElement> = self
            .index
            .query_viewport(viewport, padding)
            .into_iter()
            .filter(|element| {
                element.visible && element.opacity > 0.0 && lod::should_render(element, zoom)
            })
            .collect();
        elements.sort_by_key(|element| element.z_index);

        let settings = lod.settings();
        RenderPass {
            elements,
            lod,
            settings,
            batch_size: settings.batch_size,
        }
    }

    /// Drive progressive asset loading for the current viewport.
    ///
    /// Crossing into a different LOD tier first schedules a bounded upgrade
    /// pass for the images already on screen; either way the region loader
    /// gets the viewport and sweeps whatever is newly visible.
    pub fn stream_assets(&self, viewport: &ViewportBounds, zoom: f64) {
        let lod = lod::lod_for_zoom(zoom);
        let previous = self.last_stream_lod.swap(lod as u8, Ordering::Relaxed);
        if previous != LOD_NONE && previous != lod as u8 {
            let padding = spatial::padding_for_zoom(self.config.viewport_padding, zoom);
            let visible: Vec<CanvasElement> = self
                .index
                .query_viewport(viewport, padding)
                .into_iter()
                .cloned()
                .collect();
            self.loader.on_zoom_change(&visible, zoom);
        }

        self.loader.update_viewport(viewport, zoom);
    }

    // ===== Interactive queries (always synchronous) =====

    /// Elements under a canvas-space point, front-most first.
    pub fn hit_test(&self, x: f64, y: f64) -> Vec<&CanvasElement> {
        let mut hits = self.index.query_point(x, y);
        hits.sort_by_key(|element| std::cmp::Reverse(element.z_index));
        hits
    }

    /// Snap a proposed drag position using the configured threshold.
    pub fn snap(&self, id: &str, x: f64, y: f64) -> SnapResult {
        self.index.calculate_snap(id, x, y, self.config.snap_threshold)
    }

    /// Aggregate bounds of the whole board, `None` when empty. The zoom-to-
    /// fit target.
    pub fn fit_bounds(&self) -> Option<Rect<f64>> {
        self.index.bounds()
    }

    /// Other elements overlapping the given element's bounds.
    pub fn collisions(&self, id: &str) -> Vec<&CanvasElement> {
        self.index.find_collisions(id)
    }

    // ===== Background queries (worker first, sync fallback) =====

    /// Ids of elements in the padded viewport, computed off-thread when the
    /// worker is healthy.
    pub fn background_query_viewport(&self, viewport: &ViewportBounds, zoom: f64) -> Vec<String> {
        let padding = spatial::padding_for_zoom(self.config.viewport_padding, zoom);
        self.worker_or(
            "viewport query",
            |worker| worker.query_viewport(viewport, padding),
            || ids_of(self.index.query_viewport(viewport, padding)),
        )
    }

    /// Ids of elements overlapping `id`, computed off-thread when possible.
    pub fn background_find_collisions(&self, id: &str) -> Vec<String> {
        self.worker_or(
            "collision query",
            |worker| worker.find_collisions(id),
            || ids_of(self.index.find_collisions(id)),
        )
    }

    /// The given ids in ascending z order, computed off-thread when possible.
    pub fn background_sort_by_depth(&self, ids: Vec<String>) -> Vec<String> {
        self.worker_or(
            "depth sort",
            |worker| worker.sort_by_depth(ids.clone()),
            || self.index.sort_by_depth(&ids),
        )
    }

    /// Snap calculation on the worker mirror, falling back to the
    /// synchronous index.
    pub fn background_snap(&self, id: &str, x: f64, y: f64) -> SnapResult {
        let threshold = self.config.snap_threshold;
        self.worker_or(
            "snap calculation",
            |worker| worker.calculate_snap(id, x, y, threshold),
            || self.index.calculate_snap(id, x, y, threshold),
        )
    }

    // ===== Introspection =====

    /// Get statistics across all components.
    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            index: self.index.stats(),
            cache: self.cache.stats()?,
            loader: self.loader.stats(),
            worker_attached: self.worker.is_some(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Direct read access to the synchronous index.
    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    /// The shared image cache handle.
    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// The region loader handle.
    pub fn loader(&self) -> &RegionLoader {
        &self.loader
    }

    /// Stop background work: cancels the sweep and in-flight loads, then
    /// joins the worker thread. The engine stays usable synchronously.
    pub fn shutdown(&mut self) -> Result<()> {
        self.loader.cancel_sweep();
        self.cache.cancel_all()?;
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown()?;
        }
        Ok(())
    }

    fn worker_or<T>(
        &self,
        op: &str,
        attempt: impl FnOnce(&WorkerBridge) -> Result<T>,
        fallback: impl FnOnce() -> T,
    ) -> T {
        if let Some(worker) = &self.worker {
            match attempt(worker) {
                Ok(value) => {
                    self.note_worker_recovery();
                    return value;
                }
                Err(err) => self.note_worker_failure(op, &err),
            }
        }
        fallback()
    }

    fn note_worker_failure(&self, op: &str, err: &EngineError) {
        if !self.worker_degraded.swap(true, Ordering::Relaxed) {
            log::warn!("Worker {op} failed, serving from the synchronous index: {err}");
        } else {
            log::debug!("Worker {op} failed while degraded: {err}");
        }
    }

    fn note_worker_recovery(&self) {
        if self.worker_degraded.swap(false, Ordering::Relaxed) {
            log::info!("Worker recovered");
        }
    }
}

// The facade is shared across render and input threads
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<Engine>;
};

fn ids_of(elements: Vec<&CanvasElement>) -> Vec<String> {
    elements.into_iter().map(|e| e.id.clone()).collect()
}
