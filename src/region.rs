//! Region-based progressive asset loading.
//!
//! The canvas is divided into a fixed grid; as the viewport moves, the loader
//! sweeps the covering grid cells plus a configurable ring of neighbors,
//! nearest first, and warms the image cache for the stickers found in each.
//! Sweeps run on a background thread and are superseded (not queued) when the
//! viewport moves again.
//!
//! Region state is ephemeral. A region is attempted at most once per session
//! unless [`RegionLoader::reload_region`] or
//! [`RegionLoader::clear_distant_regions`] forgets it.

use geo::{Coord, Rect};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use stickerboard_types::element::CanvasElement;
use stickerboard_types::viewport::ViewportBounds;

use crate::cache::{CancelToken, ImageCache};
use crate::lod::{self, LodLevel};
use crate::spatial::{element_bounds, rects_intersect};
use crate::types::EngineConfig;

/// Identifier of one grid cell: `(⌊x/cell_size⌋, ⌊y/cell_size⌋)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionKey {
    pub col: i32,
    pub row: i32,
}

impl RegionKey {
    pub fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }

    /// Canvas-space rectangle of this cell.
    pub fn rect(&self, cell_size: f64) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.col as f64 * cell_size,
                y: self.row as f64 * cell_size,
            },
            Coord {
                x: (self.col + 1) as f64 * cell_size,
                y: (self.row + 1) as f64 * cell_size,
            },
        )
    }

    /// Canvas-space center of this cell.
    pub fn center(&self, cell_size: f64) -> Coord<f64> {
        Coord {
            x: (self.col as f64 + 0.5) * cell_size,
            y: (self.row as f64 + 0.5) * cell_size,
        }
    }
}

/// The cell containing a canvas-space point.
pub fn region_for_point(x: f64, y: f64, cell_size: f64) -> RegionKey {
    RegionKey {
        col: (x / cell_size).floor() as i32,
        row: (y / cell_size).floor() as i32,
    }
}

/// Every cell touched by a rectangle.
pub fn regions_covering(rect: &Rect<f64>, cell_size: f64) -> Vec<RegionKey> {
    let min = region_for_point(rect.min().x, rect.min().y, cell_size);
    let max = region_for_point(rect.max().x, rect.max().y, cell_size);
    let mut keys = Vec::with_capacity(
        ((max.col - min.col + 1) as usize).saturating_mul((max.row - min.row + 1) as usize),
    );
    for row in min.row..=max.row {
        for col in min.col..=max.col {
            keys.push(RegionKey { col, row });
        }
    }
    keys
}

/// The cells covering a viewport plus `depth` rings of neighbors, ordered by
/// distance of each cell's center from the viewport center (nearest first).
///
/// Returns an empty list for a degenerate cell size or a non-finite viewport.
///
/// # Examples
///
/// ```rust
/// use stickerboard::region::{visible_regions, RegionKey};
/// use stickerboard_types::viewport::ViewportBounds;
///
/// let vp = ViewportBounds::new(0.0, 0.0, 400.0, 300.0);
/// assert_eq!(visible_regions(&vp, 512.0, 0), vec![RegionKey::new(0, 0)]);
/// assert_eq!(visible_regions(&vp, 512.0, 1).len(), 9);
/// ```
pub fn visible_regions(viewport: &ViewportBounds, cell_size: f64, depth: u32) -> Vec<RegionKey> {
    if !cell_size.is_finite() || cell_size <= 0.0 {
        return Vec::new();
    }
    if !(viewport.x.is_finite()
        && viewport.y.is_finite()
        && viewport.width.is_finite()
        && viewport.height.is_finite())
    {
        return Vec::new();
    }

    let min = region_for_point(viewport.x, viewport.y, cell_size);
    let max = region_for_point(viewport.x + viewport.width, viewport.y + viewport.height, cell_size);
    let ring = depth as i32;

    let mut keys = Vec::new();
    for row in (min.row - ring)..=(max.row + ring) {
        for col in (min.col - ring)..=(max.col + ring) {
            keys.push(RegionKey { col, row });
        }
    }

    let center = viewport.center();
    keys.sort_by(|a, b| {
        let da = center_distance_sq(a, cell_size, &center);
        let db = center_distance_sq(b, cell_size, &center);
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    });
    keys
}

/// Statistics about the region loader.
#[derive(Debug, Clone, Default)]
pub struct LoaderStats {
    /// Regions attempted this session
    pub visited_regions: usize,
    /// Sweeps spawned by viewport updates
    pub sweeps_started: u64,
    /// Sweeps that stopped early because a newer sweep superseded them
    pub sweeps_cancelled: u64,
    /// Image loads handed to the cache, sweeps and upgrade passes combined
    pub images_requested: u64,
}

struct LoaderShared {
    /// Element snapshot, replaced wholesale on structural change.
    elements: Mutex<Arc<Vec<CanvasElement>>>,
    visited: Mutex<FxHashSet<RegionKey>>,
    last_viewport: Mutex<Option<ViewportBounds>>,
    /// Cancel token of the newest sweep; superseded on every sweep start.
    current_sweep: Mutex<CancelToken>,
    generation: AtomicU64,
    sweeps_started: AtomicU64,
    sweeps_cancelled: AtomicU64,
    images_requested: AtomicU64,
}

/// Progressive asset loader over the region grid.
///
/// `RegionLoader` is a cloneable handle; clones share bookkeeping, so a sweep
/// started through one handle is observed (and superseded) through any other.
#[derive(Clone)]
pub struct RegionLoader {
    shared: Arc<LoaderShared>,
    cache: ImageCache,
    cell_size: f64,
    prefetch_depth: u32,
    load_batch_size: usize,
    upgrade_pass_limit: usize,
}

impl RegionLoader {
    pub fn new(config: &EngineConfig, cache: ImageCache) -> Self {
        Self {
            shared: Arc::new(LoaderShared {
                elements: Mutex::new(Arc::new(Vec::new())),
                visited: Mutex::new(FxHashSet::default()),
                last_viewport: Mutex::new(None),
                current_sweep: Mutex::new(CancelToken::new()),
                generation: AtomicU64::new(0),
                sweeps_started: AtomicU64::new(0),
                sweeps_cancelled: AtomicU64::new(0),
                images_requested: AtomicU64::new(0),
            }),
            cache,
            cell_size: config.cell_size,
            prefetch_depth: config.prefetch_depth,
            load_batch_size: config.load_batch_size.max(1),
            upgrade_pass_limit: config.upgrade_pass_limit,
        }
    }

    /// Replace the element snapshot sweeps read from.
    ///
    /// Call on every structural change. A sweep already in flight keeps its
    /// old snapshot; the next sweep sees the new one.
    pub fn set_elements(&self, elements: &[CanvasElement]) {
        *self.shared.elements.lock() = Arc::new(elements.to_vec());
    }

    /// React to viewport movement: start a background sweep over the visible
    /// regions (plus the prefetch ring) that have not been attempted yet.
    ///
    /// Already-visited viewports are a no-op; a still-running sweep for an
    /// older viewport is superseded, not awaited.
    pub fn update_viewport(&self, viewport: &ViewportBounds, zoom: f64) {
        *self.shared.last_viewport.lock() = Some(*viewport);

        let regions = visible_regions(viewport, self.cell_size, self.prefetch_depth);
        if regions.is_empty() {
            return;
        }

        let pending: Vec<RegionKey> = {
            let visited = self.shared.visited.lock();
            regions.into_iter().filter(|key| !visited.contains(key)).collect()
        };
        if pending.is_empty() {
            return;
        }

        log::debug!("Sweeping {} unvisited regions at zoom {zoom}", pending.len());
        self.start_sweep(pending, lod::lod_for_zoom(zoom));
    }

    /// Bounded LOD-upgrade pass after a zoom band change.
    ///
    /// Schedules background loads for up to `upgrade_pass_limit` visible
    /// sticker images whose variant at the new tier is not cached yet.
    /// Returns the number scheduled.
    pub fn on_zoom_change(&self, visible: &[CanvasElement], zoom: f64) -> usize {
        if self.upgrade_pass_limit == 0 {
            return 0;
        }

        let level = lod::lod_for_zoom(zoom);
        let mut seen = FxHashSet::default();
        let mut missing: Vec<String> = Vec::new();
        for element in visible {
            let Some(url) = element.image_url() else {
                continue;
            };
            if !seen.insert(url) {
                continue;
            }
            if self.cache.contains(url, level).unwrap_or(false) {
                continue;
            }
            missing.push(url.to_string());
            if missing.len() == self.upgrade_pass_limit {
                break;
            }
        }

        if missing.is_empty() {
            return 0;
        }
        let count = missing.len();
        self.shared
            .images_requested
            .fetch_add(count as u64, Ordering::Relaxed);
        log::debug!("Upgrading {count} images to {level}");

        let cache = self.cache.clone();
        thread::spawn(move || {
            cache.preload(&missing, level);
        });
        count
    }

    /// Forget visited bookkeeping for regions outside the last viewport
    /// scaled by `buffer_multiplier` around its center. Cache contents are
    /// untouched; re-entering a forgotten region triggers a fresh sweep.
    /// Returns the number of regions forgotten.
    pub fn clear_distant_regions(&self, buffer_multiplier: f64) -> usize {
        let Some(viewport) = *self.shared.last_viewport.lock() else {
            return 0;
        };

        let center = viewport.center();
        let half_w = viewport.width * buffer_multiplier / 2.0;
        let half_h = viewport.height * buffer_multiplier / 2.0;
        let keep = Rect::new(
            Coord {
                x: center.x - half_w,
                y: center.y - half_h,
            },
            Coord {
                x: center.x + half_w,
                y: center.y + half_h,
            },
        );

        let cell_size = self.cell_size;
        let mut visited = self.shared.visited.lock();
        let before = visited.len();
        visited.retain(|key| rects_intersect(&key.rect(cell_size), &keep));
        before - visited.len()
    }

    /// Forget one region's bookkeeping so the next sweep re-attempts it.
    /// Returns whether the region had been visited.
    pub fn reload_region(&self, key: RegionKey) -> bool {
        self.shared.visited.lock().remove(&key)
    }

    /// Stop the sweep in flight, if any. Newer sweeps are unaffected.
    pub fn cancel_sweep(&self) {
        self.shared.current_sweep.lock().cancel();
    }

    /// Get statistics about the loader.
    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            visited_regions: self.shared.visited.lock().len(),
            sweeps_started: self.shared.sweeps_started.load(Ordering::Relaxed),
            sweeps_cancelled: self.shared.sweeps_cancelled.load(Ordering::Relaxed),
            images_requested: self.shared.images_requested.load(Ordering::Relaxed),
        }
    }

    fn start_sweep(&self, regions: Vec<RegionKey>, level: LodLevel) {
        let cancel = CancelToken::new();
        {
            let mut current = self.shared.current_sweep.lock();
            current.cancel();
            *current = cancel.clone();
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.sweeps_started.fetch_add(1, Ordering::Relaxed);

        let shared = Arc::clone(&self.shared);
        let cache = self.cache.clone();
        let elements = Arc::clone(&self.shared.elements.lock());
        let cell_size = self.cell_size;
        let batch_size = self.load_batch_size;

        thread::spawn(move || {
            run_sweep(SweepContext {
                shared,
                cache,
                elements,
                regions,
                level,
                cell_size,
                batch_size,
                generation,
                cancel,
            });
        });
    }
}

// Ensure the loader handle crosses threads
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<RegionLoader>;
};

struct SweepContext {
    shared: Arc<LoaderShared>,
    cache: ImageCache,
    elements: Arc<Vec<CanvasElement>>,
    regions: Vec<RegionKey>,
    level: LodLevel,
    cell_size: f64,
    batch_size: usize,
    generation: u64,
    cancel: CancelToken,
}

impl SweepContext {
    fn superseded(&self) -> bool {
        self.cancel.is_cancelled()
            || self.shared.generation.load(Ordering::SeqCst) != self.generation
    }
}

fn run_sweep(ctx: SweepContext) {
    for key in &ctx.regions {
        if ctx.superseded() {
            ctx.shared.sweeps_cancelled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Attempted is terminal, even when every load in the region fails.
        if !ctx.shared.visited.lock().insert(*key) {
            continue;
        }

        let urls = region_urls(&ctx.elements, key, ctx.cell_size);
        for batch in urls.chunks(ctx.batch_size) {
            if ctx.superseded() {
                ctx.shared.sweeps_cancelled.fetch_add(1, Ordering::Relaxed);
                return;
            }
            ctx.shared
                .images_requested
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            ctx.cache.preload(batch, ctx.level);
            thread::yield_now();
        }
    }
}

/// Distinct sticker image URLs of elements intersecting a region.
fn region_urls(elements: &[CanvasElement], key: &RegionKey, cell_size: f64) -> Vec<String> {
    let rect = key.rect(cell_size);
    let mut seen = FxHashSet::default();
    let mut urls = Vec::new();
    for element in elements {
        let Some(url) = element.image_url() else {
            continue;
        };
        if rects_intersect(&element_bounds(element), &rect) && seen.insert(url) {
            urls.push(url.to_string());
        }
    }
    urls
}

#[inline]
fn center_distance_sq(key: &RegionKey, cell_size: f64, center: &Coord<f64>) -> f64 {
    let c = key.center(cell_size);
    let dx = c.x - center.x;
    let dy = c.y - center.y;
    dx * dx + dy * dy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DecodedImage, ImageFetcher};
    use crate::error::{EngineError, Result};
    use crate::types::TickClock;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Condvar;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ImageFetcher for CountingFetcher {
        fn fetch(&self, _url: &str, _cancel: &CancelToken) -> Result<DecodedImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DecodedImage::new(4, 4, vec![0u8; 64]))
        }
    }

    /// Blocks every fetch until the shared gate opens.
    struct GatedFetcher {
        gate: Arc<(StdMutex<bool>, Condvar)>,
        calls: AtomicUsize,
    }

    impl GatedFetcher {
        fn new() -> (Self, Arc<(StdMutex<bool>, Condvar)>) {
            let gate = Arc::new((StdMutex::new(false), Condvar::new()));
            (
                Self {
                    gate: Arc::clone(&gate),
                    calls: AtomicUsize::new(0),
                },
                gate,
            )
        }
    }

    impl ImageFetcher for GatedFetcher {
        fn fetch(&self, _url: &str, _cancel: &CancelToken) -> Result<DecodedImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (lock, cv) = &*self.gate;
            let mut open = lock.lock().map_err(|_| EngineError::Lock)?;
            while !*open {
                open = cv.wait(open).map_err(|_| EngineError::Lock)?;
            }
            Ok(DecodedImage::new(4, 4, vec![0u8; 64]))
        }
    }

    fn open_gate(gate: &Arc<(StdMutex<bool>, Condvar)>) {
        let (lock, cv) = &**gate;
        *lock.lock().unwrap() = true;
        cv.notify_all();
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig::default()
            .with_cell_size(512.0)
            .with_prefetch_depth(0)
            .with_load_batch_size(10)
    }

    fn loader_with(
        config: &EngineConfig,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> (RegionLoader, ImageCache) {
        let cache = ImageCache::new(64 * 1024 * 1024, fetcher, Arc::new(TickClock::new()));
        (RegionLoader::new(config, cache.clone()), cache)
    }

    fn sticker(id: &str, url: &str, x: f64, y: f64) -> CanvasElement {
        CanvasElement::sticker(id, url, x, y, 100.0, 100.0)
    }

    #[test]
    fn test_region_for_point_floors() {
        assert_eq!(region_for_point(0.0, 0.0, 512.0), RegionKey::new(0, 0));
        assert_eq!(region_for_point(511.9, 511.9, 512.0), RegionKey::new(0, 0));
        assert_eq!(region_for_point(512.0, 0.0, 512.0), RegionKey::new(1, 0));
        assert_eq!(region_for_point(-0.1, -600.0, 512.0), RegionKey::new(-1, -2));
    }

    #[test]
    fn test_region_rect_and_center() {
        let key = RegionKey::new(-1, 2);
        let rect = key.rect(100.0);
        assert_eq!(rect.min().x, -100.0);
        assert_eq!(rect.min().y, 200.0);
        assert_eq!(rect.max().x, 0.0);
        assert_eq!(rect.max().y, 300.0);

        let c = key.center(100.0);
        assert_eq!((c.x, c.y), (-50.0, 250.0));
    }

    #[test]
    fn test_regions_covering_spans_cells() {
        let rect = Rect::new(Coord { x: -10.0, y: -10.0 }, Coord { x: 10.0, y: 10.0 });
        let keys = regions_covering(&rect, 512.0);
        assert_eq!(keys.len(), 4);
        assert!(keys.contains(&RegionKey::new(-1, -1)));
        assert!(keys.contains(&RegionKey::new(0, 0)));
    }

    #[test]
    fn test_visible_regions_depth_one_ring() {
        let vp = ViewportBounds::new(0.0, 0.0, 100.0, 100.0);
        let keys = visible_regions(&vp, 512.0, 1);

        assert_eq!(keys.len(), 9);
        assert_eq!(keys[0], RegionKey::new(0, 0));

        let center = vp.center();
        let distances: Vec<f64> = keys
            .iter()
            .map(|k| center_distance_sq(k, 512.0, &center))
            .collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_visible_regions_zero_depth() {
        let vp = ViewportBounds::new(0.0, 0.0, 1000.0, 100.0);
        let keys = visible_regions(&vp, 512.0, 0);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&RegionKey::new(0, 0)));
        assert!(keys.contains(&RegionKey::new(1, 0)));
    }

    #[test]
    fn test_visible_regions_rejects_degenerate_input() {
        let vp = ViewportBounds::new(0.0, 0.0, 100.0, 100.0);
        assert!(visible_regions(&vp, 0.0, 1).is_empty());
        assert!(visible_regions(&vp, -5.0, 1).is_empty());
        assert!(visible_regions(&vp, f64::NAN, 1).is_empty());

        let bad = ViewportBounds::new(f64::NAN, 0.0, 100.0, 100.0);
        assert!(visible_regions(&bad, 512.0, 1).is_empty());
    }

    #[test]
    fn test_sweep_loads_intersecting_sticker_images() {
        let fetcher = Arc::new(CountingFetcher::new());
        let (loader, cache) = loader_with(&test_config(), fetcher.clone());

        loader.set_elements(&[
            sticker("a", "https://files.test/a.png", 10.0, 10.0),
            sticker("b", "https://files.test/b.png", 200.0, 200.0),
            // In a different region entirely.
            sticker("far", "https://files.test/far.png", 5000.0, 5000.0),
            CanvasElement::text("label", "hi", 50.0, 50.0, 16.0),
        ]);

        loader.update_viewport(&ViewportBounds::new(0.0, 0.0, 400.0, 400.0), 1.0);
        wait_for(|| loader.stats().visited_regions == 1);
        wait_for(|| fetcher.calls() == 2);

        assert!(cache.contains("https://files.test/a.png", LodLevel::High).unwrap());
        assert!(cache.contains("https://files.test/b.png", LodLevel::High).unwrap());
        assert!(!cache.contains("https://files.test/far.png", LodLevel::High).unwrap());

        let stats = loader.stats();
        assert_eq!(stats.sweeps_started, 1);
        assert_eq!(stats.images_requested, 2);
    }

    #[test]
    fn test_unchanged_viewport_is_noop() {
        let fetcher = Arc::new(CountingFetcher::new());
        let (loader, _cache) = loader_with(&test_config(), fetcher.clone());
        loader.set_elements(&[sticker("a", "https://files.test/a.png", 10.0, 10.0)]);

        let vp = ViewportBounds::new(0.0, 0.0, 400.0, 400.0);
        loader.update_viewport(&vp, 1.0);
        wait_for(|| fetcher.calls() == 1);

        loader.update_viewport(&vp, 1.0);
        thread::sleep(Duration::from_millis(20));

        let stats = loader.stats();
        assert_eq!(stats.sweeps_started, 1);
        assert_eq!(stats.images_requested, 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn test_attempted_region_retried_only_after_reload() {
        let fetcher = Arc::new(CountingFetcher::new());
        let (loader, cache) = loader_with(&test_config(), fetcher.clone());
        loader.set_elements(&[sticker("a", "https://files.test/a.png", 10.0, 10.0)]);

        let vp = ViewportBounds::new(0.0, 0.0, 400.0, 400.0);
        loader.update_viewport(&vp, 1.0);
        wait_for(|| fetcher.calls() == 1);

        // Eviction does not reset bookkeeping.
        cache.clear().unwrap();
        loader.update_viewport(&vp, 1.0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fetcher.calls(), 1);

        assert!(loader.reload_region(RegionKey::new(0, 0)));
        loader.update_viewport(&vp, 1.0);
        wait_for(|| fetcher.calls() == 2);
        assert_eq!(loader.stats().sweeps_started, 2);
    }

    #[test]
    fn test_new_sweep_supersedes_previous() {
        let (fetcher, gate) = GatedFetcher::new();
        let fetcher = Arc::new(fetcher);
        let config = test_config().with_load_batch_size(1);
        let (loader, _cache) = loader_with(&config, fetcher.clone());

        loader.set_elements(&[
            sticker("a", "https://files.test/a.png", 10.0, 10.0),
            sticker("b", "https://files.test/b.png", 200.0, 200.0),
            sticker("c", "https://files.test/c.png", 300.0, 300.0),
            sticker("far", "https://files.test/far.png", 5000.0, 5000.0),
        ]);

        // First sweep blocks inside its first fetch.
        loader.update_viewport(&ViewportBounds::new(0.0, 0.0, 400.0, 400.0), 1.0);
        wait_for(|| fetcher.calls.load(Ordering::SeqCst) == 1);

        // A distant viewport supersedes it before batches two and three.
        loader.update_viewport(&ViewportBounds::new(4900.0, 4900.0, 400.0, 400.0), 1.0);
        open_gate(&gate);

        wait_for(|| loader.stats().sweeps_cancelled == 1);
        let stats = loader.stats();
        assert_eq!(stats.sweeps_started, 2);
        // Fetch one from the superseded sweep, one from the new sweep.
        wait_for(|| fetcher.calls.load(Ordering::SeqCst) == 2);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_sweep_stops_loads() {
        let (fetcher, gate) = GatedFetcher::new();
        let fetcher = Arc::new(fetcher);
        let config = test_config().with_load_batch_size(1);
        let (loader, _cache) = loader_with(&config, fetcher.clone());

        loader.set_elements(&[
            sticker("a", "https://files.test/a.png", 10.0, 10.0),
            sticker("b", "https://files.test/b.png", 200.0, 200.0),
        ]);

        loader.update_viewport(&ViewportBounds::new(0.0, 0.0, 400.0, 400.0), 1.0);
        wait_for(|| fetcher.calls.load(Ordering::SeqCst) == 1);

        loader.cancel_sweep();
        open_gate(&gate);

        wait_for(|| loader.stats().sweeps_cancelled == 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_zoom_change_respects_limit() {
        let fetcher = Arc::new(CountingFetcher::new());
        let config = test_config().with_upgrade_pass_limit(3);
        let (loader, cache) = loader_with(&config, fetcher.clone());

        let visible: Vec<CanvasElement> = (0..5)
            .map(|i| sticker(&format!("s{i}"), &format!("https://files.test/{i}.png"), 0.0, 0.0))
            .collect();

        assert_eq!(loader.on_zoom_change(&visible, 3.0), 3);
        wait_for(|| cache.stats().unwrap().entries == 3);
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(loader.stats().images_requested, 3);
    }

    #[test]
    fn test_on_zoom_change_skips_cached_variants() {
        let fetcher = Arc::new(CountingFetcher::new());
        let (loader, cache) = loader_with(&test_config(), fetcher.clone());

        cache
            .load("https://files.test/0.png", LodLevel::UltraHigh, crate::types::LoadPriority::Normal)
            .unwrap();

        let visible = vec![
            sticker("s0", "https://files.test/0.png", 0.0, 0.0),
            sticker("s1", "https://files.test/1.png", 0.0, 0.0),
        ];

        // The zoom-3.0 tier variant of s0 is already resident.
        assert_eq!(loader.on_zoom_change(&visible, 3.0), 1);
        wait_for(|| fetcher.calls() == 2);

        // Same tier again: everything cached, nothing scheduled.
        assert_eq!(loader.on_zoom_change(&visible, 3.0), 0);
    }

    #[test]
    fn test_clear_distant_regions_keeps_near_set() {
        let fetcher = Arc::new(CountingFetcher::new());
        let config = test_config().with_cell_size(100.0).with_prefetch_depth(1);
        let (loader, _cache) = loader_with(&config, fetcher);
        loader.set_elements(&[]);

        // 99x99 stays inside cell (0, 0); the ring makes a 3x3 block.
        let vp = ViewportBounds::new(0.0, 0.0, 99.0, 99.0);
        loader.update_viewport(&vp, 1.0);
        wait_for(|| loader.stats().visited_regions == 9);

        // Half-size keep window retains only the center region.
        assert_eq!(loader.clear_distant_regions(0.5), 8);
        assert_eq!(loader.stats().visited_regions, 1);

        // Re-entry re-attempts the forgotten ring.
        loader.update_viewport(&vp, 1.0);
        wait_for(|| loader.stats().visited_regions == 9);
        assert_eq!(loader.stats().sweeps_started, 2);
    }

    #[test]
    fn test_clear_distant_before_any_viewport_is_noop() {
        let fetcher = Arc::new(CountingFetcher::new());
        let (loader, _cache) = loader_with(&test_config(), fetcher);
        assert_eq!(loader.clear_distant_regions(2.0), 0);
        assert!(!loader.reload_region(RegionKey::new(0, 0)));
    }

    #[test]
    fn test_snapshot_refresh_feeds_next_sweep() {
        let fetcher = Arc::new(CountingFetcher::new());
        let (loader, cache) = loader_with(&test_config(), fetcher.clone());

        loader.set_elements(&[sticker("a", "https://files.test/a.png", 10.0, 10.0)]);
        loader.update_viewport(&ViewportBounds::new(0.0, 0.0, 400.0, 400.0), 1.0);
        wait_for(|| fetcher.calls() == 1);

        loader.set_elements(&[
            sticker("a", "https://files.test/a.png", 10.0, 10.0),
            sticker("b", "https://files.test/b.png", 5000.0, 5000.0),
        ]);
        loader.update_viewport(&ViewportBounds::new(4900.0, 4900.0, 400.0, 400.0), 1.0);
        wait_for(|| cache.contains("https://files.test/b.png", LodLevel::High).unwrap());
    }
}
