//! Memory-budgeted LRU cache for decoded sticker images.
//!
//! Entries are keyed by `(url, LOD level)` so the same asset can exist at
//! several fidelities. Concurrent loads of one key are coalesced into a
//! single fetch, and loads carry a cancel token so a pan away from a region
//! can abandon work the viewport no longer needs.

use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{EngineError, Result};
use crate::lod::{self, CdnProvider, LodLevel};
use crate::types::{Clock, LoadPriority};

type CacheKey = (String, LodLevel);

/// The recency queue is compacted once it holds more than
/// `max(RECENCY_COMPACT_MIN, 2 * entries)` pairs.
const RECENCY_COMPACT_MIN: usize = 64;

/// Cooperative cancellation flag shared between a caller and a fetch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A decoded RGBA image.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 rows.
    pub pixels: Bytes,
}

impl DecodedImage {
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    /// Budgeted size estimate: width x height x 4, independent of the
    /// encoded form the bytes arrived in.
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// The network/decode edge of the cache.
///
/// Implementations are expected to poll `cancel` at natural pause points and
/// return [`EngineError::Cancelled`] once it trips. Tests inject stubs.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str, cancel: &CancelToken) -> Result<DecodedImage>;
}

#[derive(Clone)]
enum SharedLoadResult {
    Success(DecodedImage),
    Error(EngineError),
}

impl SharedLoadResult {
    fn as_result(&self) -> Result<DecodedImage> {
        match self {
            Self::Success(image) => Ok(image.clone()),
            Self::Error(err) => Err(err.clone()),
        }
    }
}

/// One in-flight fetch that concurrent callers of the same key share.
struct LoadInFlight {
    result: Mutex<Option<SharedLoadResult>>,
    cv: Condvar,
    cancel: CancelToken,
}

impl LoadInFlight {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
            cancel: CancelToken::new(),
        }
    }

    fn set(&self, result: SharedLoadResult) {
        if let Ok(mut slot) = self.result.lock() {
            *slot = Some(result);
            self.cv.notify_all();
        }
    }

    fn wait(&self) -> Result<DecodedImage> {
        let mut guard = self.result.lock().map_err(|_| EngineError::Lock)?;
        while guard.is_none() {
            guard = self.cv.wait(guard).map_err(|_| EngineError::Lock)?;
        }
        match &*guard {
            Some(result) => result.as_result(),
            None => Err(EngineError::Lock),
        }
    }
}

/// Settles a flight exactly once on every owner exit path.
///
/// The owner calls `settle` with the fetch outcome; if it unwinds or bails
/// out early instead, the drop settles the flight with an error so waiters
/// are woken and the key is unregistered rather than joinable forever.
struct FlightGuard<'a> {
    cache: &'a ImageCache,
    key: &'a CacheKey,
    flight: &'a Arc<LoadInFlight>,
    settled: bool,
}

impl FlightGuard<'_> {
    fn settle(mut self, result: SharedLoadResult) {
        self.cache.finish_inflight(self.key, self.flight, result);
        self.settled = true;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let error = EngineError::Fetch {
                url: self.key.0.clone(),
                message: "fetch did not complete".to_string(),
            };
            self.cache
                .finish_inflight(self.key, self.flight, SharedLoadResult::Error(error));
        }
    }
}

struct CacheEntry {
    image: DecodedImage,
    last_access: u64,
    bytes: usize,
}

struct CacheInner {
    entries: FxHashMap<CacheKey, CacheEntry>,
    /// LRU bookkeeping: every access pushes a fresh `(stamp, key)` pair;
    /// eviction pops from the front and skips pairs whose stamp no longer
    /// matches the entry's latest access. `touch` compacts the queue when
    /// stale pairs pile up faster than eviction drains them.
    access_order: VecDeque<(u64, CacheKey)>,
    total_bytes: usize,
    budget: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    cancellations: u64,
}

impl CacheInner {
    /// Evict least-recently-accessed entries until `incoming` more bytes fit
    /// within the budget. Runs before an insert; the incoming entry itself
    /// may still push the total past the budget when nothing is left to
    /// evict.
    fn ensure_capacity(&mut self, incoming: usize) {
        while self.total_bytes + incoming > self.budget {
            let Some((stamp, key)) = self.access_order.pop_front() else {
                break;
            };

            // Stale pairs from later re-accesses are skipped.
            let current = match self.entries.get(&key) {
                Some(entry) => entry.last_access == stamp,
                None => false,
            };
            if !current {
                continue;
            }

            if let Some(removed) = self.entries.remove(&key) {
                self.total_bytes = self.total_bytes.saturating_sub(removed.bytes);
                self.evictions += 1;
            }
        }
    }

    /// Record an access. Hit-heavy workloads that stay under budget never
    /// reach `ensure_capacity`, so stale pairs are dropped here once the
    /// queue outgrows the live entry set.
    fn touch(&mut self, stamp: u64, key: CacheKey) {
        self.access_order.push_back((stamp, key));
        let cap = RECENCY_COMPACT_MIN.max(self.entries.len() * 2);
        if self.access_order.len() > cap {
            let entries = &self.entries;
            self.access_order
                .retain(|(stamp, key)| match entries.get(key) {
                    Some(entry) => entry.last_access == *stamp,
                    None => false,
                });
        }
    }
}

/// Shared, cloneable image cache handle.
///
/// All clones see the same entries. Loads may be issued from any thread; the
/// interactive thread and the region loader's sweep thread share one cache.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use stickerboard::cache::{ImageCache, ImageFetcher};
/// use stickerboard::lod::LodLevel;
/// use stickerboard::types::{LoadPriority, TickClock};
///
/// # fn fetcher() -> Arc<dyn ImageFetcher> { unimplemented!() }
/// let cache = ImageCache::new(64 * 1024 * 1024, fetcher(), Arc::new(TickClock::new()));
/// let image = cache.load("https://images.unsplash.com/photo-1", LodLevel::High, LoadPriority::Normal)?;
/// assert!(image.width > 0);
/// # stickerboard::Result::Ok(())
/// ```
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<RwLock<CacheInner>>,
    in_flight: Arc<Mutex<FxHashMap<CacheKey, Arc<LoadInFlight>>>>,
    fetcher: Arc<dyn ImageFetcher>,
    clock: Arc<dyn Clock>,
    providers: Arc<Vec<CdnProvider>>,
}

impl ImageCache {
    /// Create a cache with the built-in CDN provider table.
    pub fn new(budget: usize, fetcher: Arc<dyn ImageFetcher>, clock: Arc<dyn Clock>) -> Self {
        Self::with_providers(budget, fetcher, clock, lod::default_providers().to_vec())
    }

    /// Create a cache with an explicit CDN provider table.
    pub fn with_providers(
        budget: usize,
        fetcher: Arc<dyn ImageFetcher>,
        clock: Arc<dyn Clock>,
        providers: Vec<CdnProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                entries: FxHashMap::default(),
                access_order: VecDeque::new(),
                total_bytes: 0,
                budget,
                hits: 0,
                misses: 0,
                evictions: 0,
                cancellations: 0,
            })),
            in_flight: Arc::new(Mutex::new(FxHashMap::default())),
            fetcher,
            clock,
            providers: Arc::new(providers),
        }
    }

    /// Load an image, fetching and caching it on a miss.
    ///
    /// A cached hit returns immediately and refreshes recency. When another
    /// load of the same `(url, level)` is already in flight the call blocks
    /// on that fetch and shares its outcome, so each key fetches at most
    /// once at a time. Failures propagate to every waiting caller; a fetch
    /// that panics settles the flight with an error instead of stranding
    /// its waiters.
    ///
    /// `priority` is advisory; it shows up in the debug log, not in
    /// scheduling.
    pub fn load(&self, url: &str, level: LodLevel, priority: LoadPriority) -> Result<DecodedImage> {
        let key = (url.to_string(), level);

        if let Some(image) = self.get(url, level)? {
            return Ok(image);
        }

        let (flight, is_owner) = self.join_inflight(&key)?;
        if !is_owner {
            {
                let mut inner = self.write()?;
                inner.hits += 1;
            }
            return flight.wait();
        }

        let guard = FlightGuard {
            cache: self,
            key: &key,
            flight: &flight,
            settled: false,
        };

        // A previous owner may have landed the entry between our miss above
        // and the flight registration. Serve it rather than fetching twice.
        if let Some(image) = self.get(url, level)? {
            guard.settle(SharedLoadResult::Success(image.clone()));
            return Ok(image);
        }

        {
            let mut inner = self.write()?;
            inner.misses += 1;
        }
        log::debug!("Fetching '{url}' at {level} ({priority:?} priority)");

        let result = self.fetch_and_insert(url, level, &flight.cancel);
        let shared = match &result {
            Ok(image) => SharedLoadResult::Success(image.clone()),
            Err(err) => SharedLoadResult::Error(err.clone()),
        };
        guard.settle(shared);
        result
    }

    /// Warm the cache for a batch of URLs at one level.
    ///
    /// Per-item failures are swallowed (logged at debug) so one bad asset
    /// cannot abort the batch. Returns the number of images now resident.
    pub fn preload(&self, urls: &[String], level: LodLevel) -> usize {
        let mut loaded = 0;
        for url in urls {
            match self.load(url, level, LoadPriority::Low) {
                Ok(_) => loaded += 1,
                Err(err) => log::debug!("Preload skipped '{url}': {err}"),
            }
        }
        loaded
    }

    /// Get a cached image, bumping its recency. `None` on a miss.
    pub fn get(&self, url: &str, level: LodLevel) -> Result<Option<DecodedImage>> {
        let mut inner = self.write()?;
        let stamp = self.clock.now();
        let key = (url.to_string(), level);

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.last_access = stamp;
            let image = entry.image.clone();
            inner.touch(stamp, key);
            inner.hits += 1;
            return Ok(Some(image));
        }
        Ok(None)
    }

    /// Whether an entry is resident. Does not touch recency.
    pub fn contains(&self, url: &str, level: LodLevel) -> Result<bool> {
        let inner = self.read()?;
        Ok(inner.entries.contains_key(&(url.to_string(), level)))
    }

    /// Drop one entry. Returns whether it was resident.
    pub fn remove(&self, url: &str, level: LodLevel) -> Result<bool> {
        let mut inner = self.write()?;
        if let Some(entry) = inner.entries.remove(&(url.to_string(), level)) {
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop every entry. Counters survive so stats stay cumulative.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.write()?;
        inner.entries.clear();
        inner.access_order.clear();
        inner.total_bytes = 0;
        Ok(())
    }

    /// Evict until `bytes` more would fit within the budget.
    pub fn ensure_capacity(&self, bytes: usize) -> Result<()> {
        let mut inner = self.write()?;
        inner.ensure_capacity(bytes);
        Ok(())
    }

    /// Cancel an in-flight load of `(url, level)`.
    ///
    /// Settled or unknown loads are a no-op. Returns whether a load was
    /// actually signalled.
    pub fn cancel(&self, url: &str, level: LodLevel) -> Result<bool> {
        let cancelled = {
            let flights = self.flights()?;
            match flights.get(&(url.to_string(), level)) {
                Some(flight) => {
                    flight.cancel.cancel();
                    true
                }
                None => false,
            }
        };

        if cancelled {
            let mut inner = self.write()?;
            inner.cancellations += 1;
        }
        Ok(cancelled)
    }

    /// Cancel every in-flight load. Returns how many were signalled.
    pub fn cancel_all(&self) -> Result<usize> {
        let count = {
            let flights = self.flights()?;
            for flight in flights.values() {
                flight.cancel.cancel();
            }
            flights.len()
        };

        if count > 0 {
            let mut inner = self.write()?;
            inner.cancellations += count as u64;
        }
        Ok(count)
    }

    /// Get statistics about the cache.
    pub fn stats(&self) -> Result<CacheStats> {
        let inner = self.read()?;
        let in_flight = self.flights()?.len();
        Ok(CacheStats {
            entries: inner.entries.len(),
            memory_bytes: inner.total_bytes,
            budget_bytes: inner.budget,
            in_flight,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            cancellations: inner.cancellations,
        })
    }

    fn fetch_and_insert(
        &self,
        url: &str,
        level: LodLevel,
        cancel: &CancelToken,
    ) -> Result<DecodedImage> {
        let transformed = lod::transform_url(url, level, &self.providers);
        let mut image = match &transformed {
            Some(rewritten) => self.fetcher.fetch(rewritten, cancel)?,
            None => self.fetcher.fetch(url, cancel)?,
        };

        // No CDN-side downscale happened; bound memory locally at the
        // coarse tiers.
        if transformed.is_none() && level <= LodLevel::Medium {
            image = downscale_to_fit(&image, level.settings().max_image_dimension);
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        self.insert(url, level, image.clone())?;
        Ok(image)
    }

    fn insert(&self, url: &str, level: LodLevel, image: DecodedImage) -> Result<()> {
        let bytes = image.byte_size();
        let mut inner = self.write()?;
        inner.ensure_capacity(bytes);

        let stamp = self.clock.now();
        let key = (url.to_string(), level);
        if let Some(old) = inner.entries.insert(
            key.clone(),
            CacheEntry {
                image,
                last_access: stamp,
                bytes,
            },
        ) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.bytes);
        }
        inner.total_bytes += bytes;
        inner.touch(stamp, key);
        Ok(())
    }

    fn join_inflight(&self, key: &CacheKey) -> Result<(Arc<LoadInFlight>, bool)> {
        let mut flights = self.flights()?;
        if let Some(existing) = flights.get(key) {
            return Ok((Arc::clone(existing), false));
        }

        let flight = Arc::new(LoadInFlight::new());
        flights.insert(key.clone(), Arc::clone(&flight));
        Ok((flight, true))
    }

    fn finish_inflight(&self, key: &CacheKey, flight: &Arc<LoadInFlight>, result: SharedLoadResult) {
        flight.set(result);
        if let Ok(mut flights) = self.in_flight.lock() {
            flights.remove(key);
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CacheInner>> {
        self.inner.read().map_err(|_| EngineError::Lock)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CacheInner>> {
        self.inner.write().map_err(|_| EngineError::Lock)
    }

    fn flights(&self) -> Result<MutexGuard<'_, FxHashMap<CacheKey, Arc<LoadInFlight>>>> {
        self.in_flight.lock().map_err(|_| EngineError::Lock)
    }
}

/// Statistics about the image cache.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Resident entries
    pub entries: usize,
    /// Estimated bytes held by resident entries
    pub memory_bytes: usize,
    /// Configured budget in bytes
    pub budget_bytes: usize,
    /// Loads currently in flight
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub cancellations: u64,
}

/// Box-filter downscale so the longest side fits `max_dimension`.
///
/// Images already within the limit are returned unchanged. Short pixel
/// buffers are tolerated; out-of-range source pixels simply do not
/// contribute.
fn downscale_to_fit(image: &DecodedImage, max_dimension: u32) -> DecodedImage {
    let largest = image.width.max(image.height);
    if max_dimension == 0 || largest <= max_dimension {
        return image.clone();
    }

    let scale = max_dimension as f64 / largest as f64;
    let out_w = ((image.width as f64 * scale).round() as usize).max(1);
    let out_h = ((image.height as f64 * scale).round() as usize).max(1);
    let src_w = image.width as usize;
    let src_h = image.height as usize;
    let src = &image.pixels;

    let mut out = vec![0u8; out_w * out_h * 4];
    for oy in 0..out_h {
        let y0 = oy * src_h / out_h;
        let y1 = ((oy + 1) * src_h).div_ceil(out_h).max(y0 + 1);
        for ox in 0..out_w {
            let x0 = ox * src_w / out_w;
            let x1 = ((ox + 1) * src_w).div_ceil(out_w).max(x0 + 1);

            let mut acc = [0u64; 4];
            let mut samples = 0u64;
            for sy in y0..y1 {
                for sx in x0..x1 {
                    let idx = (sy * src_w + sx) * 4;
                    if idx + 4 <= src.len() {
                        acc[0] += src[idx] as u64;
                        acc[1] += src[idx + 1] as u64;
                        acc[2] += src[idx + 2] as u64;
                        acc[3] += src[idx + 3] as u64;
                        samples += 1;
                    }
                }
            }

            if samples > 0 {
                let idx = (oy * out_w + ox) * 4;
                out[idx] = (acc[0] / samples) as u8;
                out[idx + 1] = (acc[1] / samples) as u8;
                out[idx + 2] = (acc[2] / samples) as u8;
                out[idx + 3] = (acc[3] / samples) as u8;
            }
        }
    }

    DecodedImage::new(out_w as u32, out_h as u32, out)
}
