//! Spatial render engine for infinite sticker-canvas boards: R-tree culling,
//! LOD-based image degradation, and region-by-region progressive loading.
//!
//! ```rust
//! use std::sync::Arc;
//! use stickerboard::{Engine, EngineConfig};
//! use stickerboard_types::{CanvasElement, ViewportBounds};
//! # use stickerboard::cache::{CancelToken, DecodedImage, ImageFetcher};
//! # struct InlineFetcher;
//! # impl ImageFetcher for InlineFetcher {
//! #     fn fetch(&self, _url: &str, _cancel: &CancelToken) -> stickerboard::Result<DecodedImage> {
//! #         Ok(DecodedImage::new(1, 1, vec![0u8; 4]))
//! #     }
//! # }
//! let config = EngineConfig::default().without_worker();
//! let mut engine = Engine::new(config, Arc::new(InlineFetcher))?;
//!
//! engine.set_elements(&[
//!     CanvasElement::sticker("photo", "https://images.unsplash.com/p1", 0.0, 0.0, 320.0, 240.0),
//!     CanvasElement::text("caption", "beach day", 40.0, 260.0, 24.0),
//! ]);
//!
//! let viewport = ViewportBounds::new(0.0, 0.0, 1280.0, 800.0);
//! let pass = engine.render_pass(&viewport, 1.0);
//! assert_eq!(pass.elements.len(), 2);
//! # Ok::<(), stickerboard::EngineError>(())
//! ```

pub mod builder;
pub mod cache;
pub mod engine;
pub mod error;
pub mod lod;
pub mod region;
pub mod spatial;
pub mod spatial_index;
pub mod types;
pub mod worker;

pub use builder::EngineBuilder;
pub use engine::{Engine, RenderPass};
pub use error::{EngineError, Result};

pub type Stickerboard = Engine;

pub use geo::{Coord, Rect};

pub use stickerboard_types::{CanvasElement, ElementKind, ShapeKind, TextAlign, ViewportBounds};

pub use cache::{CacheStats, CancelToken, DecodedImage, ImageCache, ImageFetcher};

pub use lod::{lod_for_zoom, should_render, CdnProvider, LodLevel, LodSettings};

pub use region::{visible_regions, LoaderStats, RegionKey, RegionLoader};

pub use spatial::{element_bounds, padding_for_zoom, SnapAxis, SnapGuide, SnapResult};

pub use spatial_index::{IndexStats, SpatialIndex};

pub use types::{Clock, EngineConfig, EngineStats, LoadPriority, ManualClock, TickClock};

pub use worker::{WorkerBridge, WorkerRequest, WorkerResponse};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{Engine, EngineBuilder, EngineError, Result, Stickerboard};

    pub use geo::{Coord, Rect};

    pub use crate::{CanvasElement, ElementKind, ShapeKind, ViewportBounds};

    pub use crate::{lod_for_zoom, LodLevel};

    pub use crate::{EngineConfig, EngineStats, LoadPriority};

    pub use crate::{ImageCache, ImageFetcher};

    pub use std::time::Duration;
}
