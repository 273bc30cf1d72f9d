//! Zoom-driven level-of-detail classification.
//!
//! A pure mapping from the viewport zoom factor to one of five quality tiers
//! and its settings table. Nothing here holds state; the classifier is
//! re-evaluated on every zoom change and both the render path and the image
//! cache consult the same table.

use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use stickerboard_types::CanvasElement;

/// Discrete rendering-quality tier selected by zoom, coarsest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LodLevel {
    UltraLow,
    Low,
    Medium,
    High,
    UltraHigh,
}

/// Rendering settings attached to one LOD tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LodSettings {
    /// Image quality factor in `[0, 1]`, forwarded to CDN transforms.
    pub image_quality: f64,
    /// Longest image side fetched or kept at this tier, in pixels.
    pub max_image_dimension: u32,
    pub enable_shadows: bool,
    pub enable_filters: bool,
    /// Whether text gets full glyph detail or block placeholders.
    pub text_detail: bool,
    /// Stroke tessellation quality multiplier.
    pub stroke_quality: f64,
    /// Elements whose projected size falls below this many on-screen pixels
    /// are culled as insignificant.
    pub min_render_size: f64,
    /// Render batch size hint; coarser tiers permit larger batches.
    pub batch_size: usize,
}

const LOD_SETTINGS: [LodSettings; 5] = [
    // UltraLow
    LodSettings {
        image_quality: 0.25,
        max_image_dimension: 128,
        enable_shadows: false,
        enable_filters: false,
        text_detail: false,
        stroke_quality: 0.25,
        min_render_size: 10.0,
        batch_size: 512,
    },
    // Low
    LodSettings {
        image_quality: 0.4,
        max_image_dimension: 256,
        enable_shadows: false,
        enable_filters: false,
        text_detail: false,
        stroke_quality: 0.5,
        min_render_size: 5.0,
        batch_size: 256,
    },
    // Medium
    LodSettings {
        image_quality: 0.6,
        max_image_dimension: 512,
        enable_shadows: false,
        enable_filters: true,
        text_detail: true,
        stroke_quality: 0.75,
        min_render_size: 2.0,
        batch_size: 128,
    },
    // High
    LodSettings {
        image_quality: 0.8,
        max_image_dimension: 1024,
        enable_shadows: true,
        enable_filters: true,
        text_detail: true,
        stroke_quality: 1.0,
        min_render_size: 1.0,
        batch_size: 64,
    },
    // UltraHigh
    LodSettings {
        image_quality: 1.0,
        max_image_dimension: 2048,
        enable_shadows: true,
        enable_filters: true,
        text_detail: true,
        stroke_quality: 1.0,
        min_render_size: 0.5,
        batch_size: 32,
    },
];

impl LodLevel {
    pub const ALL: [LodLevel; 5] = [
        LodLevel::UltraLow,
        LodLevel::Low,
        LodLevel::Medium,
        LodLevel::High,
        LodLevel::UltraHigh,
    ];

    /// The settings table entry for this tier.
    pub fn settings(self) -> &'static LodSettings {
        &LOD_SETTINGS[self as usize]
    }

    /// The `[min_zoom, max_zoom)` band that selects this tier.
    pub fn zoom_range(self) -> (f64, f64) {
        match self {
            LodLevel::UltraLow => (0.0, 0.1),
            LodLevel::Low => (0.1, 0.3),
            LodLevel::Medium => (0.3, 0.7),
            LodLevel::High => (0.7, 2.0),
            LodLevel::UltraHigh => (2.0, f64::INFINITY),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LodLevel::UltraLow => "ultra_low",
            LodLevel::Low => "low",
            LodLevel::Medium => "medium",
            LodLevel::High => "high",
            LodLevel::UltraHigh => "ultra_high",
        }
    }
}

impl fmt::Display for LodLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a zoom factor into its LOD tier.
///
/// Bands are lower-bound inclusive and upper-bound exclusive.
///
/// # Examples
///
/// ```rust
/// use stickerboard::lod::{lod_for_zoom, LodLevel};
///
/// assert_eq!(lod_for_zoom(0.05), LodLevel::UltraLow);
/// assert_eq!(lod_for_zoom(0.1), LodLevel::Low);
/// assert_eq!(lod_for_zoom(0.5), LodLevel::Medium);
/// assert_eq!(lod_for_zoom(3.0), LodLevel::UltraHigh);
/// ```
pub fn lod_for_zoom(zoom: f64) -> LodLevel {
    if zoom < 0.1 {
        LodLevel::UltraLow
    } else if zoom < 0.3 {
        LodLevel::Low
    } else if zoom < 0.7 {
        LodLevel::Medium
    } else if zoom < 2.0 {
        LodLevel::High
    } else {
        LodLevel::UltraHigh
    }
}

/// Whether an element is big enough on screen to be worth drawing.
///
/// The projected size is `max(scaled width, scaled height) × zoom`; an
/// element below the active tier's `min_render_size` is culled. This is
/// culling by insignificance, applied after viewport culling.
pub fn should_render(element: &CanvasElement, zoom: f64) -> bool {
    let (base_w, base_h) = element.base_size();
    let w = (base_w * element.scale_x).abs();
    let h = (base_h * element.scale_y).abs();
    let projected = w.max(h) * zoom;
    projected >= lod_for_zoom(zoom).settings().min_render_size
}

/// Render batch size hint for the active tier.
pub fn render_batch_size(zoom: f64) -> usize {
    lod_for_zoom(zoom).settings().batch_size
}

/// A hosting provider whose image endpoint understands downscale-on-fetch
/// query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdnProvider {
    /// Host suffix to recognize, e.g. `imgix.net` matches `foo.imgix.net`.
    pub host_suffix: String,
    /// Query parameter carrying the requested width in pixels.
    pub width_param: String,
    /// Query parameter carrying the requested quality in percent.
    pub quality_param: String,
}

impl CdnProvider {
    pub fn new(
        host_suffix: impl Into<String>,
        width_param: impl Into<String>,
        quality_param: impl Into<String>,
    ) -> Self {
        Self {
            host_suffix: host_suffix.into(),
            width_param: width_param.into(),
            quality_param: quality_param.into(),
        }
    }
}

static DEFAULT_PROVIDERS: Lazy<Vec<CdnProvider>> = Lazy::new(|| {
    vec![
        CdnProvider::new("images.unsplash.com", "w", "q"),
        CdnProvider::new("imgix.net", "w", "q"),
        CdnProvider::new("supabase.co", "width", "quality"),
    ]
});

/// The built-in provider table. Extra providers can be added through the
/// engine configuration.
pub fn default_providers() -> &'static [CdnProvider] {
    &DEFAULT_PROVIDERS
}

fn url_host(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    // Strip userinfo and port
    let host = authority.rsplit('@').next().unwrap_or(authority);
    Some(host.split(':').next().unwrap_or(host))
}

fn host_matches(host: &str, suffix: &str) -> bool {
    host == suffix || host.ends_with(&format!(".{suffix}"))
}

/// Rewrite an image URL with the provider's downscale parameters for the
/// given tier, or `None` when the host is not a recognized provider (the
/// caller then fetches the original and downscales client-side).
///
/// # Examples
///
/// ```rust
/// use stickerboard::lod::{default_providers, transform_url, LodLevel};
///
/// let url = "https://images.unsplash.com/photo-123";
/// let low = transform_url(url, LodLevel::Low, default_providers());
/// assert_eq!(low.as_deref(), Some("https://images.unsplash.com/photo-123?w=256&q=40"));
///
/// assert!(transform_url("https://my-own-host.dev/a.png", LodLevel::Low, default_providers()).is_none());
/// ```
pub fn transform_url(url: &str, level: LodLevel, providers: &[CdnProvider]) -> Option<String> {
    let host = url_host(url)?;
    let provider = providers
        .iter()
        .find(|p| host_matches(host, &p.host_suffix))?;

    let settings = level.settings();
    let quality = (settings.image_quality * 100.0).round() as u32;
    let separator = if url.contains('?') { '&' } else { '?' };
    Some(format!(
        "{url}{separator}{}={}&{}={}",
        provider.width_param, settings.max_image_dimension, provider.quality_param, quality
    ))
}
