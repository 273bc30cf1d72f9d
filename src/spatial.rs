//! Pure canvas geometry shared by the index, the loader, and the worker.
//!
//! Everything in this module is side-effect free: element bounds derivation,
//! rectangle predicates, zoom-dependent padding, and snap-line math. The
//! R-tree in `spatial_index` and the brute-force oracles in the tests both go
//! through these functions, so query parity does not depend on where the
//! geometry formula lives.

use geo::{Coord, Rect};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use stickerboard_types::CanvasElement;

/// Zoom below this is treated as this value when deriving padding, keeping
/// the padded query window finite at extreme zoom-out.
const MIN_PADDING_ZOOM: f64 = 0.01;

/// Compute the conservative axis-aligned bounding box of an element.
///
/// The element's untransformed footprint is scaled by `|scale_x|`/`|scale_y|`
/// and then enclosed under rotation: with θ in radians,
/// `w' = w·|cos θ| + h·|sin θ|` and `h' = w·|sin θ| + h·|cos θ|`, centered on
/// the center of the unrotated box. Rotation 0 reproduces the unrotated box
/// exactly and a full turn is the identity within float tolerance.
///
/// # Examples
///
/// ```rust
/// use stickerboard::spatial::element_bounds;
/// use stickerboard_types::CanvasElement;
///
/// let square = CanvasElement::sticker("a", "u", 0.0, 0.0, 100.0, 100.0);
/// let plain = element_bounds(&square);
/// let tilted = element_bounds(&square.clone().with_rotation(45.0));
/// assert!(tilted.width() > plain.width());
/// ```
pub fn element_bounds(element: &CanvasElement) -> Rect<f64> {
    let (base_w, base_h) = element.base_size();
    let w = (base_w * element.scale_x).abs();
    let h = (base_h * element.scale_y).abs();

    let theta = element.rotation.to_radians();
    let cos = theta.cos().abs();
    let sin = theta.sin().abs();
    let rot_w = w * cos + h * sin;
    let rot_h = w * sin + h * cos;

    let center_x = element.x + w / 2.0;
    let center_y = element.y + h / 2.0;
    Rect::new(
        Coord {
            x: center_x - rot_w / 2.0,
            y: center_y - rot_h / 2.0,
        },
        Coord {
            x: center_x + rot_w / 2.0,
            y: center_y + rot_h / 2.0,
        },
    )
}

/// Whether two rectangles intersect, boundary contact included.
pub fn rects_intersect(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x && a.max().x >= b.min().x && a.min().y <= b.max().y && a.max().y >= b.min().y
}

/// Whether a rectangle contains a point, boundary included.
pub fn rect_contains(rect: &Rect<f64>, x: f64, y: f64) -> bool {
    x >= rect.min().x && x <= rect.max().x && y >= rect.min().y && y <= rect.max().y
}

/// The smallest rectangle enclosing both inputs.
pub fn union_rects(a: &Rect<f64>, b: &Rect<f64>) -> Rect<f64> {
    Rect::new(
        Coord {
            x: a.min().x.min(b.min().x),
            y: a.min().y.min(b.min().y),
        },
        Coord {
            x: a.max().x.max(b.max().x),
            y: a.max().y.max(b.max().y),
        },
    )
}

/// Euclidean distance from a point to the nearest point of a rectangle.
/// Zero when the point is inside.
pub fn rect_distance(rect: &Rect<f64>, x: f64, y: f64) -> f64 {
    let dx = (rect.min().x - x).max(0.0).max(x - rect.max().x);
    let dy = (rect.min().y - y).max(0.0).max(y - rect.max().y);
    (dx * dx + dy * dy).sqrt()
}

/// Query padding for a zoom factor: `base_padding / zoom`, so zoomed-out
/// views (which pan across more canvas per frame) get wider prefetch margins.
///
/// # Examples
///
/// ```rust
/// use stickerboard::spatial::padding_for_zoom;
///
/// assert_eq!(padding_for_zoom(100.0, 1.0), 100.0);
/// assert_eq!(padding_for_zoom(100.0, 0.5), 200.0);
/// assert!(padding_for_zoom(100.0, 4.0) < 100.0);
/// ```
pub fn padding_for_zoom(base_padding: f64, zoom: f64) -> f64 {
    base_padding / zoom.max(MIN_PADDING_ZOOM)
}

/// Axis of a snap guide line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapAxis {
    /// A vertical line at a fixed x.
    Vertical,
    /// A horizontal line at a fixed y.
    Horizontal,
}

/// A guide line the caller can render while a snap is active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SnapGuide {
    pub axis: SnapAxis,
    pub position: f64,
}

/// Outcome of a snap calculation: adjusted top-left coordinates when a
/// candidate alignment was found within the threshold, plus the guide lines
/// that produced them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SnapResult {
    pub snapped_x: Option<f64>,
    pub snapped_y: Option<f64>,
    pub guides: Vec<SnapGuide>,
}

impl SnapResult {
    pub fn is_snapped(&self) -> bool {
        self.snapped_x.is_some() || self.snapped_y.is_some()
    }
}

/// The three x lines (left edge, horizontal center, right edge) and three y
/// lines (top edge, vertical center, bottom edge) of a rectangle.
pub fn snap_lines(rect: &Rect<f64>) -> (SmallVec<[f64; 3]>, SmallVec<[f64; 3]>) {
    let xs = SmallVec::from_buf([rect.min().x, rect.center().x, rect.max().x]);
    let ys = SmallVec::from_buf([rect.min().y, rect.center().y, rect.max().y]);
    (xs, ys)
}

/// Align a moving box against target boxes.
///
/// `moving` is the element's bounds at the proposed position and
/// `proposed_x`/`proposed_y` its proposed top-left. For each axis the closest
/// edge-or-center alignment within `threshold` canvas units wins; the result
/// carries the adjusted top-left per axis and one guide line per matched
/// axis.
pub fn calculate_snap(
    proposed_x: f64,
    proposed_y: f64,
    moving: &Rect<f64>,
    targets: &[Rect<f64>],
    threshold: f64,
) -> SnapResult {
    let (moving_xs, moving_ys) = snap_lines(moving);

    let mut best_x: Option<(f64, f64)> = None;
    let mut best_y: Option<(f64, f64)> = None;

    for target in targets {
        let (target_xs, target_ys) = snap_lines(target);
        for &mx in &moving_xs {
            for &tx in &target_xs {
                let delta = tx - mx;
                if delta.abs() <= threshold
                    && best_x.is_none_or(|(best, _)| delta.abs() < best.abs())
                {
                    best_x = Some((delta, tx));
                }
            }
        }
        for &my in &moving_ys {
            for &ty in &target_ys {
                let delta = ty - my;
                if delta.abs() <= threshold
                    && best_y.is_none_or(|(best, _)| delta.abs() < best.abs())
                {
                    best_y = Some((delta, ty));
                }
            }
        }
    }

    let mut guides = Vec::new();
    if let Some((_, line)) = best_x {
        guides.push(SnapGuide {
            axis: SnapAxis::Vertical,
            position: line,
        });
    }
    if let Some((_, line)) = best_y {
        guides.push(SnapGuide {
            axis: SnapAxis::Horizontal,
            position: line,
        });
    }

    SnapResult {
        snapped_x: best_x.map(|(delta, _)| proposed_x + delta),
        snapped_y: best_y.map(|(delta, _)| proposed_y + delta),
        guides,
    }
}
