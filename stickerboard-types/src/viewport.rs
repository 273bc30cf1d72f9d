use geo::{Coord, Rect};
use serde::{Deserialize, Serialize};

/// The visible canvas-space window, derived from pan/zoom state each frame.
///
/// `x`/`y` are the top-left corner in canvas units; `width`/`height` are the
/// canvas-space extent (screen extent divided by zoom).
///
/// # Examples
///
/// ```
/// use stickerboard_types::viewport::ViewportBounds;
///
/// let vp = ViewportBounds::new(100.0, 50.0, 1000.0, 800.0);
/// let c = vp.center();
/// assert_eq!((c.x, c.y), (600.0, 450.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ViewportBounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Canvas-space center of the viewport.
    pub fn center(&self) -> Coord<f64> {
        Coord {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }

    /// The viewport as an axis-aligned rectangle.
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.x,
                y: self.y,
            },
            Coord {
                x: self.x + self.width,
                y: self.y + self.height,
            },
        )
    }

    /// The viewport expanded by `padding` canvas units on every side.
    pub fn padded(&self, padding: f64) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.x - padding,
                y: self.y - padding,
            },
            Coord {
                x: self.x + self.width + padding,
                y: self.y + self.height + padding,
            },
        )
    }

    /// Whether a canvas-space point falls inside the viewport (inclusive).
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x <= self.x + self.width && y >= self.y && y <= self.y + self.height
    }
}
