use serde::{Deserialize, Serialize};

/// Horizontal alignment of a text element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

/// Variant-specific geometry of a shape element.
///
/// Each variant carries the parameters that define its untransformed
/// footprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Rect {
        width: f64,
        height: f64,
    },
    Circle {
        radius: f64,
    },
    Ellipse {
        radius_x: f64,
        radius_y: f64,
    },
    Star {
        points: u32,
        inner_radius: f64,
        outer_radius: f64,
    },
    Polygon {
        sides: u32,
        radius: f64,
    },
    /// Polyline with a flat coordinate list `x0, y0, x1, y1, ...` relative to
    /// the element position.
    Line {
        points: Vec<f64>,
    },
}

/// The element payload: what kind of thing sits on the canvas.
///
/// Externally tagged on the wire so both the JSON config path and the
/// binary worker framing can encode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Sticker {
        image_url: String,
        width: f64,
        height: f64,
    },
    Text {
        text: String,
        font_size: f64,
        font_family: String,
        align: TextAlign,
        width: Option<f64>,
    },
    Shape {
        shape: ShapeKind,
    },
}

/// A positioned visual element on the canvas.
///
/// The document model owns element lifetime and identity; the engine treats
/// each element list it receives as a read-only snapshot. `x`/`y` are the
/// canvas-space top-left of the element's untransformed box; `rotation` is in
/// degrees and `z_index` is the paint order (ascending).
///
/// # Examples
///
/// ```
/// use stickerboard_types::element::CanvasElement;
///
/// let sticker = CanvasElement::sticker("s1", "https://cdn.example/a.png", 0.0, 0.0, 100.0, 80.0)
///     .with_rotation(45.0)
///     .with_z_index(3);
/// assert_eq!(sticker.z_index, 3);
/// assert_eq!(sticker.base_size(), (100.0, 80.0));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasElement {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub scale_x: f64,
    pub scale_y: f64,
    /// Rotation in degrees.
    pub rotation: f64,
    pub opacity: f64,
    pub z_index: i32,
    pub visible: bool,
    pub draggable: bool,
    pub kind: ElementKind,
}

impl CanvasElement {
    /// Create an element with default transform fields and the given payload.
    pub fn new(id: impl Into<String>, x: f64, y: f64, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            opacity: 1.0,
            z_index: 0,
            visible: true,
            draggable: true,
            kind,
        }
    }

    /// Create a sticker (image) element.
    pub fn sticker(
        id: impl Into<String>,
        image_url: impl Into<String>,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    ) -> Self {
        Self::new(
            id,
            x,
            y,
            ElementKind::Sticker {
                image_url: image_url.into(),
                width,
                height,
            },
        )
    }

    /// Create a text element with default family and alignment.
    pub fn text(id: impl Into<String>, text: impl Into<String>, x: f64, y: f64, font_size: f64) -> Self {
        Self::new(
            id,
            x,
            y,
            ElementKind::Text {
                text: text.into(),
                font_size,
                font_family: "sans-serif".to_string(),
                align: TextAlign::default(),
                width: None,
            },
        )
    }

    /// Create a shape element.
    pub fn shape(id: impl Into<String>, shape: ShapeKind, x: f64, y: f64) -> Self {
        Self::new(id, x, y, ElementKind::Shape { shape })
    }

    /// Set the rotation in degrees.
    pub fn with_rotation(mut self, degrees: f64) -> Self {
        self.rotation = degrees;
        self
    }

    /// Set the scale factors.
    pub fn with_scale(mut self, scale_x: f64, scale_y: f64) -> Self {
        self.scale_x = scale_x;
        self.scale_y = scale_y;
        self
    }

    /// Set the paint order.
    pub fn with_z_index(mut self, z_index: i32) -> Self {
        self.z_index = z_index;
        self
    }

    /// Set visibility.
    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Set the opacity in `[0, 1]`.
    pub fn with_opacity(mut self, opacity: f64) -> Self {
        self.opacity = opacity;
        self
    }

    /// The sticker image URL, if this element is a sticker.
    pub fn image_url(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::Sticker { image_url, .. } => Some(image_url),
            _ => None,
        }
    }

    /// Untransformed width and height of the element's footprint.
    ///
    /// This is the geometry before `scale_x`/`scale_y` and `rotation` are
    /// applied. Text without an explicit width uses the standard canvas
    /// approximation of `0.6 × font_size` per character and a line height of
    /// `1.2 × font_size`. A line's footprint is the extent of its points.
    pub fn base_size(&self) -> (f64, f64) {
        match &self.kind {
            ElementKind::Sticker { width, height, .. } => (*width, *height),
            ElementKind::Text {
                text,
                font_size,
                width,
                ..
            } => {
                let w = width.unwrap_or_else(|| text.chars().count() as f64 * font_size * 0.6);
                (w, font_size * 1.2)
            }
            ElementKind::Shape { shape } => match shape {
                ShapeKind::Rect { width, height } => (*width, *height),
                ShapeKind::Circle { radius } => (radius * 2.0, radius * 2.0),
                ShapeKind::Ellipse { radius_x, radius_y } => (radius_x * 2.0, radius_y * 2.0),
                ShapeKind::Star { outer_radius, .. } => (outer_radius * 2.0, outer_radius * 2.0),
                ShapeKind::Polygon { radius, .. } => (radius * 2.0, radius * 2.0),
                ShapeKind::Line { points } => line_extent(points),
            },
        }
    }
}

fn line_extent(points: &[f64]) -> (f64, f64) {
    if points.len() < 2 {
        return (0.0, 0.0);
    }
    let mut min_x = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for pair in points.chunks_exact(2) {
        min_x = min_x.min(pair[0]);
        max_x = max_x.max(pair[0]);
        min_y = min_y.min(pair[1]);
        max_y = max_y.max(pair[1]);
    }
    (max_x - min_x, max_y - min_y)
}
