//! # stickerboard-types
//!
//! Core data types for the Stickerboard canvas engine.
//!
//! This crate provides the plain data model shared between the interactive
//! engine and its background worker:
//!
//! - **Elements**: `CanvasElement`, `ElementKind`, `ShapeKind`, `TextAlign`
//! - **Viewport**: `ViewportBounds`
//!
//! All types are serializable with Serde. Bounds-related helpers return the
//! `geo` crate's geometric primitives.
//!
//! ## Examples
//!
//! ```rust
//! use stickerboard_types::element::CanvasElement;
//!
//! let sticker = CanvasElement::sticker("s1", "https://cdn.example/cat.png", 10.0, 20.0, 64.0, 64.0);
//! assert_eq!(sticker.base_size(), (64.0, 64.0));
//! ```

pub mod element;
pub mod viewport;

pub use element::{CanvasElement, ElementKind, ShapeKind, TextAlign};
pub use viewport::ViewportBounds;
