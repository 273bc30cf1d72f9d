//! R-tree spatial index over canvas elements.
//!
//! The index stores one axis-aligned bounding box per element (rotation is
//! folded into the box, see [`crate::spatial::element_bounds`]) and answers
//! viewport, point, radius and collision queries for the render loop.

use geo::Rect;
use rstar::{AABB, PointDistance, RTree, RTreeObject};
use rustc_hash::FxHashMap;
use stickerboard_types::{CanvasElement, ViewportBounds};

use crate::spatial::{self, SnapResult, element_bounds, rect_distance, union_rects};

/// An element's bounding box as stored in the R-tree.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedElement {
    /// Id of the element this box belongs to.
    pub id: String,
    /// World-space axis-aligned bounds, rotation already applied.
    pub bounds: Rect<f64>,
}

impl RTreeObject for IndexedElement {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds.min().x, self.bounds.min().y],
            [self.bounds.max().x, self.bounds.max().y],
        )
    }
}

impl PointDistance for IndexedElement {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = (self.bounds.min().x - point[0])
            .max(point[0] - self.bounds.max().x)
            .max(0.0);
        let dy = (self.bounds.min().y - point[1])
            .max(point[1] - self.bounds.max().y)
            .max(0.0);
        dx * dx + dy * dy
    }

    fn contains_point(&self, point: &[f64; 2]) -> bool {
        point[0] >= self.bounds.min().x
            && point[0] <= self.bounds.max().x
            && point[1] >= self.bounds.min().y
            && point[1] <= self.bounds.max().y
    }
}

/// Spatial index for canvas elements backed by an R-tree.
///
/// Structural changes go through [`SpatialIndex::load`], which bulk-loads a
/// fresh tree. Single-element edits (`insert`, `update`, `remove`) mutate the
/// tree in place so a drag does not pay for a rebuild on every frame.
pub struct SpatialIndex {
    tree: RTree<IndexedElement>,
    elements: FxHashMap<String, CanvasElement>,
    rebuilds: u64,
}

impl SpatialIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            tree: RTree::new(),
            elements: FxHashMap::default(),
            rebuilds: 0,
        }
    }

    /// Replace the entire dataset with `elements`.
    ///
    /// Builds the tree with a bulk load, which produces a better-packed tree
    /// than repeated inserts. Elements with non-finite bounds are skipped and
    /// logged. When two elements share an id the last one wins.
    pub fn load(&mut self, elements: Vec<CanvasElement>) {
        self.elements.clear();
        for element in elements {
            if !rect_is_finite(&element_bounds(&element)) {
                log::warn!("Skipping element '{}' with non-finite bounds", element.id);
                continue;
            }
            self.elements.insert(element.id.clone(), element);
        }

        let entries: Vec<IndexedElement> = self
            .elements
            .values()
            .map(|element| IndexedElement {
                id: element.id.clone(),
                bounds: element_bounds(element),
            })
            .collect();

        self.tree = RTree::bulk_load(entries);
        self.rebuilds += 1;
    }

    /// Insert an element, replacing any existing element with the same id.
    pub fn insert(&mut self, element: CanvasElement) {
        let bounds = element_bounds(&element);
        if !rect_is_finite(&bounds) {
            log::warn!("Skipping element '{}' with non-finite bounds", element.id);
            return;
        }

        if let Some(previous) = self.elements.remove(&element.id) {
            self.tree.remove(&IndexedElement {
                id: previous.id.clone(),
                bounds: element_bounds(&previous),
            });
        }

        self.tree.insert(IndexedElement {
            id: element.id.clone(),
            bounds,
        });
        self.elements.insert(element.id.clone(), element);
    }

    /// Update an element in place.
    ///
    /// Returns `false` without touching the index when no element with this
    /// id exists.
    pub fn update(&mut self, element: CanvasElement) -> bool {
        if !self.elements.contains_key(&element.id) {
            return false;
        }
        self.insert(element);
        true
    }

    /// Remove an element by id. Returns whether anything was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(element) = self.elements.remove(id) else {
            return false;
        };

        self.tree
            .remove(&IndexedElement {
                id: element.id.clone(),
                bounds: element_bounds(&element),
            })
            .is_some()
    }

    /// Look up an element by id.
    pub fn get(&self, id: &str) -> Option<&CanvasElement> {
        self.elements.get(id)
    }

    /// Check whether an element with this id is indexed.
    pub fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    /// Number of indexed elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the index holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate over all indexed elements in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &CanvasElement> {
        self.elements.values()
    }

    /// Find all elements whose bounds intersect the viewport.
    ///
    /// # Arguments
    ///
    /// * `viewport` - Visible region in world coordinates
    /// * `padding` - Extra margin in world units added on every side, so
    ///   elements about to scroll into view are already part of the result
    ///
    /// # Returns
    ///
    /// Elements whose bounding boxes touch the padded viewport. Edge contact
    /// counts as a hit.
    pub fn query_viewport(&self, viewport: &ViewportBounds, padding: f64) -> Vec<&CanvasElement> {
        self.query_rect(&viewport.padded(padding))
    }

    /// Find all elements whose bounds intersect an arbitrary rectangle.
    pub fn query_rect(&self, rect: &Rect<f64>) -> Vec<&CanvasElement> {
        if !rect_is_finite(rect) {
            log::warn!("Rejecting rectangle query with non-finite coordinates");
            return Vec::new();
        }

        let envelope = AABB::from_corners(
            [rect.min().x, rect.min().y],
            [rect.max().x, rect.max().y],
        );

        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|entry| self.elements.get(&entry.id))
            .collect()
    }

    /// Find all elements whose bounds contain the point (hit testing).
    ///
    /// Points on a box edge count as inside.
    pub fn query_point(&self, x: f64, y: f64) -> Vec<&CanvasElement> {
        if !(x.is_finite() && y.is_finite()) {
            log::warn!("Rejecting point query with non-finite coordinates");
            return Vec::new();
        }

        self.tree
            .locate_all_at_point(&[x, y])
            .filter_map(|entry| self.elements.get(&entry.id))
            .collect()
    }

    /// Find all elements within `radius` of a point.
    ///
    /// Distance is measured to the nearest edge of each bounding box, so an
    /// element whose box contains the point is at distance zero.
    ///
    /// # Returns
    ///
    /// Matching elements sorted nearest first.
    pub fn query_radius(&self, x: f64, y: f64, radius: f64) -> Vec<&CanvasElement> {
        if !(x.is_finite() && y.is_finite() && radius.is_finite()) || radius < 0.0 {
            log::warn!("Rejecting radius query with invalid parameters");
            return Vec::new();
        }

        let mut hits: Vec<(&IndexedElement, f64)> = self
            .tree
            .locate_within_distance([x, y], radius * radius)
            .map(|entry| (entry, rect_distance(&entry.bounds, x, y)))
            .collect();

        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        hits.into_iter()
            .filter_map(|(entry, _)| self.elements.get(&entry.id))
            .collect()
    }

    /// Find all elements whose bounds overlap the bounds of `id`.
    ///
    /// The element itself is excluded. An unknown id yields an empty result.
    pub fn find_collisions(&self, id: &str) -> Vec<&CanvasElement> {
        let Some(element) = self.elements.get(id) else {
            return Vec::new();
        };

        let bounds = element_bounds(element);
        let envelope = AABB::from_corners(
            [bounds.min().x, bounds.min().y],
            [bounds.max().x, bounds.max().y],
        );

        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter(|entry| entry.id != id)
            .filter_map(|entry| self.elements.get(&entry.id))
            .collect()
    }

    /// Bounding box of the whole canvas content, or `None` when empty.
    pub fn bounds(&self) -> Option<Rect<f64>> {
        let mut entries = self.tree.iter();
        let first = entries.next()?;
        Some(entries.fold(first.bounds, |acc, entry| union_rects(&acc, &entry.bounds)))
    }

    /// Order `ids` back to front by z-index.
    ///
    /// Unknown ids are dropped. Elements on the same z level keep their
    /// relative order from the input, which keeps the draw order stable while
    /// an element is dragged.
    pub fn sort_by_depth(&self, ids: &[String]) -> Vec<String> {
        let mut known: Vec<&CanvasElement> = ids
            .iter()
            .filter_map(|id| self.elements.get(id))
            .collect();
        known.sort_by_key(|element| element.z_index);
        known.into_iter().map(|element| element.id.clone()).collect()
    }

    /// Snap a proposed move of element `id` against nearby elements.
    ///
    /// # Arguments
    ///
    /// * `id` - The element being dragged
    /// * `proposed_x`, `proposed_y` - Top-left position the drag wants
    /// * `threshold` - Maximum snap distance in canvas units
    ///
    /// # Returns
    ///
    /// Adjusted coordinates per axis plus guide lines for the matched edges.
    /// Unknown ids and non-finite input produce an empty result.
    pub fn calculate_snap(
        &self,
        id: &str,
        proposed_x: f64,
        proposed_y: f64,
        threshold: f64,
    ) -> SnapResult {
        let Some(element) = self.elements.get(id) else {
            return SnapResult::default();
        };
        if !(proposed_x.is_finite() && proposed_y.is_finite() && threshold.is_finite()) {
            log::warn!("Rejecting snap calculation with non-finite coordinates");
            return SnapResult::default();
        }

        let mut moved = element.clone();
        moved.x = proposed_x;
        moved.y = proposed_y;
        let moving = element_bounds(&moved);

        let search = AABB::from_corners(
            [moving.min().x - threshold, moving.min().y - threshold],
            [moving.max().x + threshold, moving.max().y + threshold],
        );
        let targets: Vec<Rect<f64>> = self
            .tree
            .locate_in_envelope_intersecting(&search)
            .filter(|entry| entry.id != id)
            .map(|entry| entry.bounds)
            .collect();

        spatial::calculate_snap(proposed_x, proposed_y, &moving, &targets, threshold)
    }

    /// Get statistics about the index.
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            elements: self.elements.len(),
            rebuilds: self.rebuilds,
        }
    }

    /// Drop all elements. The rebuild counter is kept.
    pub fn clear(&mut self) {
        self.tree = RTree::new();
        self.elements.clear();
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the spatial index.
#[derive(Debug, Clone)]
pub struct IndexStats {
    /// Number of indexed elements
    pub elements: usize,
    /// Number of bulk rebuilds since creation
    pub rebuilds: u64,
}

#[inline]
fn rect_is_finite(rect: &Rect<f64>) -> bool {
    rect.min().x.is_finite()
        && rect.min().y.is_finite()
        && rect.max().x.is_finite()
        && rect.max().y.is_finite()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::rects_intersect;

    fn sticker(id: &str, x: f64, y: f64, w: f64, h: f64) -> CanvasElement {
        CanvasElement::sticker(id, "https://images.unsplash.com/photo-1", x, y, w, h)
    }

    fn sorted_ids(results: &[&CanvasElement]) -> Vec<String> {
        let mut ids: Vec<String> = results.iter().map(|e| e.id.clone()).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_load_and_query_viewport() {
        let mut index = SpatialIndex::new();
        index.load(vec![
            sticker("a", 0.0, 0.0, 100.0, 100.0),
            sticker("b", 500.0, 0.0, 100.0, 100.0),
            sticker("c", 5000.0, 5000.0, 100.0, 100.0),
        ]);

        let viewport = ViewportBounds::new(0.0, 0.0, 700.0, 300.0);
        let results = index.query_viewport(&viewport, 0.0);

        assert_eq!(sorted_ids(&results), vec!["a", "b"]);
    }

    #[test]
    fn test_query_viewport_padding_extends_reach() {
        let mut index = SpatialIndex::new();
        index.load(vec![sticker("offscreen", 1050.0, 0.0, 100.0, 100.0)]);

        let viewport = ViewportBounds::new(0.0, 0.0, 1000.0, 1000.0);
        assert!(index.query_viewport(&viewport, 0.0).is_empty());
        assert_eq!(index.query_viewport(&viewport, 100.0).len(), 1);
    }

    #[test]
    fn test_insert_replaces_existing() {
        let mut index = SpatialIndex::new();
        index.insert(sticker("a", 0.0, 0.0, 100.0, 100.0));
        index.insert(sticker("a", 2000.0, 2000.0, 100.0, 100.0));

        assert_eq!(index.len(), 1);
        let viewport = ViewportBounds::new(0.0, 0.0, 500.0, 500.0);
        assert!(index.query_viewport(&viewport, 0.0).is_empty());
        assert_eq!(index.query_point(2050.0, 2050.0).len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut index = SpatialIndex::new();
        index.insert(sticker("a", 0.0, 0.0, 100.0, 100.0));

        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert!(index.is_empty());
        assert!(index.query_point(50.0, 50.0).is_empty());
    }

    #[test]
    fn test_update_unknown_id_is_noop() {
        let mut index = SpatialIndex::new();
        assert!(!index.update(sticker("ghost", 0.0, 0.0, 10.0, 10.0)));
        assert!(index.is_empty());

        index.insert(sticker("a", 0.0, 0.0, 10.0, 10.0));
        assert!(index.update(sticker("a", 100.0, 100.0, 10.0, 10.0)));
        assert_eq!(index.query_point(105.0, 105.0).len(), 1);
    }

    #[test]
    fn test_query_point_edges_are_inclusive() {
        let mut index = SpatialIndex::new();
        index.insert(sticker("a", 0.0, 0.0, 100.0, 100.0));

        assert_eq!(index.query_point(0.0, 0.0).len(), 1);
        assert_eq!(index.query_point(100.0, 100.0).len(), 1);
        assert_eq!(index.query_point(50.0, 100.0).len(), 1);
        assert!(index.query_point(100.1, 50.0).is_empty());
    }

    #[test]
    fn test_query_point_uses_rotated_bounds() {
        let mut index = SpatialIndex::new();
        // 100x100 centered on the origin, rotated 45 degrees. The bounding
        // box grows to roughly 141x141, so a point outside the unrotated box
        // but inside the enlarged one must hit.
        index.insert(sticker("a", -50.0, -50.0, 100.0, 100.0).with_rotation(45.0));

        assert_eq!(index.query_point(65.0, 0.0).len(), 1);
        assert!(index.query_point(75.0, 0.0).is_empty());
    }

    #[test]
    fn test_query_radius_sorted_nearest_first() {
        let mut index = SpatialIndex::new();
        index.load(vec![
            sticker("near", 10.0, 0.0, 10.0, 10.0),
            sticker("mid", 30.0, 0.0, 10.0, 10.0),
            sticker("far", 100.0, 0.0, 10.0, 10.0),
        ]);

        let results = index.query_radius(0.0, 5.0, 50.0);
        let ids: Vec<&str> = results.iter().map(|e| e.id.as_str()).collect();

        assert_eq!(ids, vec!["near", "mid"]);
    }

    #[test]
    fn test_query_radius_zero_inside_box() {
        let mut index = SpatialIndex::new();
        index.insert(sticker("a", 0.0, 0.0, 100.0, 100.0));

        // A point inside the box matches even with radius zero.
        assert_eq!(index.query_radius(50.0, 50.0, 0.0).len(), 1);
    }

    #[test]
    fn test_find_collisions() {
        let mut index = SpatialIndex::new();
        index.load(vec![
            sticker("a", 0.0, 0.0, 100.0, 100.0),
            sticker("b", 50.0, 50.0, 100.0, 100.0),
            sticker("c", 1000.0, 1000.0, 100.0, 100.0),
        ]);

        let hits = index.find_collisions("a");
        assert_eq!(sorted_ids(&hits), vec!["b"]);

        assert!(index.find_collisions("c").is_empty());
        assert!(index.find_collisions("missing").is_empty());
    }

    #[test]
    fn test_bounds_union_and_empty() {
        let mut index = SpatialIndex::new();
        assert!(index.bounds().is_none());

        index.load(vec![
            sticker("a", 0.0, 0.0, 100.0, 100.0),
            sticker("b", 400.0, -200.0, 100.0, 50.0),
        ]);

        let bounds = index.bounds().unwrap();
        assert_eq!(bounds.min().x, 0.0);
        assert_eq!(bounds.min().y, -200.0);
        assert_eq!(bounds.max().x, 500.0);
        assert_eq!(bounds.max().y, 100.0);

        index.remove("a");
        index.remove("b");
        assert!(index.bounds().is_none());
    }

    #[test]
    fn test_sort_by_depth() {
        let mut index = SpatialIndex::new();
        index.load(vec![
            sticker("top", 0.0, 0.0, 10.0, 10.0).with_z_index(5),
            sticker("bottom", 0.0, 0.0, 10.0, 10.0).with_z_index(-1),
            sticker("mid_a", 0.0, 0.0, 10.0, 10.0).with_z_index(2),
            sticker("mid_b", 0.0, 0.0, 10.0, 10.0).with_z_index(2),
        ]);

        let ids = vec![
            "top".to_string(),
            "mid_b".to_string(),
            "missing".to_string(),
            "mid_a".to_string(),
            "bottom".to_string(),
        ];
        let ordered = index.sort_by_depth(&ids);

        // Unknown ids are dropped and equal z keeps input order.
        assert_eq!(ordered, vec!["bottom", "mid_b", "mid_a", "top"]);
    }

    #[test]
    fn test_calculate_snap_against_neighbor() {
        let mut index = SpatialIndex::new();
        index.load(vec![
            sticker("moving", 0.0, 0.0, 50.0, 50.0),
            sticker("anchor", 60.0, 0.0, 50.0, 50.0),
        ]);

        // Dragged to x=57, three units short of the anchor's left edge.
        let result = index.calculate_snap("moving", 57.0, 0.0, 5.0);
        assert_eq!(result.snapped_x, Some(60.0));
        assert!(result.is_snapped());

        // Unknown ids never snap.
        let missing = index.calculate_snap("ghost", 57.0, 0.0, 5.0);
        assert!(!missing.is_snapped());
    }

    #[test]
    fn test_calculate_snap_nothing_in_range() {
        let mut index = SpatialIndex::new();
        index.load(vec![
            sticker("moving", 0.0, 0.0, 50.0, 50.0),
            sticker("anchor", 500.0, 500.0, 50.0, 50.0),
        ]);

        let result = index.calculate_snap("moving", 10.0, 10.0, 5.0);
        assert!(!result.is_snapped());
        assert!(result.guides.is_empty());
    }

    #[test]
    fn test_stats_track_rebuilds() {
        let mut index = SpatialIndex::new();
        index.load(vec![sticker("a", 0.0, 0.0, 10.0, 10.0)]);
        index.load(vec![
            sticker("a", 0.0, 0.0, 10.0, 10.0),
            sticker("b", 20.0, 0.0, 10.0, 10.0),
        ]);
        index.insert(sticker("c", 40.0, 0.0, 10.0, 10.0));

        let stats = index.stats();
        assert_eq!(stats.elements, 3);
        assert_eq!(stats.rebuilds, 2);
    }

    #[test]
    fn test_non_finite_elements_are_skipped() {
        let mut index = SpatialIndex::new();
        index.insert(sticker("nan", f64::NAN, 0.0, 10.0, 10.0));
        index.load(vec![
            sticker("ok", 0.0, 0.0, 10.0, 10.0),
            sticker("inf", f64::INFINITY, 0.0, 10.0, 10.0),
        ]);

        assert_eq!(index.len(), 1);
        assert!(index.contains("ok"));
        assert!(!index.contains("inf"));
        assert!(index.query_point(f64::NAN, 0.0).is_empty());
    }

    #[test]
    fn test_duplicate_ids_last_wins_on_load() {
        let mut index = SpatialIndex::new();
        index.load(vec![
            sticker("a", 0.0, 0.0, 10.0, 10.0),
            sticker("a", 500.0, 500.0, 10.0, 10.0),
        ]);

        assert_eq!(index.len(), 1);
        assert!(index.query_point(5.0, 5.0).is_empty());
        assert_eq!(index.query_point(505.0, 505.0).len(), 1);
    }

    #[test]
    fn test_viewport_parity_with_linear_scan() {
        fn next(state: &mut u64) -> f64 {
            *state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((*state >> 33) % 2001) as f64 - 1000.0
        }

        let mut state = 0x5EED_u64;
        let mut elements = Vec::new();
        for i in 0..200 {
            let x = next(&mut state);
            let y = next(&mut state);
            let w = next(&mut state).abs() / 10.0 + 5.0;
            let h = next(&mut state).abs() / 10.0 + 5.0;
            let rotation = next(&mut state) / 10.0;
            elements.push(sticker(&format!("e{i}"), x, y, w, h).with_rotation(rotation));
        }

        let mut index = SpatialIndex::new();
        index.load(elements.clone());

        let viewports = [
            ViewportBounds::new(-250.0, -250.0, 500.0, 500.0),
            ViewportBounds::new(0.0, 0.0, 100.0, 100.0),
            ViewportBounds::new(-1000.0, -1000.0, 2000.0, 2000.0),
        ];

        for viewport in &viewports {
            let query_rect = viewport.padded(0.0);
            let mut expected: Vec<&str> = elements
                .iter()
                .filter(|e| rects_intersect(&element_bounds(e), &query_rect))
                .map(|e| e.id.as_str())
                .collect();
            expected.sort_unstable();

            let results = index.query_viewport(viewport, 0.0);
            let mut actual: Vec<&str> = results.iter().map(|e| e.id.as_str()).collect();
            actual.sort_unstable();

            assert_eq!(actual, expected);
        }
    }
}
