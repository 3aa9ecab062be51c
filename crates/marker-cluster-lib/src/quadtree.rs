//! Point quadtree for rectangle and radius queries
//!
//! The tree is rooted at the normalized Web Mercator square `[0, 1]²` (see [`crate::utils`])
//! and stores `(position, id)` entries. Leaves split once they exceed a small bucket size,
//! so dense marker sets end up in deep, narrow nodes while sparse areas stay shallow.

use geo::{Coord, Point, Rect};
use smallvec::SmallVec;

/// Maximum depth of the quadtree to prevent infinite recursion on duplicate points
const MAX_DEPTH: u32 = 20;

/// Entries a leaf holds before it subdivides
const NODE_CAPACITY: usize = 16;

/// A positioned id stored in the tree
#[derive(Debug, Clone, Copy)]
struct Entry {
    position: Point<f64>,
    id: usize,
}

/// Root container for the point quadtree
#[derive(Debug, Clone)]
pub struct Quadtree {
    /// Root node covering the whole indexed area
    root: QuadtreeNode,
    /// Number of stored entries
    len: usize,
}

/// A single node in the quadtree
#[derive(Debug, Clone)]
struct QuadtreeNode {
    /// Bounds of this node (inclusive on every edge)
    bounding_box: Rect<f64>,
    /// Depth level in the tree (0 = root)
    level: u32,
    /// Entries stored here while the node is a leaf
    entries: SmallVec<[Entry; NODE_CAPACITY]>,
    /// Child nodes (NW, NE, SW, SE) if subdivided
    children: Option<Box<[QuadtreeNode; 4]>>,
}

impl Default for Quadtree {
    fn default() -> Self {
        Self::new()
    }
}

impl Quadtree {
    /// Create an empty quadtree over the unit square
    pub fn new() -> Self {
        Self::with_bounds(Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }))
    }

    /// Create an empty quadtree over arbitrary bounds
    fn with_bounds(bounds: Rect<f64>) -> Self {
        Self {
            root: QuadtreeNode::new(bounds, 0),
            len: 0,
        }
    }

    /// Build a unit-square quadtree from `(position, id)` pairs
    pub fn from_entries(entries: impl IntoIterator<Item = (Point<f64>, usize)>) -> Self {
        let mut tree = Self::new();
        for (position, id) in entries {
            tree.insert(position, id);
        }
        tree
    }

    /// Insert an entry; returns `false` (and stores nothing) if it lies outside the bounds
    pub fn insert(&mut self, position: Point<f64>, id: usize) -> bool {
        let inserted = self.root.insert(Entry { position, id });
        if inserted {
            self.len += 1;
        }
        inserted
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ids of all entries inside `rect` (edges included), in ascending order
    pub fn query_rect(&self, rect: Rect<f64>) -> Vec<usize> {
        let mut results = Vec::new();
        self.root.query_rect(rect, &mut results);
        results.sort_unstable();
        results
    }

    /// Ids of all entries within `radius` of `center` (boundary included), in ascending order
    pub fn within(&self, center: Point<f64>, radius: f64) -> Vec<usize> {
        let square = Rect::new(
            Coord {
                x: center.x() - radius,
                y: center.y() - radius,
            },
            Coord {
                x: center.x() + radius,
                y: center.y() + radius,
            },
        );
        let radius_squared = radius * radius;

        let mut candidates = Vec::new();
        self.root.query_entries(square, &mut candidates);

        let mut results: Vec<usize> = candidates
            .into_iter()
            .filter(|entry| {
                let dx = entry.position.x() - center.x();
                let dy = entry.position.y() - center.y();
                dx * dx + dy * dy <= radius_squared
            })
            .map(|entry| entry.id)
            .collect();
        results.sort_unstable();
        results
    }

    /// Deepest level currently present in the tree
    #[cfg(test)]
    pub(crate) fn depth(&self) -> u32 {
        self.root.depth()
    }
}

impl QuadtreeNode {
    fn new(bounding_box: Rect<f64>, level: u32) -> Self {
        Self {
            bounding_box,
            level,
            entries: SmallVec::new(),
            children: None,
        }
    }

    fn insert(&mut self, entry: Entry) -> bool {
        if !self.contains(entry.position) {
            return false;
        }

        if let Some(children) = &mut self.children {
            let quadrant = Self::quadrant_of(self.bounding_box, entry.position);
            return children[quadrant].insert(entry);
        }

        self.entries.push(entry);

        if self.entries.len() > NODE_CAPACITY && self.level < MAX_DEPTH {
            self.subdivide();
        }
        true
    }

    /// Split into 4 children and push the stored entries down
    fn subdivide(&mut self) {
        if self.children.is_some() {
            return; // Already subdivided
        }

        let min = self.bounding_box.min();
        let max = self.bounding_box.max();
        let mid_x = (min.x + max.x) / 2.0;
        let mid_y = (min.y + max.y) / 2.0;
        let child_level = self.level + 1;

        let nw = QuadtreeNode::new(
            Rect::new(Coord { x: min.x, y: mid_y }, Coord { x: mid_x, y: max.y }),
            child_level,
        );
        let ne = QuadtreeNode::new(
            Rect::new(Coord { x: mid_x, y: mid_y }, Coord { x: max.x, y: max.y }),
            child_level,
        );
        let sw = QuadtreeNode::new(
            Rect::new(Coord { x: min.x, y: min.y }, Coord { x: mid_x, y: mid_y }),
            child_level,
        );
        let se = QuadtreeNode::new(
            Rect::new(Coord { x: mid_x, y: min.y }, Coord { x: max.x, y: mid_y }),
            child_level,
        );

        let mut children = Box::new([nw, ne, sw, se]);
        for entry in self.entries.drain(..) {
            let quadrant = Self::quadrant_of(self.bounding_box, entry.position);
            children[quadrant].insert(entry);
        }
        self.children = Some(children);
    }

    /// Child slot for a point, matching the NW, NE, SW, SE layout of `subdivide`
    fn quadrant_of(bounding_box: Rect<f64>, position: Point<f64>) -> usize {
        let min = bounding_box.min();
        let max = bounding_box.max();
        let is_east = position.x() >= (min.x + max.x) / 2.0;
        let is_north = position.y() >= (min.y + max.y) / 2.0;

        match (is_east, is_north) {
            (false, true) => 0,  // NW
            (true, true) => 1,   // NE
            (false, false) => 2, // SW
            (true, false) => 3,  // SE
        }
    }

    fn contains(&self, position: Point<f64>) -> bool {
        let min = self.bounding_box.min();
        let max = self.bounding_box.max();
        position.x() >= min.x
            && position.x() <= max.x
            && position.y() >= min.y
            && position.y() <= max.y
    }

    fn query_rect(&self, rect: Rect<f64>, results: &mut Vec<usize>) {
        let mut entries = Vec::new();
        self.query_entries(rect, &mut entries);
        results.extend(entries.into_iter().map(|entry| entry.id));
    }

    /// Collect entries inside `rect`, culling nodes that do not intersect it
    fn query_entries(&self, rect: Rect<f64>, results: &mut Vec<Entry>) {
        if !self.intersects(rect) {
            return;
        }

        let min = rect.min();
        let max = rect.max();
        results.extend(self.entries.iter().copied().filter(|entry| {
            let p = entry.position;
            p.x() >= min.x && p.x() <= max.x && p.y() >= min.y && p.y() <= max.y
        }));

        if let Some(children) = &self.children {
            for child in children.iter() {
                child.query_entries(rect, results);
            }
        }
    }

    /// Check if this node intersects the rectangle
    fn intersects(&self, rect: Rect<f64>) -> bool {
        let min = self.bounding_box.min();
        let max = self.bounding_box.max();
        let rmin = rect.min();
        let rmax = rect.max();

        !(max.x < rmin.x || min.x > rmax.x || max.y < rmin.y || min.y > rmax.y)
    }

    #[cfg(test)]
    fn depth(&self) -> u32 {
        match &self.children {
            Some(children) => children.iter().map(|c| c.depth()).max().unwrap_or(self.level),
            None => self.level,
        }
    }
}
