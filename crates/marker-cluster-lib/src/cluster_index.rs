//! ClusterIndex - hierarchical greedy point clustering
//!
//! Points are projected into the normalized Web Mercator square and stored as the deepest
//! level (`max_zoom + 1`). Every shallower level is derived from the one below it by
//! greedily merging each node with its unclaimed neighbors inside the clustering radius at
//! that zoom, so a query is a single rectangle lookup on the level for its zoom.
//!
//! Cluster ids encode the node index and the level the cluster's children live on, which
//! lets drill-down queries (children, leaves, expansion zoom) find them again without any
//! extra bookkeeping.

use crate::utils::{lat_to_unit_y, lon_to_unit_x, unit_to_wgs84, wgs84_to_unit, wrap_longitude};
use crate::{
    BoundingBox, ClusterError, ClusterId, ClusterResult, DisplayMetrics, PointFeature, Quadtree,
    Result, SpatialIndex,
};

use geo::{Coord, Point, Rect};
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Deepest supported `max_zoom`; the origin level of a cluster id is stored in 5 bits
pub const MAX_SUPPORTED_ZOOM: u8 = 30;

/// Bits of a cluster id reserved for the origin level
const ZOOM_BITS: u32 = 5;

/// Fixed construction options of a [`ClusterIndex`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct IndexOptions {
    /// Clustering radius in pixels of a tile of `extent` pixels
    /// Default: 3% of a 1080px wide display
    pub radius: f64,
    /// Tile extent the radius is expressed in
    pub extent: f64,
    /// Shallowest zoom level that gets clusters
    pub min_zoom: u8,
    /// Deepest zoom level that gets clusters; deeper queries see single markers only
    pub max_zoom: u8,
    /// Minimum number of markers forming a cluster
    pub min_points: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            radius: DisplayMetrics::default().cluster_radius(),
            extent: 512.0,
            min_zoom: 1,
            max_zoom: 20,
            min_points: 2,
        }
    }
}

impl IndexOptions {
    pub fn validate(&self) -> Result<()> {
        let reason = if !(self.radius.is_finite() && self.radius > 0.0) {
            format!("radius must be positive, got {}", self.radius)
        } else if !(self.extent.is_finite() && self.extent > 0.0) {
            format!("extent must be positive, got {}", self.extent)
        } else if self.min_zoom > self.max_zoom {
            format!(
                "min_zoom {} is above max_zoom {}",
                self.min_zoom, self.max_zoom
            )
        } else if self.max_zoom > MAX_SUPPORTED_ZOOM {
            format!(
                "max_zoom {} exceeds the supported {}",
                self.max_zoom, MAX_SUPPORTED_ZOOM
            )
        } else if self.min_points < 2 {
            format!("min_points must be at least 2, got {}", self.min_points)
        } else {
            return Ok(());
        };
        Err(ClusterError::InvalidOptions { reason })
    }

    /// Clustering radius at `zoom`, in unit-square distance
    #[inline]
    fn radius_at(&self, zoom: u8) -> f64 {
        self.radius / (self.extent * 2f64.powi(zoom as i32))
    }
}

/// What a node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    /// Index into the loaded features
    Leaf(usize),
    Cluster(ClusterId),
}

#[derive(Debug, Clone, Copy)]
struct Node {
    /// Unit-square position (weighted centroid for clusters)
    position: Point<f64>,
    /// Number of markers represented (1 for leaves)
    point_count: usize,
    kind: NodeKind,
    /// Cluster this node was merged into on the next shallower level
    parent: Option<ClusterId>,
}

/// All nodes of one zoom level plus their spatial index
#[derive(Debug, Clone, Default)]
struct Level {
    nodes: Vec<Node>,
    tree: Quadtree,
}

impl Level {
    fn new(nodes: Vec<Node>) -> Self {
        let tree = Quadtree::from_entries(
            nodes
                .iter()
                .enumerate()
                .map(|(i, node)| (node.position, i)),
        );
        Self { nodes, tree }
    }
}

/// Default [`SpatialIndex`]: one precomputed cluster level per integer zoom
pub struct ClusterIndex<P> {
    options: IndexOptions,
    features: Vec<PointFeature<P>>,
    /// `levels[z - min_zoom]` for `z` in `min_zoom..=max_zoom + 1`
    levels: Vec<Level>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<P> ClusterIndex<P> {
    /// Create an empty index
    pub fn new(options: IndexOptions) -> Result<Self> {
        options.validate()?;
        let mut index = Self {
            options,
            features: Vec::new(),
            levels: Vec::new(),
        };
        index.load(&[]);
        Ok(index)
    }

    #[inline]
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Replace the content and rebuild every cluster level
    pub fn load(&mut self, features: &[PointFeature<P>]) {
        #[cfg(feature = "profiling")]
        profiling::scope!("cluster_index::load");

        self.features = features.to_vec();

        let coordinates: Vec<Coord<f64>> = features.iter().map(|f| f.coordinate).collect();
        let leaves: Vec<Node> = coordinates
            .par_iter()
            .enumerate()
            .map(|(i, coordinate)| {
                let longitude = if (-180.0..=180.0).contains(&coordinate.x) {
                    coordinate.x
                } else {
                    wrap_longitude(coordinate.x)
                };
                Node {
                    position: wgs84_to_unit(Coord {
                        x: longitude,
                        y: coordinate.y,
                    }),
                    point_count: 1,
                    kind: NodeKind::Leaf(i),
                    parent: None,
                }
            })
            .collect();

        let level_count = (self.options.max_zoom - self.options.min_zoom) as usize + 2;
        let mut levels = Vec::with_capacity(level_count);
        let mut current = Level::new(leaves);
        for zoom in (self.options.min_zoom..=self.options.max_zoom).rev() {
            let next = self.cluster_level(&mut current, zoom);
            levels.push(current);
            current = next;
        }
        levels.push(current);
        levels.reverse();
        self.levels = levels;

        tracing::debug!(
            "Clustered {} features into {} nodes at zoom {}",
            self.features.len(),
            self.levels.first().map_or(0, |level| level.nodes.len()),
            self.options.min_zoom
        );
    }

    /// Merge the nodes of `previous` (zoom + 1) into the level for `zoom`
    ///
    /// Nodes are visited in index order, so the result only depends on the input order.
    fn cluster_level(&self, previous: &mut Level, zoom: u8) -> Level {
        let radius = self.options.radius_at(zoom);
        let mut claimed = vec![false; previous.nodes.len()];
        let mut next = Vec::new();

        for i in 0..previous.nodes.len() {
            if claimed[i] {
                continue;
            }
            claimed[i] = true;

            let origin = previous.nodes[i];
            let neighbors = previous.tree.within(origin.position, radius);

            let point_count = origin.point_count
                + neighbors
                    .iter()
                    .filter(|&&k| !claimed[k])
                    .map(|&k| previous.nodes[k].point_count)
                    .sum::<usize>();

            if point_count > origin.point_count && point_count >= self.options.min_points {
                let id = self.encode_id(i, zoom + 1);
                let mut weighted_x = origin.position.x() * origin.point_count as f64;
                let mut weighted_y = origin.position.y() * origin.point_count as f64;

                for &k in &neighbors {
                    if claimed[k] {
                        continue;
                    }
                    claimed[k] = true;
                    let neighbor = &mut previous.nodes[k];
                    weighted_x += neighbor.position.x() * neighbor.point_count as f64;
                    weighted_y += neighbor.position.y() * neighbor.point_count as f64;
                    neighbor.parent = Some(id);
                }
                previous.nodes[i].parent = Some(id);

                next.push(Node {
                    position: Point::new(
                        weighted_x / point_count as f64,
                        weighted_y / point_count as f64,
                    ),
                    point_count,
                    kind: NodeKind::Cluster(id),
                    parent: None,
                });
            } else {
                next.push(Node {
                    parent: None,
                    ..origin
                });

                // Too few for a cluster: the neighbors carry over on their own
                if point_count > 1 {
                    for &k in &neighbors {
                        if claimed[k] {
                            continue;
                        }
                        claimed[k] = true;
                        next.push(Node {
                            parent: None,
                            ..previous.nodes[k]
                        });
                    }
                }
            }
        }

        Level::new(next)
    }

    fn encode_id(&self, index: usize, origin_zoom: u8) -> ClusterId {
        let raw = ((index as u64) << ZOOM_BITS) + origin_zoom as u64;
        ClusterId(raw + self.features.len() as u64)
    }

    /// `(node index, level)` of the node a cluster was grown from
    fn decode_id(&self, id: ClusterId) -> Option<(usize, u8)> {
        let raw = id.0.checked_sub(self.features.len() as u64)?;
        let origin_zoom = (raw % (1 << ZOOM_BITS)) as u8;
        let index = (raw >> ZOOM_BITS) as usize;

        if origin_zoom <= self.options.min_zoom || origin_zoom > self.options.max_zoom + 1 {
            return None;
        }
        let origin = self.level(origin_zoom)?.nodes.get(index)?;
        // Ids of other loads can decode to an unrelated node
        (origin.parent == Some(id)).then_some((index, origin_zoom))
    }

    fn level(&self, zoom: u8) -> Option<&Level> {
        let offset = zoom.checked_sub(self.options.min_zoom)?;
        self.levels.get(offset as usize)
    }

    /// Zoom of the level that answers a query at `zoom`
    #[inline]
    fn limit_zoom(&self, zoom: u8) -> u8 {
        zoom.clamp(self.options.min_zoom, self.options.max_zoom + 1)
    }

    fn to_result(&self, node: &Node) -> ClusterResult<P> {
        match node.kind {
            NodeKind::Leaf(i) => ClusterResult::leaf(self.features[i].clone()),
            NodeKind::Cluster(id) => ClusterResult::cluster(
                Point::from(unit_to_wgs84(node.position)),
                id,
                node.point_count,
            ),
        }
    }

    /// Clusters and single markers inside `bbox` at `zoom`
    ///
    /// Longitudes are wrapped, so boxes crossing the antimeridian work; a box spanning
    /// 360° or more covers the whole world.
    pub fn get_clusters(&self, bbox: &BoundingBox, zoom: u8) -> Result<Vec<ClusterResult<P>>> {
        #[cfg(feature = "profiling")]
        profiling::scope!("cluster_index::get_clusters");

        if !bbox.is_finite() {
            return Err(ClusterError::InvalidBoundingBox(format!(
                "{:?} is not finite",
                bbox.to_array()
            )));
        }

        let mut west = wrap_longitude(bbox.west);
        let south = bbox.south.clamp(-90.0, 90.0);
        let mut east = if bbox.east == 180.0 {
            180.0
        } else {
            wrap_longitude(bbox.east)
        };
        let north = bbox.north.clamp(-90.0, 90.0);

        if bbox.east - bbox.west >= 360.0 {
            west = -180.0;
            east = 180.0;
        } else if west > east {
            let mut results =
                self.get_clusters(&BoundingBox::new(west, south, 180.0, north), zoom)?;
            results.extend(
                self.get_clusters(&BoundingBox::new(-180.0, south, east, north), zoom)?,
            );
            return Ok(results);
        }

        let Some(level) = self.level(self.limit_zoom(zoom)) else {
            return Ok(Vec::new());
        };
        let rect = Rect::new(
            Coord {
                x: lon_to_unit_x(west),
                y: lat_to_unit_y(north),
            },
            Coord {
                x: lon_to_unit_x(east),
                y: lat_to_unit_y(south),
            },
        );

        Ok(level
            .tree
            .query_rect(rect)
            .into_iter()
            .map(|i| self.to_result(&level.nodes[i]))
            .collect())
    }

    fn child_nodes(&self, id: ClusterId) -> Result<Vec<&Node>> {
        let not_found = || ClusterError::ClusterNotFound(id);
        let (index, origin_zoom) = self.decode_id(id).ok_or_else(not_found)?;
        let level = self.level(origin_zoom).ok_or_else(not_found)?;
        let origin = level.nodes[index];

        let children: Vec<&Node> = level
            .tree
            .within(origin.position, self.options.radius_at(origin_zoom - 1))
            .into_iter()
            .map(|k| &level.nodes[k])
            .filter(|node| node.parent == Some(id))
            .collect();

        if children.is_empty() {
            return Err(not_found());
        }
        Ok(children)
    }

    /// Direct children of a cluster, one level deeper
    pub fn children(&self, id: ClusterId) -> Result<Vec<ClusterResult<P>>> {
        Ok(self
            .child_nodes(id)?
            .into_iter()
            .map(|node| self.to_result(node))
            .collect())
    }

    /// Up to `limit` original markers of a cluster, skipping the first `offset`
    pub fn leaves(
        &self,
        id: ClusterId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PointFeature<P>>> {
        let mut leaves = Vec::new();
        if limit > 0 {
            self.append_leaves(&mut leaves, id, limit, offset, 0)?;
        } else {
            // Still report unknown ids
            self.child_nodes(id)?;
        }
        Ok(leaves)
    }

    fn append_leaves(
        &self,
        leaves: &mut Vec<PointFeature<P>>,
        id: ClusterId,
        limit: usize,
        offset: usize,
        mut skipped: usize,
    ) -> Result<usize> {
        for child in self.child_nodes(id)? {
            match child.kind {
                NodeKind::Cluster(child_id) => {
                    if skipped + child.point_count <= offset {
                        // Skip the whole subtree
                        skipped += child.point_count;
                    } else {
                        skipped = self.append_leaves(leaves, child_id, limit, offset, skipped)?;
                    }
                }
                NodeKind::Leaf(i) => {
                    if skipped < offset {
                        skipped += 1;
                    } else {
                        leaves.push(self.features[i].clone());
                    }
                }
            }
            if leaves.len() >= limit {
                break;
            }
        }
        Ok(skipped)
    }

    /// Shallowest zoom at which the cluster breaks up into several items
    pub fn expansion_zoom(&self, id: ClusterId) -> Result<u8> {
        let (_, origin_zoom) = self
            .decode_id(id)
            .ok_or(ClusterError::ClusterNotFound(id))?;

        let mut expansion = origin_zoom - 1;
        let mut current = id;
        while expansion <= self.options.max_zoom {
            let children = self.child_nodes(current)?;
            expansion += 1;
            match children.as_slice() {
                [only] => match only.kind {
                    NodeKind::Cluster(next) => current = next,
                    NodeKind::Leaf(_) => break,
                },
                _ => break,
            }
        }
        Ok(expansion)
    }
}

impl<P> SpatialIndex<P> for ClusterIndex<P> {
    fn build(options: &IndexOptions) -> Result<Self> {
        ClusterIndex::new(*options)
    }

    fn load(&mut self, features: &[PointFeature<P>]) {
        ClusterIndex::load(self, features)
    }

    fn len(&self) -> usize {
        self.features.len()
    }

    async fn query(&self, bbox: BoundingBox, zoom: u8) -> Result<Vec<ClusterResult<P>>> {
        self.get_clusters(&bbox, zoom)
    }
}
