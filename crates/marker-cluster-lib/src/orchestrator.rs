//! ClusteringOrchestrator - the stateful core wiring geometry, gate, classifier and index
//!
//! Every trigger is split in two halves so that hosts with their own event loop can
//! interleave events freely:
//!
//! 1. `begin_*` updates the synchronous state (viewport, markers, index content) and hands
//!    out a [`PendingComputation`] tagged with a fresh generation number.
//! 2. [`PendingComputation::run`] performs the (possibly suspending) index query without
//!    touching the orchestrator, and [`ClusteringOrchestrator::commit`] applies the result
//!    only if no newer computation has been started meanwhile.
//!
//! The `async` convenience methods (`mount`, `on_viewport_changed`, ...) chain both halves.

use crate::geometry::{self, MAX_ZOOM_LEVEL};
use crate::style::abbreviate_count;
use crate::{
    BoundingBox, ClusterError, ClusterId, ClusterIndex, ClusterResult, ClusterStyle,
    DisplayMetrics, IndexOptions, LEAF_POINT_COUNT, LocationRequest, MapItem, PixelDimensions,
    PointFeature, Result, SpatialIndex, SpatialIndexAdapter, Viewport, classify, should_recluster,
};

use geo::Coord;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration for the clustering orchestrator
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// Whether markers are clustered at all
    /// Default: true
    pub clustering_enabled: bool,
    /// Options the spatial index is built with
    pub index: IndexOptions,
    /// Pixel size the viewport is fitted into when choosing the zoom level
    /// Default: half of a 1080x1920 display with the axes exchanged, (960, 540)
    pub reference_pixel_dimensions: PixelDimensions,
    /// Viewports wider than this (in degrees of longitude delta) show raw markers
    /// Default: 80
    pub max_clustering_longitude_delta: f64,
    /// Where the map starts when neither a region nor a device position is available
    pub default_region: Viewport,
    /// One-shot geolocation parameters used for the initial viewport
    pub location_request: LocationRequest,
    /// Bubble presentation handed to the renderer
    pub style: ClusterStyle,
}

impl Default for Config {
    fn default() -> Self {
        Self::for_display(&DisplayMetrics::default())
    }
}

impl Config {
    /// Defaults with every device-relative size derived from `metrics`
    pub fn for_display(metrics: &DisplayMetrics) -> Self {
        Self {
            clustering_enabled: true,
            index: IndexOptions {
                radius: metrics.cluster_radius(),
                ..IndexOptions::default()
            },
            reference_pixel_dimensions: metrics.reference_dimensions(),
            max_clustering_longitude_delta: 80.0,
            default_region: Viewport::new(37.78825, -122.4324, 0.0922, 0.0421),
            location_request: LocationRequest::default(),
            style: ClusterStyle::for_display(metrics),
        }
    }
}

/// Lifecycle of an orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Ready,
}

/// An aggregated cluster as the renderer sees it
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterBubble {
    pub cluster_id: Option<ClusterId>,
    pub point_count: usize,
    /// WGS84 position (x = longitude, y = latitude)
    pub coordinate: Coord<f64>,
    /// Abbreviated count shown inside the bubble
    pub label: String,
}

impl ClusterBubble {
    pub fn new(cluster_id: Option<ClusterId>, point_count: usize, coordinate: Coord<f64>) -> Self {
        Self {
            cluster_id,
            point_count,
            coordinate,
            label: abbreviate_count(point_count),
        }
    }

    pub fn key(&self) -> String {
        let cluster_id = self.cluster_id.map(|id| id.to_string()).unwrap_or_default();
        format!(
            "[{},{}]{}{}",
            self.coordinate.x, self.coordinate.y, cluster_id, self.point_count
        )
    }
}

/// One entry of the render list
#[derive(Debug)]
pub enum RenderItem<P> {
    /// A single marker, drawn with the caller's own payload
    Marker(PointFeature<P>),
    Cluster(ClusterBubble),
    /// An item without coordinate, drawn unmodified
    Passthrough(Arc<P>),
}

impl<P> RenderItem<P> {
    /// Stable identity for diffing render lists
    pub fn key(&self) -> String {
        match self {
            Self::Marker(feature) => format!(
                "[{},{}]{}",
                feature.longitude(),
                feature.latitude(),
                LEAF_POINT_COUNT
            ),
            Self::Cluster(bubble) => bubble.key(),
            Self::Passthrough(payload) => format!("passthrough@{:p}", Arc::as_ptr(payload)),
        }
    }

    pub fn as_cluster(&self) -> Option<&ClusterBubble> {
        match self {
            Self::Cluster(bubble) => Some(bubble),
            _ => None,
        }
    }

    /// The caller's payload, if this item carries one
    pub fn payload(&self) -> Option<&P> {
        match self {
            Self::Marker(feature) => Some(feature.marker.as_ref()),
            Self::Passthrough(payload) => Some(payload.as_ref()),
            Self::Cluster(_) => None,
        }
    }
}

impl<P> Clone for RenderItem<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Marker(feature) => Self::Marker(feature.clone()),
            Self::Cluster(bubble) => Self::Cluster(bubble.clone()),
            Self::Passthrough(payload) => Self::Passthrough(Arc::clone(payload)),
        }
    }
}

impl<P> From<ClusterResult<P>> for RenderItem<P> {
    fn from(result: ClusterResult<P>) -> Self {
        match result.representative {
            Some(feature) if result.properties.point_count == LEAF_POINT_COUNT => {
                Self::Marker(feature)
            }
            _ => Self::Cluster(ClusterBubble::new(
                result.properties.cluster_id,
                result.properties.point_count,
                result.geometry.0,
            )),
        }
    }
}

/// Outcome of [`ClusteringOrchestrator::commit`] and the convenience triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderUpdate {
    /// The render list was replaced
    Applied,
    /// Nothing needed recomputing, the render list is the same object as before
    Unchanged,
    /// A newer computation was started meanwhile, the result was discarded
    Stale,
}

enum Work<P, I> {
    /// Result known without querying the index
    Ready(Vec<RenderItem<P>>),
    Query {
        index: Arc<I>,
        bbox: BoundingBox,
        zoom: u8,
        passthrough: Arc<Vec<Arc<P>>>,
    },
}

/// A started clustering computation, independent of the orchestrator until committed
pub struct PendingComputation<P, I = ClusterIndex<P>> {
    generation: u64,
    viewport: Viewport,
    /// Viewport recorded as last clustered on commit
    clustered_viewport: Option<Viewport>,
    work: Work<P, I>,
}

impl<P, I: SpatialIndex<P>> PendingComputation<P, I> {
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    /// Whether running this computation queries the index
    pub fn needs_query(&self) -> bool {
        matches!(self.work, Work::Query { .. })
    }

    /// Produce the render list; only this step may suspend
    pub async fn run(self) -> CompletedComputation<P> {
        let outcome = match self.work {
            Work::Ready(items) => Ok(items),
            Work::Query {
                index,
                bbox,
                zoom,
                passthrough,
            } => {
                tracing::debug!(
                    "Querying clusters for {:?} at zoom {} (generation {})",
                    bbox.to_array(),
                    zoom,
                    self.generation
                );
                index.query(bbox, zoom).await.map(|results| {
                    results
                        .into_iter()
                        .map(RenderItem::from)
                        .chain(passthrough.iter().cloned().map(RenderItem::Passthrough))
                        .collect()
                })
            }
        };

        CompletedComputation {
            generation: self.generation,
            clustered_viewport: self.clustered_viewport,
            outcome,
        }
    }
}

/// Result of [`PendingComputation::run`], waiting to be committed
pub struct CompletedComputation<P> {
    generation: u64,
    clustered_viewport: Option<Viewport>,
    outcome: Result<Vec<RenderItem<P>>>,
}

impl<P> CompletedComputation<P> {
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

type ClusterPressHandler = Box<dyn FnMut(&ClusterBubble)>;

/// Keeps a render list of markers, clusters and passthrough items in sync with the viewport
///
/// Generic over the index so hosts can plug their own [`SpatialIndex`]; the default
/// [`ClusterIndex`] additionally supports cluster drill-down.
pub struct ClusteringOrchestrator<P, I = ClusterIndex<P>> {
    config: Config,
    phase: Phase,
    current_viewport: Option<Viewport>,
    last_clustered_viewport: Option<Viewport>,
    generation: u64,
    /// Newest generation that reached `commit`; behind `generation` while one is in flight
    committed_generation: u64,
    /// Clustering was switched off because the index could not be built
    index_unavailable: bool,
    index: SpatialIndexAdapter<P, I>,
    features: Vec<PointFeature<P>>,
    passthrough: Arc<Vec<Arc<P>>>,
    render_list: Arc<Vec<RenderItem<P>>>,
    on_cluster_pressed: ClusterPressHandler,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<P, I: SpatialIndex<P>> ClusteringOrchestrator<P, I> {
    /// Create an unmounted orchestrator; nothing is computed until [`mount`](Self::mount)
    pub fn new(config: Config) -> Self {
        Self {
            config,
            phase: Phase::Uninitialized,
            current_viewport: None,
            last_clustered_viewport: None,
            generation: 0,
            committed_generation: 0,
            index_unavailable: false,
            index: SpatialIndexAdapter::new(),
            features: Vec::new(),
            passthrough: Arc::new(Vec::new()),
            render_list: Arc::new(Vec::new()),
            on_cluster_pressed: Box::new(|_| {}),
        }
    }

    /// Callback invoked by [`press_cluster`](Self::press_cluster)
    pub fn with_cluster_press_handler(
        mut self,
        handler: impl FnMut(&ClusterBubble) + 'static,
    ) -> Self {
        self.on_cluster_pressed = Box::new(handler);
        self
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Latest viewport reported by the host
    #[inline]
    pub fn viewport(&self) -> Option<Viewport> {
        self.current_viewport
    }

    /// Viewport the current render list was clustered for, `None` while showing raw markers
    /// for a too wide viewport
    #[inline]
    pub fn last_clustered_viewport(&self) -> Option<Viewport> {
        self.last_clustered_viewport
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn render_list(&self) -> &[RenderItem<P>] {
        &self.render_list
    }

    /// Shared handle to the render list, identity changes only when it is replaced
    pub fn render_snapshot(&self) -> Arc<Vec<RenderItem<P>>> {
        Arc::clone(&self.render_list)
    }

    /// Point features of the current marker set, in classification order
    pub fn features(&self) -> &[PointFeature<P>] {
        &self.features
    }

    pub fn passthrough(&self) -> &[Arc<P>] {
        &self.passthrough
    }

    fn require_viewport(&self) -> Result<Viewport> {
        match (self.phase, self.current_viewport) {
            (Phase::Ready, Some(viewport)) => Ok(viewport),
            _ => Err(ClusterError::NotMounted),
        }
    }

    /// Capture the initial viewport and markers, then start the first computation
    pub fn begin_mount(
        &mut self,
        viewport: Viewport,
        items: impl IntoIterator<Item = MapItem<P>>,
    ) -> Result<PendingComputation<P, I>> {
        if self.phase == Phase::Ready {
            return Err(ClusterError::AlreadyMounted);
        }
        viewport.validate()?;

        self.current_viewport = Some(viewport);
        self.replace_items(items);
        self.phase = Phase::Ready;
        tracing::info!(
            "Mounted with {} point features and {} passthrough items",
            self.features.len(),
            self.passthrough.len()
        );

        Ok(self.begin_computation(viewport))
    }

    pub async fn mount(
        &mut self,
        viewport: Viewport,
        items: impl IntoIterator<Item = MapItem<P>>,
    ) -> Result<RenderUpdate> {
        let pending = self.begin_mount(viewport, items)?;
        self.commit(pending.run().await)
    }

    /// Replace the marker set and start a computation for the current viewport
    pub fn begin_markers_change(
        &mut self,
        items: impl IntoIterator<Item = MapItem<P>>,
    ) -> Result<PendingComputation<P, I>> {
        let viewport = self.require_viewport()?;
        self.replace_items(items);
        Ok(self.begin_computation(viewport))
    }

    pub async fn on_markers_changed(
        &mut self,
        items: impl IntoIterator<Item = MapItem<P>>,
    ) -> Result<RenderUpdate> {
        let pending = self.begin_markers_change(items)?;
        self.commit(pending.run().await)
    }

    /// Record a completed region change; `None` if the gate keeps the current render list
    ///
    /// A degenerate viewport is rejected before any state changes. While an earlier
    /// computation is still uncommitted the gate is skipped, since the render list it will
    /// produce belongs to another viewport.
    pub fn begin_viewport_change(
        &mut self,
        viewport: Viewport,
    ) -> Result<Option<PendingComputation<P, I>>> {
        self.require_viewport()?;
        viewport.validate()?;
        self.current_viewport = Some(viewport);

        let in_flight = self.committed_generation != self.generation;
        if !in_flight && viewport.longitude_delta <= self.config.max_clustering_longitude_delta {
            if let Some(last) = &self.last_clustered_viewport {
                if !should_recluster(&viewport, last) {
                    tracing::debug!("Viewport change below threshold, keeping render list");
                    return Ok(None);
                }
            }
        }

        Ok(Some(self.begin_computation(viewport)))
    }

    pub async fn on_viewport_changed(&mut self, viewport: Viewport) -> Result<RenderUpdate> {
        match self.begin_viewport_change(viewport)? {
            Some(pending) => self.commit(pending.run().await),
            None => Ok(RenderUpdate::Unchanged),
        }
    }

    /// Start a computation for the current viewport and markers, bypassing the gate
    pub fn begin_refresh(&mut self) -> Result<PendingComputation<P, I>> {
        let viewport = self.require_viewport()?;
        Ok(self.begin_computation(viewport))
    }

    pub async fn refresh(&mut self) -> Result<RenderUpdate> {
        let pending = self.begin_refresh()?;
        self.commit(pending.run().await)
    }

    /// Apply a finished computation if it is still the newest one
    ///
    /// A failed query keeps the previous render list and returns the error.
    pub fn commit(&mut self, completed: CompletedComputation<P>) -> Result<RenderUpdate> {
        if completed.generation != self.generation {
            tracing::debug!(
                "Discarding stale computation {} (current is {})",
                completed.generation,
                self.generation
            );
            return Ok(RenderUpdate::Stale);
        }
        self.committed_generation = completed.generation;

        match completed.outcome {
            Ok(items) => {
                tracing::debug!("Render list updated with {} items", items.len());
                self.render_list = Arc::new(items);
                self.last_clustered_viewport = completed.clustered_viewport;
                Ok(RenderUpdate::Applied)
            }
            Err(e) => {
                tracing::warn!("Clustering failed, keeping previous render list: {}", e);
                Err(e)
            }
        }
    }

    /// Invoke the press handler for a cluster of the current render list
    pub fn press_cluster(&mut self, id: ClusterId) -> Result<()> {
        let bubble = self
            .render_list
            .iter()
            .filter_map(RenderItem::as_cluster)
            .find(|bubble| bubble.cluster_id == Some(id))
            .ok_or(ClusterError::ClusterNotFound(id))?;

        tracing::debug!("Cluster {} pressed ({} markers)", id, bubble.point_count);
        (self.on_cluster_pressed)(bubble);
        Ok(())
    }

    /// Toggle clustering and recompute for the current viewport
    pub async fn set_clustering_enabled(&mut self, enabled: bool) -> Result<RenderUpdate> {
        if !enabled {
            // An explicit opt-out outlives later reconfigurations
            self.index_unavailable = false;
        }
        if self.config.clustering_enabled == enabled {
            return Ok(RenderUpdate::Unchanged);
        }
        self.config.clustering_enabled = enabled;
        tracing::info!(
            "Clustering {}",
            if enabled { "enabled" } else { "disabled" }
        );

        if self.phase != Phase::Ready {
            return Ok(RenderUpdate::Unchanged);
        }
        if enabled {
            self.sync_index();
        }
        self.refresh().await
    }

    /// Rebuild the index with new options and recompute
    ///
    /// On invalid options the previous index and configuration are kept. If clustering was
    /// switched off only because the index could not be built, valid options switch it
    /// back on.
    pub async fn reconfigure(&mut self, options: IndexOptions) -> Result<RenderUpdate> {
        options.validate()?;
        if self.index.is_built() {
            self.index.reconfigure(&options, &self.features)?;
        }
        self.config.index = options;

        if self.index_unavailable {
            tracing::info!("Re-enabling clustering with {:?}", options);
            self.config.clustering_enabled = true;
            self.index_unavailable = false;
            if self.phase == Phase::Ready {
                self.sync_index();
            }
        }

        if self.phase != Phase::Ready {
            return Ok(RenderUpdate::Unchanged);
        }
        self.refresh().await
    }

    fn replace_items(&mut self, items: impl IntoIterator<Item = MapItem<P>>) {
        let (features, passthrough) = classify(items);
        self.features = features;
        self.passthrough = Arc::new(passthrough);
        self.sync_index();
    }

    /// Build the index if needed and load the current features into it
    ///
    /// A configuration error disables clustering instead of failing the caller.
    fn sync_index(&mut self) {
        if !self.config.clustering_enabled {
            return;
        }

        let synced = self
            .index
            .ensure_index(&self.config.index)
            .and_then(|()| self.index.reload(&self.features));

        if let Err(e) = synced {
            tracing::error!("Disabling clustering, spatial index unavailable: {}", e);
            self.config.clustering_enabled = false;
            self.index_unavailable = true;
        }
    }

    /// Markers in classification order followed by passthrough items
    fn raw_items(&self) -> Vec<RenderItem<P>> {
        self.features
            .iter()
            .cloned()
            .map(RenderItem::Marker)
            .chain(self.passthrough.iter().cloned().map(RenderItem::Passthrough))
            .collect()
    }

    fn begin_computation(&mut self, viewport: Viewport) -> PendingComputation<P, I> {
        self.generation += 1;
        let generation = self.generation;

        let (work, clustered_viewport) =
            if viewport.longitude_delta > self.config.max_clustering_longitude_delta {
                tracing::debug!(
                    "Longitude delta {} too wide for clustering, showing raw markers",
                    viewport.longitude_delta
                );
                (Work::Ready(self.raw_items()), None)
            } else {
                match self.index.snapshot() {
                    Some(index) if self.config.clustering_enabled && !index.is_empty() => {
                        let bbox = geometry::bounding_box_of(&viewport);
                        let zoom = geometry::zoom_level_for(
                            &bbox,
                            self.config.reference_pixel_dimensions,
                        );
                        let work = Work::Query {
                            index,
                            bbox,
                            zoom,
                            passthrough: Arc::clone(&self.passthrough),
                        };
                        (work, Some(viewport))
                    }
                    _ => (Work::Ready(self.raw_items()), Some(viewport)),
                }
            };

        PendingComputation {
            generation,
            viewport,
            clustered_viewport,
            work,
        }
    }
}

/// Drill-down queries, only available with the default index
impl<P> ClusteringOrchestrator<P, ClusterIndex<P>> {
    fn cluster_index(&self) -> Result<Arc<ClusterIndex<P>>> {
        self.index.snapshot().ok_or(ClusterError::IndexNotBuilt)
    }

    /// Zoom level at which the cluster splits up
    pub fn cluster_expansion_zoom(&self, id: ClusterId) -> Result<u8> {
        self.cluster_index()?.expansion_zoom(id)
    }

    /// Up to `limit` markers of a cluster, skipping the first `offset`
    pub fn cluster_leaves(
        &self,
        id: ClusterId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PointFeature<P>>> {
        self.cluster_index()?.leaves(id, limit, offset)
    }

    /// Items the cluster splits into one zoom level deeper
    pub fn cluster_children(&self, id: ClusterId) -> Result<Vec<RenderItem<P>>> {
        Ok(self
            .cluster_index()?
            .children(id)?
            .into_iter()
            .map(RenderItem::from)
            .collect())
    }

    /// Viewport centered on a cluster at the zoom where it splits up
    pub fn zoom_to_cluster(&self, id: ClusterId) -> Result<Viewport> {
        let index = self.cluster_index()?;
        let zoom = index.expansion_zoom(id)?.min(MAX_ZOOM_LEVEL);

        let shown = self
            .render_list
            .iter()
            .filter_map(RenderItem::as_cluster)
            .find(|bubble| bubble.cluster_id == Some(id))
            .map(|bubble| bubble.coordinate);

        let center = match shown {
            Some(center) => center,
            None => {
                // Count-weighted mean of the children
                let children = index.children(id)?;
                let (mut x, mut y, mut total) = (0.0, 0.0, 0.0);
                for child in &children {
                    let weight = child.properties.point_count.max(1) as f64;
                    x += child.geometry.x() * weight;
                    y += child.geometry.y() * weight;
                    total += weight;
                }
                Coord {
                    x: x / total,
                    y: y / total,
                }
            }
        };

        Ok(geometry::viewport_for_zoom(
            center,
            zoom,
            self.config.reference_pixel_dimensions,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bounding_box_of, zoom_level_for};
    use std::cell::RefCell;
    use std::rc::Rc;

    type TestOrchestrator = ClusteringOrchestrator<usize>;

    /// Zoom from which [`FlakyIndex`] fails every query
    const FAILING_ZOOM: u8 = 12;

    /// Default index that fails deep queries
    struct FlakyIndex(ClusterIndex<usize>);

    impl SpatialIndex<usize> for FlakyIndex {
        fn build(options: &IndexOptions) -> Result<Self> {
            ClusterIndex::new(*options).map(Self)
        }

        fn load(&mut self, features: &[PointFeature<usize>]) {
            self.0.load(features);
        }

        fn len(&self) -> usize {
            self.0.len()
        }

        async fn query(
            &self,
            bbox: BoundingBox,
            zoom: u8,
        ) -> Result<Vec<ClusterResult<usize>>> {
            tokio::task::yield_now().await;
            if zoom >= FAILING_ZOOM {
                return Err(ClusterError::InvalidBoundingBox("index offline".to_string()));
            }
            self.0.get_clusters(&bbox, zoom)
        }
    }

    fn region() -> Viewport {
        Viewport::new(0.0, 0.0, 10.0, 10.0)
    }

    /// Two tight groups of markers plus a passthrough item
    fn create_test_items() -> Vec<MapItem<usize>> {
        let mut items = Vec::new();
        for i in 0..4 {
            items.push(MapItem::point(2.0 + i as f64 * 0.001, 2.0, i));
        }
        items.push(MapItem::opaque(100));
        for i in 4..7 {
            items.push(MapItem::point(-3.0, -3.0 + i as f64 * 0.001, i));
        }
        items
    }

    /// Markers a few degrees apart across the default region
    fn create_test_spread(first_id: usize, count: usize) -> Vec<MapItem<usize>> {
        (0..count)
            .map(|i| {
                let lat = -8.0 + (i % 5) as f64 * 4.0;
                let lon = -8.0 + (i / 5) as f64 * 4.0;
                MapItem::point(lat + (first_id % 7) as f64 * 0.1, lon, first_id + i)
            })
            .collect()
    }

    fn keys(orchestrator: &ClusteringOrchestrator<usize, impl SpatialIndex<usize>>) -> Vec<String> {
        orchestrator.render_list().iter().map(RenderItem::key).collect()
    }

    fn represented(items: &[RenderItem<usize>]) -> usize {
        items
            .iter()
            .map(|item| match item {
                RenderItem::Marker(_) => 1,
                RenderItem::Cluster(bubble) => bubble.point_count,
                RenderItem::Passthrough(_) => 0,
            })
            .sum()
    }

    fn clusters(items: &[RenderItem<usize>]) -> Vec<&ClusterBubble> {
        items.iter().filter_map(RenderItem::as_cluster).collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.clustering_enabled);
        assert!((config.index.radius - 32.4).abs() < 1e-9);
        assert_eq!(config.index.min_zoom, 1);
        assert_eq!(config.index.max_zoom, 20);
        assert_eq!(
            config.reference_pixel_dimensions,
            PixelDimensions::new(960.0, 540.0)
        );
        assert_eq!(config.max_clustering_longitude_delta, 80.0);
        assert!(config.default_region.is_valid());
    }

    #[tokio::test]
    async fn test_mount_clusters_once() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        assert_eq!(orchestrator.phase(), Phase::Uninitialized);

        let update = orchestrator.mount(region(), create_test_items()).await.unwrap();
        assert_eq!(update, RenderUpdate::Applied);
        assert_eq!(orchestrator.phase(), Phase::Ready);
        assert_eq!(orchestrator.last_clustered_viewport(), Some(region()));

        let list = orchestrator.render_list();
        let bubbles = clusters(list);
        assert_eq!(bubbles.len(), 2);
        let mut counts: Vec<usize> = bubbles.iter().map(|b| b.point_count).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![3, 4]);

        // Passthrough items come last
        assert!(matches!(list.last(), Some(RenderItem::Passthrough(p)) if **p == 100));
        assert_eq!(represented(list), 7);
    }

    #[tokio::test]
    async fn test_mount_twice_is_rejected() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        orchestrator.mount(region(), Vec::new()).await.unwrap();
        assert!(matches!(
            orchestrator.mount(region(), Vec::new()).await,
            Err(ClusterError::AlreadyMounted)
        ));
    }

    #[tokio::test]
    async fn test_events_before_mount_are_rejected() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        assert!(matches!(
            orchestrator.on_viewport_changed(region()).await,
            Err(ClusterError::NotMounted)
        ));
        assert!(matches!(
            orchestrator.on_markers_changed(create_test_items()).await,
            Err(ClusterError::NotMounted)
        ));
    }

    #[tokio::test]
    async fn test_no_point_features_shows_passthrough_only() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        let items = vec![MapItem::opaque(7), MapItem::opaque(8)];
        orchestrator.mount(region(), items).await.unwrap();

        let payloads: Vec<usize> = orchestrator
            .render_list()
            .iter()
            .map(|item| match item {
                RenderItem::Passthrough(p) => **p,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(payloads, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_wide_viewport_shows_raw_markers() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        orchestrator.mount(region(), create_test_items()).await.unwrap();
        assert!(!clusters(orchestrator.render_list()).is_empty());

        let wide = Viewport::new(0.0, 0.0, 40.0, 85.0);
        let update = orchestrator.on_viewport_changed(wide).await.unwrap();
        assert_eq!(update, RenderUpdate::Applied);
        assert_eq!(orchestrator.last_clustered_viewport(), None);

        let payloads: Vec<usize> = orchestrator
            .render_list()
            .iter()
            .filter_map(|item| item.payload().copied())
            .collect();
        // Classification order: markers first, then passthrough
        assert_eq!(payloads, vec![0, 1, 2, 3, 4, 5, 6, 100]);
        assert!(clusters(orchestrator.render_list()).is_empty());

        // Coming back always reclusters
        let update = orchestrator.on_viewport_changed(region()).await.unwrap();
        assert_eq!(update, RenderUpdate::Applied);
        assert_eq!(clusters(orchestrator.render_list()).len(), 2);
    }

    #[tokio::test]
    async fn test_small_pan_keeps_render_list() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        orchestrator.mount(region(), create_test_items()).await.unwrap();
        let before = orchestrator.render_snapshot();
        let generation = orchestrator.generation();

        let panned = Viewport {
            latitude: 0.5,
            longitude: -0.5,
            ..region()
        };
        let update = orchestrator.on_viewport_changed(panned).await.unwrap();
        assert_eq!(update, RenderUpdate::Unchanged);
        assert!(Arc::ptr_eq(&before, &orchestrator.render_snapshot()));
        assert_eq!(orchestrator.generation(), generation);
        assert_eq!(orchestrator.viewport(), Some(panned));
        assert_eq!(orchestrator.last_clustered_viewport(), Some(region()));
    }

    #[tokio::test]
    async fn test_degenerate_viewport_leaves_state_untouched() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        orchestrator.mount(region(), create_test_items()).await.unwrap();
        let before = orchestrator.render_snapshot();

        let degenerate = Viewport::new(0.0, 0.0, 0.0, 10.0);
        assert!(matches!(
            orchestrator.on_viewport_changed(degenerate).await,
            Err(ClusterError::InvalidViewport { .. })
        ));
        assert_eq!(orchestrator.viewport(), Some(region()));
        assert!(Arc::ptr_eq(&before, &orchestrator.render_snapshot()));

        let mut unmounted = TestOrchestrator::new(Config::default());
        assert!(unmounted.mount(degenerate, Vec::new()).await.is_err());
        assert_eq!(unmounted.phase(), Phase::Uninitialized);
    }

    #[tokio::test]
    async fn test_zoom_in_splits_clusters() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        orchestrator.mount(region(), create_test_items()).await.unwrap();

        let street = Viewport::new(2.0015, 2.0, 0.002, 0.002);
        orchestrator.on_viewport_changed(street).await.unwrap();
        let payloads: Vec<usize> = orchestrator
            .render_list()
            .iter()
            .filter_map(|item| match item {
                RenderItem::Marker(feature) => Some(*feature.marker),
                _ => None,
            })
            .collect();
        assert_eq!(payloads, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_markers_change_uses_current_viewport() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        orchestrator.mount(region(), create_test_items()).await.unwrap();

        let elsewhere = Viewport::new(45.0, 90.0, 10.0, 10.0);
        orchestrator.on_viewport_changed(elsewhere).await.unwrap();
        assert_eq!(represented(orchestrator.render_list()), 0);

        let items = vec![
            MapItem::point(45.0, 90.0, 50),
            MapItem::point(45.0001, 90.0001, 51),
        ];
        let update = orchestrator.on_markers_changed(items).await.unwrap();
        assert_eq!(update, RenderUpdate::Applied);
        assert_eq!(orchestrator.last_clustered_viewport(), Some(elsewhere));
        assert_eq!(clusters(orchestrator.render_list())[0].point_count, 2);
    }

    #[tokio::test]
    async fn test_clustering_disabled_shows_raw_markers() {
        let config = Config {
            clustering_enabled: false,
            ..Config::default()
        };
        let mut orchestrator = TestOrchestrator::new(config);
        orchestrator.mount(region(), create_test_items()).await.unwrap();
        assert_eq!(orchestrator.render_list().len(), 8);
        assert!(clusters(orchestrator.render_list()).is_empty());

        let update = orchestrator.set_clustering_enabled(true).await.unwrap();
        assert_eq!(update, RenderUpdate::Applied);
        assert_eq!(clusters(orchestrator.render_list()).len(), 2);

        orchestrator.set_clustering_enabled(false).await.unwrap();
        assert!(clusters(orchestrator.render_list()).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_index_options_fall_back_to_raw_markers() {
        let config = Config {
            index: IndexOptions {
                radius: -5.0,
                ..IndexOptions::default()
            },
            ..Config::default()
        };
        let mut orchestrator = TestOrchestrator::new(config);
        let update = orchestrator.mount(region(), create_test_items()).await.unwrap();
        assert_eq!(update, RenderUpdate::Applied);
        assert!(!orchestrator.config().clustering_enabled);
        assert_eq!(orchestrator.render_list().len(), 8);
    }

    #[tokio::test]
    async fn test_valid_options_restore_clustering_after_index_failure() {
        let config = Config {
            index: IndexOptions {
                radius: -5.0,
                ..IndexOptions::default()
            },
            ..Config::default()
        };
        let mut orchestrator = TestOrchestrator::new(config);
        orchestrator.mount(region(), create_test_items()).await.unwrap();
        assert!(!orchestrator.config().clustering_enabled);

        let update = orchestrator.reconfigure(IndexOptions::default()).await.unwrap();
        assert_eq!(update, RenderUpdate::Applied);
        assert!(orchestrator.config().clustering_enabled);
        let items = orchestrator.render_list();
        assert_eq!(clusters(items).len(), 2);
        assert_eq!(represented(items), 7);
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_clustering_switched_off() {
        let config = Config {
            clustering_enabled: false,
            ..Config::default()
        };
        let mut orchestrator = TestOrchestrator::new(config);
        orchestrator.mount(region(), create_test_items()).await.unwrap();

        orchestrator.reconfigure(IndexOptions::default()).await.unwrap();
        assert!(!orchestrator.config().clustering_enabled);
        assert!(clusters(orchestrator.render_list()).is_empty());
        assert_eq!(orchestrator.render_list().len(), 8);
    }

    #[tokio::test]
    async fn test_reconfigure_rebuilds_index() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        orchestrator.mount(region(), create_test_spread(0, 25)).await.unwrap();
        assert!(clusters(orchestrator.render_list()).is_empty());

        let options = IndexOptions {
            radius: 400.0,
            ..IndexOptions::default()
        };
        orchestrator.reconfigure(options).await.unwrap();
        assert_eq!(orchestrator.config().index, options);
        let after = orchestrator.render_list();
        assert!(!clusters(after).is_empty());
        assert_eq!(represented(after), 25);

        let invalid = IndexOptions {
            min_zoom: 15,
            max_zoom: 3,
            ..options
        };
        assert!(orchestrator.reconfigure(invalid).await.is_err());
        assert_eq!(orchestrator.config().index, options);
    }

    #[tokio::test]
    async fn test_stale_computation_is_discarded() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        orchestrator.mount(region(), create_test_items()).await.unwrap();

        let slow = orchestrator
            .begin_viewport_change(Viewport::new(20.0, 20.0, 5.0, 5.0))
            .unwrap()
            .unwrap();
        let fast = orchestrator
            .begin_viewport_change(Viewport::new(2.0, 2.0, 1.0, 1.0))
            .unwrap()
            .unwrap();
        assert!(fast.generation() > slow.generation());

        let fast_done = fast.run().await;
        assert_eq!(orchestrator.commit(fast_done).unwrap(), RenderUpdate::Applied);
        let expected = keys(&orchestrator);

        let slow_done = slow.run().await;
        assert_eq!(orchestrator.commit(slow_done).unwrap(), RenderUpdate::Stale);
        assert_eq!(keys(&orchestrator), expected);
        assert_eq!(
            orchestrator.last_clustered_viewport(),
            Some(Viewport::new(2.0, 2.0, 1.0, 1.0))
        );
    }

    #[tokio::test]
    async fn test_small_pan_during_pending_query_is_not_gated() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        let items = vec![MapItem::point(0.0, 0.0, 1), MapItem::point(20.0, 20.0, 2)];
        orchestrator.mount(region(), items).await.unwrap();

        let far = orchestrator
            .begin_viewport_change(Viewport::new(20.0, 20.0, 5.0, 5.0))
            .unwrap()
            .unwrap();
        // Close to the committed viewport, but the list in flight is for the far one
        let back = orchestrator
            .begin_viewport_change(Viewport::new(0.5, 0.0, 10.0, 10.0))
            .unwrap()
            .expect("pan back must start its own computation");

        let far_done = far.run().await;
        assert_eq!(orchestrator.commit(far_done).unwrap(), RenderUpdate::Stale);
        let back_done = back.run().await;
        assert_eq!(orchestrator.commit(back_done).unwrap(), RenderUpdate::Applied);

        let payloads: Vec<usize> = orchestrator
            .render_list()
            .iter()
            .filter_map(RenderItem::payload)
            .copied()
            .collect();
        assert_eq!(payloads, vec![1]);
        assert_eq!(
            orchestrator.last_clustered_viewport(),
            Some(Viewport::new(0.5, 0.0, 10.0, 10.0))
        );

        // Once nothing is in flight the gate applies again
        let small = orchestrator
            .begin_viewport_change(Viewport::new(0.6, 0.0, 10.0, 10.0))
            .unwrap();
        assert!(small.is_none());
    }

    #[tokio::test]
    async fn test_marker_replacement_wins_over_pending_query() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        orchestrator.mount(region(), create_test_spread(0, 25)).await.unwrap();

        // A query against the old set is still in flight...
        let pending = orchestrator
            .begin_viewport_change(Viewport::new(0.0, 0.0, 9.0, 9.0))
            .unwrap()
            .unwrap();

        // ...when the caller replaces every marker
        let update = orchestrator
            .on_markers_changed(create_test_spread(1000, 10))
            .await
            .unwrap();
        assert_eq!(update, RenderUpdate::Applied);

        let late = pending.run().await;
        assert_eq!(orchestrator.commit(late).unwrap(), RenderUpdate::Stale);

        let list = orchestrator.render_list();
        assert_eq!(represented(list), 10);
        assert!(
            list.iter()
                .filter_map(|item| item.payload())
                .all(|&id| id >= 1000)
        );
        for bubble in clusters(list) {
            let leaves = orchestrator
                .cluster_leaves(bubble.cluster_id.unwrap(), usize::MAX, 0)
                .unwrap();
            assert!(leaves.iter().all(|leaf| *leaf.marker >= 1000));
        }
    }

    #[tokio::test]
    async fn test_final_state_is_path_independent() {
        let target = Viewport::new(2.0, 2.0, 3.0, 3.0);

        let mut direct = TestOrchestrator::new(Config::default());
        direct.mount(region(), create_test_spread(0, 25)).await.unwrap();
        direct.on_viewport_changed(target).await.unwrap();

        let mut wandering = TestOrchestrator::new(Config::default());
        wandering.mount(region(), create_test_spread(0, 25)).await.unwrap();
        for step in [
            Viewport::new(20.0, 20.0, 5.0, 5.0),
            Viewport::new(0.0, 0.0, 60.0, 120.0),
            Viewport::new(5.0, 5.0, 1.0, 1.0),
            target,
        ] {
            wandering.on_viewport_changed(step).await.unwrap();
        }

        assert_eq!(keys(&direct), keys(&wandering));
    }

    #[tokio::test]
    async fn test_query_failure_keeps_previous_list() {
        let mut orchestrator: ClusteringOrchestrator<usize, FlakyIndex> =
            ClusteringOrchestrator::new(Config::default());
        orchestrator.mount(region(), create_test_items()).await.unwrap();
        let before = orchestrator.render_snapshot();

        let street = Viewport::new(2.0, 2.0, 0.01, 0.01);
        let dimensions = orchestrator.config().reference_pixel_dimensions;
        assert!(zoom_level_for(&bounding_box_of(&street), dimensions) >= FAILING_ZOOM);

        let result = orchestrator.on_viewport_changed(street).await;
        assert!(matches!(result, Err(ClusterError::InvalidBoundingBox(_))));
        assert!(Arc::ptr_eq(&before, &orchestrator.render_snapshot()));
        assert_eq!(orchestrator.last_clustered_viewport(), Some(region()));

        // The next successful computation lands normally
        let wider = Viewport::new(5.0, 5.0, 4.0, 4.0);
        let update = orchestrator.on_viewport_changed(wider).await.unwrap();
        assert_eq!(update, RenderUpdate::Applied);
    }

    #[tokio::test]
    async fn test_press_cluster_invokes_handler() {
        let pressed = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&pressed);
        let mut orchestrator = TestOrchestrator::new(Config::default())
            .with_cluster_press_handler(move |bubble| sink.borrow_mut().push(bubble.point_count));
        orchestrator.mount(region(), create_test_items()).await.unwrap();

        let id = clusters(orchestrator.render_list())[0].cluster_id.unwrap();
        orchestrator.press_cluster(id).unwrap();
        assert_eq!(pressed.borrow().len(), 1);

        assert!(matches!(
            orchestrator.press_cluster(ClusterId(1)),
            Err(ClusterError::ClusterNotFound(_))
        ));
        assert_eq!(pressed.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_cluster_drill_down() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        orchestrator.mount(region(), create_test_items()).await.unwrap();

        let bubble = clusters(orchestrator.render_list())
            .into_iter()
            .find(|b| b.point_count == 4)
            .cloned()
            .unwrap();
        let id = bubble.cluster_id.unwrap();

        let children = orchestrator.cluster_children(id).unwrap();
        assert_eq!(represented(&children), 4);

        let mut leaves: Vec<usize> = orchestrator
            .cluster_leaves(id, 10, 0)
            .unwrap()
            .iter()
            .map(|f| *f.marker)
            .collect();
        leaves.sort_unstable();
        assert_eq!(leaves, vec![0, 1, 2, 3]);

        let expansion = orchestrator.cluster_expansion_zoom(id).unwrap();
        let viewport = orchestrator.zoom_to_cluster(id).unwrap();
        assert_eq!(viewport.center(), bubble.coordinate);
        assert_eq!(
            zoom_level_for(
                &bounding_box_of(&viewport),
                orchestrator.config().reference_pixel_dimensions
            ),
            expansion.min(MAX_ZOOM_LEVEL)
        );

        // Following the zoom really splits the cluster
        orchestrator.on_viewport_changed(viewport).await.unwrap();
        assert!(
            orchestrator
                .render_list()
                .iter()
                .all(|item| item.as_cluster().map(|b| b.cluster_id) != Some(Some(id)))
        );
    }

    #[tokio::test]
    async fn test_cluster_drill_down_unknown_id() {
        let mut orchestrator = TestOrchestrator::new(Config::default());
        assert!(matches!(
            orchestrator.cluster_expansion_zoom(ClusterId(42)),
            Err(ClusterError::IndexNotBuilt)
        ));
        orchestrator.mount(region(), create_test_items()).await.unwrap();
        assert!(matches!(
            orchestrator.zoom_to_cluster(ClusterId(3)),
            Err(ClusterError::ClusterNotFound(_))
        ));
    }

    #[test]
    fn test_render_item_keys() {
        let marker: RenderItem<usize> =
            RenderItem::Marker(PointFeature::new(Arc::new(1), Coord { x: 3.0, y: 4.5 }));
        assert_eq!(marker.key(), "[3,4.5]0");

        let bubble = ClusterBubble::new(Some(ClusterId(77)), 1234, Coord { x: 3.0, y: 4.5 });
        assert_eq!(bubble.label, "1.2k");
        assert_eq!(RenderItem::<usize>::Cluster(bubble).key(), "[3,4.5]771234");

        let shared = Arc::new(9usize);
        let a = RenderItem::Passthrough(Arc::clone(&shared));
        let b = RenderItem::Passthrough(Arc::new(9usize));
        assert_eq!(a.key(), a.clone().key());
        assert_ne!(a.key(), b.key());
    }
}
