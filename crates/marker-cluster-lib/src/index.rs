//! Spatial index seam and the adapter that owns one index per orchestrator

use crate::{BoundingBox, ClusterError, IndexOptions, PointFeature, Result};
use geo::Point;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// `point_count` reported for a single marker
pub const LEAF_POINT_COUNT: usize = 0;

/// Opaque identifier of an aggregated cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Properties attached to every query result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClusterProperties {
    /// [`LEAF_POINT_COUNT`] for single markers, the aggregated count (≥ 2) otherwise
    pub point_count: usize,
    pub cluster_id: Option<ClusterId>,
}

/// One entry of a spatial query: either a single marker or an aggregated cluster
#[derive(Debug)]
pub struct ClusterResult<P> {
    /// WGS84 position (x = longitude, y = latitude)
    pub geometry: Point<f64>,
    pub properties: ClusterProperties,
    /// The original feature, present exactly when this is a leaf
    pub representative: Option<PointFeature<P>>,
}

impl<P> ClusterResult<P> {
    pub fn leaf(feature: PointFeature<P>) -> Self {
        Self {
            geometry: Point::from(feature.coordinate),
            properties: ClusterProperties {
                point_count: LEAF_POINT_COUNT,
                cluster_id: None,
            },
            representative: Some(feature),
        }
    }

    pub fn cluster(geometry: Point<f64>, cluster_id: ClusterId, point_count: usize) -> Self {
        Self {
            geometry,
            properties: ClusterProperties {
                point_count,
                cluster_id: Some(cluster_id),
            },
            representative: None,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.properties.point_count == LEAF_POINT_COUNT
    }

    /// Display identity: geometry, cluster id and point count concatenated
    pub fn key(&self) -> String {
        let cluster_id = self
            .properties
            .cluster_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        format!(
            "[{},{}]{}{}",
            self.geometry.x(),
            self.geometry.y(),
            cluster_id,
            self.properties.point_count
        )
    }
}

impl<P> Clone for ClusterResult<P> {
    fn clone(&self) -> Self {
        Self {
            geometry: self.geometry,
            properties: self.properties,
            representative: self.representative.clone(),
        }
    }
}

/// A point clusterer queried by bounding box and integer zoom
///
/// Implementations are built once with fixed options, have their content replaced
/// wholesale by [`SpatialIndex::load`], and are otherwise read-only.
pub trait SpatialIndex<P>: Sized {
    /// Create an empty index, rejecting invalid options
    fn build(options: &IndexOptions) -> Result<Self>;

    /// Replace the whole content of the index
    fn load(&mut self, features: &[PointFeature<P>]);

    /// Number of loaded features
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clusters and single markers visible in `bbox` at `zoom`
    ///
    /// Deterministic for a given content, `bbox` and `zoom`. May suspend.
    fn query(
        &self,
        bbox: BoundingBox,
        zoom: u8,
    ) -> impl Future<Output = Result<Vec<ClusterResult<P>>>>;
}

/// Owns the single spatial index of an orchestrator
///
/// The index is created lazily on the first [`ensure_index`](Self::ensure_index) and shared
/// as an `Arc` snapshot with in-flight queries, so a [`reload`](Self::reload) never changes
/// what an already started query sees.
pub struct SpatialIndexAdapter<P, I> {
    index: Option<Arc<I>>,
    options: Option<IndexOptions>,
    _payload: PhantomData<fn() -> P>,
}

impl<P, I> Default for SpatialIndexAdapter<P, I> {
    fn default() -> Self {
        Self {
            index: None,
            options: None,
            _payload: PhantomData,
        }
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<P, I: SpatialIndex<P>> SpatialIndexAdapter<P, I> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_built(&self) -> bool {
        self.index.is_some()
    }

    /// Options the index was built with, if it exists
    pub fn options(&self) -> Option<&IndexOptions> {
        self.options.as_ref()
    }

    /// Build the index if it does not exist yet; later calls keep the existing one
    pub fn ensure_index(&mut self, options: &IndexOptions) -> Result<()> {
        if let Some(existing) = &self.options {
            if existing != options {
                tracing::debug!(
                    "Spatial index already built with {:?}, ignoring {:?}",
                    existing,
                    options
                );
            }
            return Ok(());
        }

        let index = I::build(options)?;
        tracing::debug!("Built spatial index with {:?}", options);
        self.index = Some(Arc::new(index));
        self.options = Some(*options);
        Ok(())
    }

    /// Replace the index content
    ///
    /// If a query still holds the current snapshot, a fresh index is built instead of
    /// mutating the shared one.
    pub fn reload(&mut self, features: &[PointFeature<P>]) -> Result<()> {
        #[cfg(feature = "profiling")]
        profiling::scope!("index::reload");

        let (Some(index), Some(options)) = (&mut self.index, &self.options) else {
            return Err(ClusterError::IndexNotBuilt);
        };

        match Arc::get_mut(index) {
            Some(exclusive) => exclusive.load(features),
            None => {
                let mut fresh = I::build(options)?;
                fresh.load(features);
                *index = Arc::new(fresh);
            }
        }

        tracing::info!("Loaded {} point features into the spatial index", features.len());
        Ok(())
    }

    /// Drop the current index and build a new one with `options`, loaded with `features`
    ///
    /// On error the previous index is kept.
    pub fn reconfigure(
        &mut self,
        options: &IndexOptions,
        features: &[PointFeature<P>],
    ) -> Result<()> {
        let mut index = I::build(options)?;
        index.load(features);
        self.index = Some(Arc::new(index));
        self.options = Some(*options);
        tracing::info!("Rebuilt spatial index with {:?}", options);
        Ok(())
    }

    /// Shared handle to the current index content
    pub fn snapshot(&self) -> Option<Arc<I>> {
        self.index.clone()
    }

    pub fn len(&self) -> usize {
        self.index.as_ref().map_or(0, |index| index.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Query the current index
    pub async fn query(&self, bbox: BoundingBox, zoom: u8) -> Result<Vec<ClusterResult<P>>> {
        let index = self.snapshot().ok_or(ClusterError::IndexNotBuilt)?;
        index.query(bbox, zoom).await
    }
}
