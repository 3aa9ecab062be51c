//! Marker Cluster Library - Viewport-driven clustering of map markers
//!
//! This library keeps a set of geolocated markers legible on a map by grouping nearby
//! markers into clusters that expand as the user zooms in. The interesting part is the
//! incremental pipeline that decides *when* to recompute, turns the viewport into a spatial
//! query and reconciles the answer into a render list.
//!
//! # Architecture
//!
//! - **[`geometry`]**: Viewport → bounding box → integer zoom level (pure)
//! - **[`gate`]**: Decides whether a viewport moved enough to recluster (pure)
//! - **[`MapItem`] / [`classify`]**: Splits caller items into point features and passthrough
//!   items
//! - **[`SpatialIndex`] / [`SpatialIndexAdapter`]**: Index seam, lazily built and reloaded
//!   wholesale
//! - **[`ClusterIndex`]**: Default hierarchical greedy clusterer backed by a [`Quadtree`]
//! - **[`ClusteringOrchestrator`]**: The stateful coordinator producing [`RenderItem`] lists
//! - **[`location`]**: Initial viewport from an explicit region, a device fix or a default
//! - **[`style`]**: Display-relative sizes and the bubble style handed to the renderer
//!
//! # Concurrency
//!
//! Everything runs cooperatively on one thread. Only index queries may suspend; each
//! computation carries a generation number and only the newest one is ever committed.

mod cluster_index;
pub mod gate;
pub mod geometry;
mod index;
pub mod location;
mod marker;
mod orchestrator;
mod quadtree;
pub mod style;
pub mod utils;

// Public API exports
pub use cluster_index::{ClusterIndex, IndexOptions};
pub use gate::should_recluster;
pub use geometry::{BoundingBox, PixelDimensions, Viewport, bounding_box_of, zoom_level_for};
pub use index::{
    ClusterId, ClusterProperties, ClusterResult, LEAF_POINT_COUNT, SpatialIndex,
    SpatialIndexAdapter,
};
pub use location::{
    LocationProvider, LocationRequest, NoLocation, fetch_position, resolve_initial_viewport,
};
pub use marker::{MapItem, PointFeature, classify};
pub use orchestrator::{
    ClusterBubble, ClusteringOrchestrator, CompletedComputation, Config, Phase,
    PendingComputation, RenderItem, RenderUpdate,
};
pub use quadtree::Quadtree;
pub use style::{ClusterStyle, DisplayMetrics, Rgb};

/// Error types for the clustering pipeline
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Invalid index options: {reason}")]
    InvalidOptions { reason: String },

    #[error("Invalid viewport: {reason}")]
    InvalidViewport { reason: String },

    #[error("Invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    #[error("No cluster with id {0}")]
    ClusterNotFound(ClusterId),

    #[error("Geolocation failed: {0}")]
    Geolocation(String),

    #[error("Geolocation timed out after {0:?}")]
    GeolocationTimeout(std::time::Duration),

    #[error("Spatial index has not been built yet")]
    IndexNotBuilt,

    #[error("Orchestrator is not mounted")]
    NotMounted,

    #[error("Orchestrator is already mounted")]
    AlreadyMounted,
}

pub type Result<T> = std::result::Result<T, ClusterError>;
