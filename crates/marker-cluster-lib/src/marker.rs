//! Caller-supplied map items and their split into clusterable points and passthrough items

use geo::Coord;
use std::sync::Arc;

/// One item the caller wants drawn on the map
///
/// The variant is decided once, at the boundary: only [`MapItem::Point`] items take part in
/// clustering, everything else is drawn as-is on top of the clusters.
#[derive(Debug, Clone)]
pub enum MapItem<P> {
    /// A marker anchored at a WGS84 coordinate (x = longitude, y = latitude)
    Point { coordinate: Coord<f64>, payload: P },
    /// Anything without a single anchor coordinate (overlays, polylines, callouts...)
    Opaque { payload: P },
}

impl<P> MapItem<P> {
    pub fn point(latitude: f64, longitude: f64, payload: P) -> Self {
        Self::Point {
            coordinate: Coord {
                x: longitude,
                y: latitude,
            },
            payload,
        }
    }

    pub fn opaque(payload: P) -> Self {
        Self::Opaque { payload }
    }

    pub fn payload(&self) -> &P {
        match self {
            Self::Point { payload, .. } | Self::Opaque { payload } => payload,
        }
    }
}

/// A single marker eligible for clustering
///
/// Leaves report a point count of [`crate::LEAF_POINT_COUNT`] when they come back from the
/// index, which is how they are told apart from real clusters.
#[derive(Debug)]
pub struct PointFeature<P> {
    /// The caller's original marker, shared with every render list that shows it
    pub marker: Arc<P>,
    /// WGS84 position (x = longitude, y = latitude)
    pub coordinate: Coord<f64>,
}

impl<P> PointFeature<P> {
    pub fn new(marker: Arc<P>, coordinate: Coord<f64>) -> Self {
        Self { marker, coordinate }
    }

    #[inline]
    pub fn longitude(&self) -> f64 {
        self.coordinate.x
    }

    #[inline]
    pub fn latitude(&self) -> f64 {
        self.coordinate.y
    }
}

// Manual impl: cloning only bumps the Arc, no `P: Clone` needed
impl<P> Clone for PointFeature<P> {
    fn clone(&self) -> Self {
        Self {
            marker: Arc::clone(&self.marker),
            coordinate: self.coordinate,
        }
    }
}

/// Split items into point features and passthrough items, preserving input order in both
///
/// Points whose coordinate is not finite cannot be indexed and are passed through instead.
pub fn classify<P>(
    items: impl IntoIterator<Item = MapItem<P>>,
) -> (Vec<PointFeature<P>>, Vec<Arc<P>>) {
    let mut features = Vec::new();
    let mut passthrough = Vec::new();

    for item in items {
        match item {
            MapItem::Point {
                coordinate,
                payload,
            } if coordinate.x.is_finite() && coordinate.y.is_finite() => {
                features.push(PointFeature::new(Arc::new(payload), coordinate));
            }
            MapItem::Point {
                coordinate,
                payload,
            } => {
                tracing::warn!(
                    "Passing through marker with non-finite coordinate ({}, {})",
                    coordinate.y,
                    coordinate.x
                );
                passthrough.push(Arc::new(payload));
            }
            MapItem::Opaque { payload } => passthrough.push(Arc::new(payload)),
        }
    }

    tracing::debug!(
        "Classified {} point features and {} passthrough items",
        features.len(),
        passthrough.len()
    );

    (features, passthrough)
}
