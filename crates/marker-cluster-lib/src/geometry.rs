//! Viewport geometry: bounding boxes and slippy-map zoom levels
//!
//! Everything here is a pure function of its inputs, there is no hidden device state.

use crate::{ClusterError, Result, utils};
use geo::{Coord, Rect};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Edge length of a map tile in pixels
pub const TILE_SIZE: f64 = 256.0;

/// Lowest zoom level returned by [`zoom_level_for`] (whole world)
pub const MIN_ZOOM_LEVEL: u8 = 0;

/// Highest zoom level returned by [`zoom_level_for`] (building-level detail)
pub const MAX_ZOOM_LEVEL: u8 = 20;

/// Sine clamp used when projecting latitudes to pixels, keeps the poles finite
const MAX_SIN_LATITUDE: f64 = 0.9999;

/// Visible map region: center coordinate plus angular span on each axis
///
/// Deltas are half-extents: the viewport covers `latitude ± latitude_delta`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Viewport {
    pub latitude: f64,
    pub longitude: f64,
    pub latitude_delta: f64,
    pub longitude_delta: f64,
}

impl Viewport {
    pub fn new(latitude: f64, longitude: f64, latitude_delta: f64, longitude_delta: f64) -> Self {
        Self {
            latitude,
            longitude,
            latitude_delta,
            longitude_delta,
        }
    }

    /// Center as a `geo::Coord` (x = longitude, y = latitude)
    #[inline]
    pub fn center(&self) -> Coord<f64> {
        Coord {
            x: self.longitude,
            y: self.latitude,
        }
    }

    /// Reject viewports that would poison the bbox, zoom or gate arithmetic
    pub fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !self.longitude.is_finite() {
            return Err(ClusterError::InvalidViewport {
                reason: format!(
                    "center ({}, {}) is not finite",
                    self.latitude, self.longitude
                ),
            });
        }
        if !(self.latitude_delta.is_finite() && self.latitude_delta > 0.0) {
            return Err(ClusterError::InvalidViewport {
                reason: format!("latitude delta {} must be positive", self.latitude_delta),
            });
        }
        if !(self.longitude_delta.is_finite() && self.longitude_delta > 0.0) {
            return Err(ClusterError::InvalidViewport {
                reason: format!("longitude delta {} must be positive", self.longitude_delta),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Ordered `[west, south, east, north]` box in degrees
///
/// Derived from a [`Viewport`]; a malformed viewport yields an inverted box rather than an
/// error, callers validate the viewport first.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// The `[west, south, east, north]` tuple
    #[inline]
    pub fn to_array(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }

    /// Convert to a `geo::Rect` (which normalizes min/max)
    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.west,
                y: self.south,
            },
            Coord {
                x: self.east,
                y: self.north,
            },
        )
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from([west, south, east, north]: [f64; 4]) -> Self {
        Self::new(west, south, east, north)
    }
}

/// Output size in pixels that a bounding box should fit into
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PixelDimensions {
    pub width: f64,
    pub height: f64,
}

impl PixelDimensions {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// `[lon - Δlon, lat - Δlat, lon + Δlon, lat + Δlat]`
#[inline]
pub fn bounding_box_of(viewport: &Viewport) -> BoundingBox {
    BoundingBox {
        west: viewport.longitude - viewport.longitude_delta,
        south: viewport.latitude - viewport.latitude_delta,
        east: viewport.longitude + viewport.longitude_delta,
        north: viewport.latitude + viewport.latitude_delta,
    }
}

/// Integer zoom level at which `bbox` fits into `dimensions`
///
/// Both corners are projected to pixel space at [`MAX_ZOOM_LEVEL`]; every zoom level halves
/// the projected size, so the fitting zoom is `20 - log2(projected / available)` on the
/// tighter axis. The result is floored and clamped to `[0, 20]`.
pub fn zoom_level_for(bbox: &BoundingBox, dimensions: PixelDimensions) -> u8 {
    let base = MAX_ZOOM_LEVEL as f64;
    let (left, bottom) = project_to_pixels(bbox.west, bbox.south, MAX_ZOOM_LEVEL);
    let (right, top) = project_to_pixels(bbox.east, bbox.north, MAX_ZOOM_LEVEL);

    let width = right - left;
    let height = bottom - top;

    let horizontal = base - (width / dimensions.width).log2();
    let vertical = base - (height / dimensions.height).log2();
    // f64::min ignores a NaN operand, so one degenerate axis defers to the other
    let zoom = horizontal.min(vertical).floor();

    if zoom.is_nan() {
        return MAX_ZOOM_LEVEL;
    }
    zoom.clamp(MIN_ZOOM_LEVEL as f64, base) as u8
}

/// Viewport centered on `center` whose bounding box resolves to exactly `zoom`
///
/// The span is shrunk slightly below the exact fit so that [`zoom_level_for`] floors to the
/// requested level instead of the one below it. Levels too low to fill `dimensions` saturate
/// at the world's extent.
pub fn viewport_for_zoom(center: Coord<f64>, zoom: u8, dimensions: PixelDimensions) -> Viewport {
    const HORIZONTAL_MARGIN: f64 = 0.98;
    const VERTICAL_MARGIN: f64 = 0.9;

    let world_pixels = TILE_SIZE * 2f64.powi(zoom.min(MAX_ZOOM_LEVEL) as i32);

    let longitude_delta = (dimensions.width / world_pixels * 180.0 * HORIZONTAL_MARGIN).min(180.0);

    // Latitude is not linear in pixels, so walk the half-height in the unit square instead
    let half_height = dimensions.height / world_pixels / 2.0 * VERTICAL_MARGIN;
    let center_y = utils::lat_to_unit_y(center.y);
    let north = utils::unit_y_to_lat((center_y - half_height).max(0.0));
    let south = utils::unit_y_to_lat((center_y + half_height).min(1.0));
    let latitude_delta = (north - center.y).min(center.y - south).max(f64::EPSILON);

    Viewport::new(center.y, center.x, latitude_delta, longitude_delta)
}

/// Spherical Mercator pixel coordinates of (lon, lat) at an integer zoom
fn project_to_pixels(lon: f64, lat: f64, zoom: u8) -> (f64, f64) {
    let size = TILE_SIZE * 2f64.powi(zoom as i32);
    let half = size / 2.0;
    let sin = lat.to_radians().sin().clamp(-MAX_SIN_LATITUDE, MAX_SIN_LATITUDE);

    let x = half + lon * size / 360.0;
    let y = half - 0.5 * ((1.0 + sin) / (1.0 - sin)).ln() * size / (2.0 * std::f64::consts::PI);

    (x.clamp(0.0, size), y.clamp(0.0, size))
}
