//! Utility functions for coordinate conversions between WGS84 and the normalized Web
//! Mercator square used by the cluster index

use geo::{Coord, Point};

/// Longitude in degrees to normalized x in `[0, 1]` (0 = antimeridian west, 1 = east)
#[inline(always)]
pub fn lon_to_unit_x(lon: f64) -> f64 {
    lon / 360.0 + 0.5
}

/// Latitude in degrees to normalized y in `[0, 1]` (0 = north edge, 1 = south edge)
///
/// Latitudes past the Mercator limit are clamped to the square's edges.
#[inline(always)]
pub fn lat_to_unit_y(lat: f64) -> f64 {
    let sin = lat.to_radians().sin();
    let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / std::f64::consts::PI;
    y.clamp(0.0, 1.0)
}

/// Normalized x back to longitude in degrees
#[inline(always)]
pub fn unit_x_to_lon(x: f64) -> f64 {
    (x - 0.5) * 360.0
}

/// Normalized y back to latitude in degrees
#[inline(always)]
pub fn unit_y_to_lat(y: f64) -> f64 {
    let y2 = (180.0 - y * 360.0).to_radians();
    360.0 * y2.exp().atan() / std::f64::consts::PI - 90.0
}

/// Project a WGS84 coordinate (x = lon, y = lat) into the normalized unit square
#[inline(always)]
pub fn wgs84_to_unit(coord: Coord<f64>) -> Point<f64> {
    Point::new(lon_to_unit_x(coord.x), lat_to_unit_y(coord.y))
}

/// Inverse of [`wgs84_to_unit`]
#[inline(always)]
pub fn unit_to_wgs84(point: Point<f64>) -> Coord<f64> {
    Coord {
        x: unit_x_to_lon(point.x()),
        y: unit_y_to_lat(point.y()),
    }
}

/// Wrap a longitude into `[-180, 180)`
#[inline(always)]
pub fn wrap_longitude(lon: f64) -> f64 {
    ((lon + 180.0) % 360.0 + 360.0) % 360.0 - 180.0
}
