//! Initial viewport resolution: explicit region, else a one-shot device fix, else a default

use crate::{ClusterError, Config, Result, Viewport};
use geo::Coord;
use std::future::Future;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Parameters of a one-shot position request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocationRequest {
    /// Give up after this long
    /// Default: 20 s
    pub timeout: Duration,
    /// A cached fix at most this old is acceptable
    /// Default: 1 s
    pub maximum_age: Duration,
}

impl Default for LocationRequest {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            maximum_age: Duration::from_secs(1),
        }
    }
}

/// Source of the device position
pub trait LocationProvider {
    /// Current position as WGS84 (x = longitude, y = latitude)
    ///
    /// Implementations do not need to enforce `request.timeout`, callers bound the wait.
    fn current_position(
        &self,
        request: &LocationRequest,
    ) -> impl Future<Output = Result<Coord<f64>>>;
}

/// Provider for hosts without positioning, always fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocation;

impl LocationProvider for NoLocation {
    async fn current_position(&self, _request: &LocationRequest) -> Result<Coord<f64>> {
        Err(ClusterError::Geolocation(
            "no location provider configured".to_string(),
        ))
    }
}

/// Ask `locator` once, bounded by `request.timeout`
pub async fn fetch_position(
    locator: &impl LocationProvider,
    request: &LocationRequest,
) -> Result<Coord<f64>> {
    let position = tokio::time::timeout(request.timeout, locator.current_position(request))
        .await
        .map_err(|_| ClusterError::GeolocationTimeout(request.timeout))??;

    if !(position.x.is_finite() && position.y.is_finite()) {
        return Err(ClusterError::Geolocation(format!(
            "provider returned non-finite position ({}, {})",
            position.y, position.x
        )));
    }
    Ok(position)
}

/// Viewport the map starts at
///
/// A valid `region` wins. Otherwise the device position is requested once and the default
/// region's span is centered on it. Any failure falls back to `config.default_region`.
pub async fn resolve_initial_viewport(
    region: Option<Viewport>,
    locator: &impl LocationProvider,
    config: &Config,
) -> Viewport {
    if let Some(region) = region {
        match region.validate() {
            Ok(()) => return region,
            Err(e) => tracing::warn!("Ignoring initial region: {}", e),
        }
    }

    match fetch_position(locator, &config.location_request).await {
        Ok(position) => {
            tracing::info!(
                "Centering initial viewport on device position ({:.5}, {:.5})",
                position.y,
                position.x
            );
            Viewport {
                latitude: position.y,
                longitude: position.x,
                ..config.default_region
            }
        }
        Err(e) => {
            tracing::warn!("Falling back to the default region: {}", e);
            config.default_region
        }
    }
}
