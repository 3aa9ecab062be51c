//! GPX files to map items
//!
//! Waypoints are anchored markers and take part in clustering. Tracks and routes have no
//! single anchor, so they become opaque items drawn on top of the clusters, unless
//! [`LoadOptions::track_points`] asks for every point to be a marker as well.

use crate::Result;
use marker_cluster_lib::MapItem;
use serde::Serialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Emit a marker for every track and route point
    pub track_points: bool,
}

/// Payload of every item the CLI hands to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placemark {
    pub name: Option<String>,
    /// File the item was read from
    pub source: String,
    pub kind: PlacemarkKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlacemarkKind {
    Waypoint,
    TrackPoint,
    Track { points: usize },
    Route { points: usize },
}

/// Read every file in order, concatenating their items
pub fn load_files(paths: &[PathBuf], options: LoadOptions) -> Result<Vec<MapItem<Placemark>>> {
    let mut items = Vec::new();
    for path in paths {
        items.extend(load_file(path, options)?);
    }
    Ok(items)
}

pub fn load_file(path: &Path, options: LoadOptions) -> Result<Vec<MapItem<Placemark>>> {
    let file = std::fs::File::open(path).inspect_err(|e| {
        tracing::error!("Failed to open {}: {}", path.display(), e);
    })?;
    let items = load_gpx(BufReader::new(file), &path.display().to_string(), options)
        .inspect_err(|e| tracing::error!("Failed to load {}: {}", path.display(), e))?;
    tracing::info!("Loaded {} items from {}", items.len(), path.display());
    Ok(items)
}

/// Parse one GPX document; `source` is recorded in every payload
pub fn load_gpx(
    reader: impl BufRead,
    source: &str,
    options: LoadOptions,
) -> Result<Vec<MapItem<Placemark>>> {
    let gpx = gpx::read(reader)?;

    let placemark = |name: &Option<String>, kind| Placemark {
        name: name.clone(),
        source: source.to_string(),
        kind,
    };
    let marker = |waypoint: &gpx::Waypoint, kind| {
        let point = waypoint.point();
        MapItem::point(point.y(), point.x(), placemark(&waypoint.name, kind))
    };

    let mut items: Vec<_> = gpx
        .waypoints
        .iter()
        .map(|waypoint| marker(waypoint, PlacemarkKind::Waypoint))
        .collect();

    for track in &gpx.tracks {
        let points: Vec<&gpx::Waypoint> = track
            .segments
            .iter()
            .flat_map(|segment| segment.points.iter())
            .collect();
        items.push(MapItem::opaque(placemark(
            &track.name,
            PlacemarkKind::Track {
                points: points.len(),
            },
        )));
        if options.track_points {
            items.extend(
                points
                    .into_iter()
                    .map(|waypoint| marker(waypoint, PlacemarkKind::TrackPoint)),
            );
        }
    }

    for route in &gpx.routes {
        items.push(MapItem::opaque(placemark(
            &route.name,
            PlacemarkKind::Route {
                points: route.points.len(),
            },
        )));
        if options.track_points {
            items.extend(
                route
                    .points
                    .iter()
                    .map(|waypoint| marker(waypoint, PlacemarkKind::TrackPoint)),
            );
        }
    }

    Ok(items)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::CliError;

    pub(crate) const TEST_GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="marker-cluster-tests" xmlns="http://www.topografix.com/GPX/1/1">
  <wpt lat="48.8584" lon="2.2945"><name>Eiffel Tower</name></wpt>
  <wpt lat="48.8606" lon="2.3376"><name>Louvre</name></wpt>
  <wpt lat="48.8530" lon="2.3499"><name>Notre-Dame</name></wpt>
  <trk>
    <name>Seine walk</name>
    <trkseg>
      <trkpt lat="48.8580" lon="2.2950"></trkpt>
      <trkpt lat="48.8600" lon="2.3300"></trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    fn create_test_items(options: LoadOptions) -> Vec<MapItem<Placemark>> {
        load_gpx(TEST_GPX.as_bytes(), "paris.gpx", options).unwrap()
    }

    #[test]
    fn test_waypoints_become_markers_and_tracks_passthrough() {
        let items = create_test_items(LoadOptions::default());
        assert_eq!(items.len(), 4);

        let MapItem::Point {
            coordinate,
            payload,
        } = &items[0]
        else {
            panic!("first waypoint should be a point");
        };
        assert_eq!(coordinate.y, 48.8584);
        assert_eq!(coordinate.x, 2.2945);
        assert_eq!(payload.name.as_deref(), Some("Eiffel Tower"));
        assert_eq!(payload.source, "paris.gpx");

        let MapItem::Opaque { payload } = &items[3] else {
            panic!("track should be opaque");
        };
        assert_eq!(payload.kind, PlacemarkKind::Track { points: 2 });
        assert_eq!(payload.name.as_deref(), Some("Seine walk"));
    }

    #[test]
    fn test_track_points_as_markers() {
        let items = create_test_items(LoadOptions { track_points: true });
        assert_eq!(items.len(), 6);
        let track_points = items
            .iter()
            .filter(|item| item.payload().kind == PlacemarkKind::TrackPoint)
            .count();
        assert_eq!(track_points, 2);
    }

    #[test]
    fn test_invalid_gpx() {
        let result = load_gpx("<gpx>".as_bytes(), "broken.gpx", LoadOptions::default());
        assert!(matches!(result, Err(CliError::Gpx(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = load_files(
            &[PathBuf::from("/nonexistent/markers.gpx")],
            LoadOptions::default(),
        );
        assert!(matches!(result, Err(CliError::Io(_))));
    }
}
