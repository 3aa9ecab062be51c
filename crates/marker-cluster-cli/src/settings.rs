use crate::LoadOptions;
use clap::Parser;
use geo::Coord;
use marker_cluster_lib::{Config, DisplayMetrics, Viewport};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Marker Cluster - replay map events against the clustering pipeline and print render lists
pub struct Settings {
    /// GPX files whose waypoints become markers
    #[clap(short, long, value_name = "FILE")]
    pub gpx_files: Vec<PathBuf>,

    /// Event script, one JSON event per line
    #[clap(short, long, value_name = "FILE")]
    pub script: Option<PathBuf>,

    /// Also turn every track and route point into a marker
    #[clap(long, default_value = "false")]
    pub track_points: bool,

    /// Display width in pixels, device-relative sizes derive from it
    #[clap(long, default_value = "1080")]
    pub display_width: f64,

    /// Display height in pixels
    #[clap(long, default_value = "1920")]
    pub display_height: f64,

    /// Clustering radius in pixels (default: 3% of the display width)
    #[clap(long)]
    pub radius: Option<f64>,

    /// Deepest zoom level that still gets clusters
    #[clap(long)]
    pub max_zoom: Option<u8>,

    /// Minimum number of markers forming a cluster
    #[clap(long)]
    pub min_points: Option<usize>,

    /// Start with clustering turned off
    #[clap(long, default_value = "false")]
    pub no_clustering: bool,

    /// Initial region as LAT,LON,LAT_DELTA,LON_DELTA
    #[clap(long, value_name = "REGION", value_parser = parse_viewport)]
    pub region: Option<Viewport>,

    /// Simulated device position as LAT,LON, used when no region is given
    #[clap(long, value_name = "LAT,LON", value_parser = parse_coordinate)]
    pub device_location: Option<Coord<f64>>,
}

impl Settings {
    pub fn from_cli() -> Self {
        match Settings::try_parse() {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    pub fn display_metrics(&self) -> DisplayMetrics {
        DisplayMetrics::new(self.display_width, self.display_height)
    }

    /// Orchestrator configuration with the command line overrides applied
    pub fn to_config(&self) -> Config {
        let mut config = Config::for_display(&self.display_metrics());
        config.clustering_enabled = !self.no_clustering;
        if let Some(radius) = self.radius {
            config.index.radius = radius;
        }
        if let Some(max_zoom) = self.max_zoom {
            config.index.max_zoom = max_zoom;
        }
        if let Some(min_points) = self.min_points {
            config.index.min_points = min_points;
        }
        config
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            track_points: self.track_points,
        }
    }
}

fn parse_numbers<const N: usize>(s: &str) -> Result<[f64; N], String> {
    let values = s
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|e| format!("'{}': {}", part.trim(), e))
        })
        .collect::<Result<Vec<_>, _>>()?;
    values
        .try_into()
        .map_err(|values: Vec<f64>| format!("expected {} numbers, got {}", N, values.len()))
}

fn parse_viewport(s: &str) -> Result<Viewport, String> {
    let [latitude, longitude, latitude_delta, longitude_delta] = parse_numbers::<4>(s)?;
    Ok(Viewport::new(
        latitude,
        longitude,
        latitude_delta,
        longitude_delta,
    ))
}

fn parse_coordinate(s: &str) -> Result<Coord<f64>, String> {
    let [latitude, longitude] = parse_numbers::<2>(s)?;
    Ok(Coord {
        x: longitude,
        y: latitude,
    })
}
