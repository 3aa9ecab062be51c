//! Marker Cluster CLI - headless host for the clustering orchestrator
//!
//! Loads markers from GPX files, mounts an orchestrator on the initial viewport, replays a
//! script of map events against it and prints every resulting render list as one JSON
//! line on stdout. Logs go to stderr.

pub mod loader;
pub mod logging;
pub mod replay;
pub mod script;
pub mod settings;

pub use loader::{LoadOptions, Placemark, PlacemarkKind, load_files, load_gpx};
pub use replay::{FixedLocation, Replay, run};
pub use script::{ScriptEvent, parse_script};
pub use settings::Settings;

use marker_cluster_lib::ClusterError;

/// Everything that can abort a replay
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse GPX: {0}")]
    Gpx(#[from] gpx::errors::GpxError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Script line {line}: {source}")]
    Script {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

pub type Result<T> = std::result::Result<T, CliError>;
