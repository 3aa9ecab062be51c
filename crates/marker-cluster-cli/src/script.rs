//! Replay scripts: one JSON object per line, tagged by `event`
//!
//! ```text
//! {"event": "region_change", "latitude": 48.85, "longitude": 2.35, "latitude_delta": 0.1, "longitude_delta": 0.1}
//! {"event": "press_cluster", "cluster_id": 1317}
//! {"event": "zoom_to_cluster", "cluster_id": 1317}
//! {"event": "set_clustering", "enabled": false}
//! ```
//!
//! Blank lines and lines starting with `//` are skipped.

use crate::{CliError, Result};
use marker_cluster_lib::{ClusterId, IndexOptions, Viewport};
use serde::Deserialize;
use std::io::BufRead;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScriptEvent {
    /// The user finished panning or zooming
    RegionChange(Viewport),
    /// The user tapped a cluster bubble
    PressCluster { cluster_id: ClusterId },
    /// Move the map to where a cluster splits up
    ZoomToCluster { cluster_id: ClusterId },
    /// Replace the marker set with the content of these GPX files
    ReloadMarkers { files: Vec<PathBuf> },
    SetClustering { enabled: bool },
    /// Rebuild the index; omitted fields keep their defaults
    Reconfigure(IndexOptions),
    /// Recompute for the current viewport, bypassing the change threshold
    Refresh,
}

impl ScriptEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegionChange(_) => "region_change",
            Self::PressCluster { .. } => "press_cluster",
            Self::ZoomToCluster { .. } => "zoom_to_cluster",
            Self::ReloadMarkers { .. } => "reload_markers",
            Self::SetClustering { .. } => "set_clustering",
            Self::Reconfigure(_) => "reconfigure",
            Self::Refresh => "refresh",
        }
    }
}

pub fn parse_script(reader: impl BufRead) -> Result<Vec<ScriptEvent>> {
    let mut events = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            continue;
        }
        let event = serde_json::from_str(trimmed).map_err(|source| CliError::Script {
            line: number + 1,
            source,
        })?;
        events.push(event);
    }
    tracing::debug!("Parsed {} script events", events.len());
    Ok(events)
}
