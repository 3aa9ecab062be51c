//! Drives an orchestrator through a script and prints one JSON frame per step

use crate::{LoadOptions, Placemark, Result, ScriptEvent, Settings, load_files, parse_script};
use geo::Coord;
use marker_cluster_lib::{
    ClusterBubble, ClusterError, ClusterId, ClusterStyle, ClusteringOrchestrator, Config,
    LocationProvider,
    LocationRequest, MapItem, NoLocation, RenderItem, RenderUpdate, Viewport,
    resolve_initial_viewport,
};
use serde::Serialize;
use std::cell::RefCell;
use std::io::{BufReader, Write};
use std::rc::Rc;

/// Simulated device that always reports the same position
#[derive(Debug, Clone, Copy)]
pub struct FixedLocation(pub Coord<f64>);

impl LocationProvider for FixedLocation {
    async fn current_position(
        &self,
        _request: &LocationRequest,
    ) -> marker_cluster_lib::Result<Coord<f64>> {
        Ok(self.0)
    }
}

#[derive(Serialize)]
struct Frame<'a> {
    step: usize,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    update: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    generation: u64,
    viewport: Option<Viewport>,
    /// Bubble presentation, only sent with the mount frame
    #[serde(skip_serializing_if = "Option::is_none")]
    style: Option<&'a ClusterStyle>,
    /// Whether the render list holds clusters for the viewport or raw markers
    clustered: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pressed: Vec<ClusterBubble>,
    items: Vec<OutputItem<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OutputItem<'a> {
    Marker {
        key: String,
        latitude: f64,
        longitude: f64,
        placemark: &'a Placemark,
    },
    Cluster {
        key: String,
        cluster_id: Option<ClusterId>,
        point_count: usize,
        label: &'a str,
        latitude: f64,
        longitude: f64,
    },
    Passthrough {
        placemark: &'a Placemark,
    },
}

impl<'a> From<&'a RenderItem<Placemark>> for OutputItem<'a> {
    fn from(item: &'a RenderItem<Placemark>) -> Self {
        match item {
            RenderItem::Marker(feature) => Self::Marker {
                key: item.key(),
                latitude: feature.latitude(),
                longitude: feature.longitude(),
                placemark: &*feature.marker,
            },
            RenderItem::Cluster(bubble) => Self::Cluster {
                key: bubble.key(),
                cluster_id: bubble.cluster_id,
                point_count: bubble.point_count,
                label: &bubble.label,
                latitude: bubble.coordinate.y,
                longitude: bubble.coordinate.x,
            },
            RenderItem::Passthrough(placemark) => Self::Passthrough {
                placemark: &**placemark,
            },
        }
    }
}

fn update_name(update: RenderUpdate) -> &'static str {
    match update {
        RenderUpdate::Applied => "applied",
        RenderUpdate::Unchanged => "unchanged",
        RenderUpdate::Stale => "stale",
    }
}

/// An orchestrator plus the sink its render lists are written to
pub struct Replay<W> {
    orchestrator: ClusteringOrchestrator<Placemark>,
    pressed: Rc<RefCell<Vec<ClusterBubble>>>,
    load_options: LoadOptions,
    out: W,
    step: usize,
}

impl<W: Write> Replay<W> {
    pub fn new(config: Config, load_options: LoadOptions, out: W) -> Self {
        let pressed = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&pressed);
        let orchestrator = ClusteringOrchestrator::new(config)
            .with_cluster_press_handler(move |bubble| log.borrow_mut().push(bubble.clone()));
        Self {
            orchestrator,
            pressed,
            load_options,
            out,
            step: 0,
        }
    }

    pub fn orchestrator(&self) -> &ClusteringOrchestrator<Placemark> {
        &self.orchestrator
    }

    /// Mount on the initial viewport and print the first frame
    pub async fn mount(
        &mut self,
        viewport: Viewport,
        items: Vec<MapItem<Placemark>>,
    ) -> Result<()> {
        let update = self.orchestrator.mount(viewport, items).await?;
        self.emit("mount", Ok(update), true)
    }

    /// Apply one event and print the resulting frame
    ///
    /// Errors reported by the orchestrator end up in the frame; only I/O and loading
    /// failures stop the replay.
    pub async fn apply(&mut self, event: ScriptEvent) -> Result<()> {
        let outcome = match &event {
            ScriptEvent::RegionChange(viewport) => {
                self.orchestrator.on_viewport_changed(*viewport).await
            }
            ScriptEvent::PressCluster { cluster_id } => self
                .orchestrator
                .press_cluster(*cluster_id)
                .map(|()| RenderUpdate::Unchanged),
            ScriptEvent::ZoomToCluster { cluster_id } => {
                match self.orchestrator.zoom_to_cluster(*cluster_id) {
                    Ok(viewport) => self.orchestrator.on_viewport_changed(viewport).await,
                    Err(e) => Err(e),
                }
            }
            ScriptEvent::ReloadMarkers { files } => {
                let items = load_files(files, self.load_options)?;
                self.orchestrator.on_markers_changed(items).await
            }
            ScriptEvent::SetClustering { enabled } => {
                self.orchestrator.set_clustering_enabled(*enabled).await
            }
            ScriptEvent::Reconfigure(options) => self.orchestrator.reconfigure(*options).await,
            ScriptEvent::Refresh => self.orchestrator.refresh().await,
        };

        if let Err(e) = &outcome {
            tracing::warn!("Event {} failed: {}", event.name(), e);
        }
        self.emit(event.name(), outcome, false)
    }

    /// Flush the sink and hand it back
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }

    fn emit(
        &mut self,
        event: &str,
        outcome: std::result::Result<RenderUpdate, ClusterError>,
        with_style: bool,
    ) -> Result<()> {
        self.step += 1;
        let (update, error) = match outcome {
            Ok(update) => (Some(update_name(update)), None),
            Err(e) => (None, Some(e.to_string())),
        };

        let frame = Frame {
            step: self.step,
            event,
            update,
            error,
            generation: self.orchestrator.generation(),
            viewport: self.orchestrator.viewport(),
            style: with_style.then(|| &self.orchestrator.config().style),
            clustered: self.orchestrator.last_clustered_viewport().is_some(),
            pressed: std::mem::take(&mut *self.pressed.borrow_mut()),
            items: self
                .orchestrator
                .render_list()
                .iter()
                .map(OutputItem::from)
                .collect(),
        };

        serde_json::to_writer(&mut self.out, &frame)?;
        writeln!(self.out)?;
        Ok(())
    }
}

/// Load markers, resolve the initial viewport and replay the script into `out`
pub async fn run<W: Write>(settings: &Settings, out: W) -> Result<W> {
    let config = settings.to_config();
    let items = load_files(&settings.gpx_files, settings.load_options())?;

    let events = match &settings.script {
        Some(path) => parse_script(BufReader::new(std::fs::File::open(path)?))?,
        None => Vec::new(),
    };

    let viewport = match settings.device_location {
        Some(position) => {
            resolve_initial_viewport(settings.region, &FixedLocation(position), &config).await
        }
        None => resolve_initial_viewport(settings.region, &NoLocation, &config).await,
    };

    let mut replay = Replay::new(config, settings.load_options(), out);
    replay.mount(viewport, items).await?;
    for event in events {
        replay.apply(event).await?;
    }
    replay.finish()
}
