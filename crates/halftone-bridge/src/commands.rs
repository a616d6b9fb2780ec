//! Typed image commands on top of the supervisor
//!
//! The worker keeps only the most recently uploaded image. [`Bridge`] tracks
//! which session that image belongs to and re-sends it whenever the worker
//! is not known to hold it: after a restart, or after an upload that failed,
//! timed out or is still queued.

use crate::errors::{BridgeError, Result};
use crate::supervisor::{Supervisor, SupervisorSettings, WorkerCommand};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use halftone_config::Config;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// One placed dot in canvas coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dot {
    pub x: f64,
    pub y: f64,
    pub r: f64,
    /// Per-dot shape, present when the pattern uses random shapes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Svg,
    Png,
    Jpg,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Svg => "svg",
            ExportFormat::Png => "png",
            ExportFormat::Jpg => "jpg",
        }
    }

    /// Raster formats need the native rendering library
    pub fn is_raster(self) -> bool {
        !matches!(self, ExportFormat::Svg)
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "svg" => Ok(ExportFormat::Svg),
            "png" => Ok(ExportFormat::Png),
            "jpg" | "jpeg" => Ok(ExportFormat::Jpg),
            other => Err(format!("Unsupported export format '{}' (expected svg, png or jpg)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DotShape {
    #[default]
    Circle,
    Diamond,
    Star,
    Hexagon,
    Random,
}

impl DotShape {
    pub fn as_str(self) -> &'static str {
        match self {
            DotShape::Circle => "circle",
            DotShape::Diamond => "diamond",
            DotShape::Star => "star",
            DotShape::Hexagon => "hexagon",
            DotShape::Random => "random",
        }
    }
}

impl FromStr for DotShape {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "circle" => Ok(DotShape::Circle),
            "diamond" => Ok(DotShape::Diamond),
            "star" => Ok(DotShape::Star),
            "hexagon" => Ok(DotShape::Hexagon),
            "random" => Ok(DotShape::Random),
            other => Err(format!("Unknown dot shape '{}'", other)),
        }
    }
}

/// Identifies an ingested image on the host side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Free-form pattern parameters passed through to the worker
///
/// Keys the worker does not know are ignored there; missing keys take the
/// worker's defaults (`dot_radius`, `min_spacing`, `density`, `method`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternParams(Map<String, Value>);

impl PatternParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Parse `key=value`; the value is read as JSON when it parses, as a
    /// plain string otherwise (`density=1.5`, `invert=true`, `method=grid`)
    pub fn set_pair(&mut self, pair: &str) -> std::result::Result<&mut Self, String> {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("Expected key=value, got '{}'", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Missing parameter name in '{}'", pair));
        }
        let value = serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        Ok(self.set(key, value))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestResult {
    pub session: SessionId,
    pub dots: Vec<Dot>,
    pub dot_count: usize,
    pub image_width: u32,
    pub image_height: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PatternResult {
    pub dots: Vec<Dot>,
    pub dot_count: usize,
    pub image_width: u32,
    pub image_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResult {
    pub format: ExportFormat,
    pub data: Vec<u8>,
}

#[derive(Deserialize)]
struct IngestWire {
    dots: Vec<Dot>,
    dot_count: usize,
    image_width: u32,
    image_height: u32,
    canvas_width: Option<u32>,
    canvas_height: Option<u32>,
}

#[derive(Deserialize)]
struct ExportWire {
    format: ExportFormat,
    data_b64: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTimeouts {
    pub ingest: Duration,
    pub recompute: Duration,
    pub export: Duration,
    pub ping: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            ingest: Duration::from_secs(120),
            recompute: Duration::from_secs(120),
            export: Duration::from_secs(60),
            ping: Duration::from_secs(10),
        }
    }
}

impl CommandTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ingest: config.timeouts.ingest(),
            recompute: config.timeouts.recompute(),
            export: config.timeouts.export(),
            ping: config.timeouts.ping(),
        }
    }
}

struct StoredImage {
    session: SessionId,
    image_b64: String,
}

#[derive(Default)]
struct ImageState {
    /// Last successfully ingested image, the one `recompute` can re-send
    stored: Option<StoredImage>,
    /// Session whose image the worker is known to hold, with the supervisor
    /// generation it holds it in
    held: Option<(SessionId, u64)>,
    /// Bumped whenever a request that replaces the worker's image is submitted
    epoch: u64,
}

impl ImageState {
    /// The worker's image is about to change; returns the new epoch
    fn replacing(&mut self) -> u64 {
        self.held = None;
        self.epoch += 1;
        self.epoch
    }

    /// Record what the worker holds, unless another image request was
    /// submitted after the one that just completed
    fn confirm(&mut self, epoch: u64, session: SessionId, generation: u64) {
        if self.epoch == epoch {
            self.held = Some((session, generation));
        }
    }
}

/// The image operations the UI invokes
pub struct Bridge {
    supervisor: Supervisor,
    timeouts: CommandTimeouts,
    /// Name of the missing native library when raster export is disabled
    raster_blocked_by: Option<String>,
    image: Mutex<ImageState>,
}

impl Bridge {
    pub fn new(supervisor: Supervisor, timeouts: CommandTimeouts) -> Self {
        Self {
            supervisor,
            timeouts,
            raster_blocked_by: None,
            image: Mutex::new(ImageState::default()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Supervisor::new(SupervisorSettings::from_config(config)),
            CommandTimeouts::from_config(config),
        )
    }

    /// Reject PNG/JPG export because `library` is unavailable
    pub fn disable_raster_export(mut self, library: &str) -> Self {
        self.raster_blocked_by = Some(library.to_string());
        self
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub async fn start(&self, command: WorkerCommand) -> Result<()> {
        self.supervisor.start(command).await
    }

    pub async fn stop(&self) {
        self.supervisor.stop().await;
    }

    /// Health check
    pub async fn ping(&self) -> Result<()> {
        let response = self.supervisor.send("ping", Map::new(), self.timeouts.ping).await?;
        match response.get("pong") {
            Some(Value::Bool(true)) => Ok(()),
            _ => Err(BridgeError::UnexpectedResponse(format!(
                "ping answered without pong: {}",
                response
            ))),
        }
    }

    /// Upload an encoded image and compute its initial pattern
    pub async fn ingest(&self, image: &[u8], canvas_width: u32, canvas_height: u32) -> Result<IngestResult> {
        let session = SessionId::new();
        let image_b64 = STANDARD.encode(image);
        let generation = self.supervisor.generation();
        let epoch = self.image.lock().replacing();

        let payload = object(json!({
            "image_b64": image_b64,
            "canvas_width": canvas_width,
            "canvas_height": canvas_height,
            "session_id": session.to_string(),
        }));
        let response = self.supervisor.send("upload", payload, self.timeouts.ingest).await?;
        let wire: IngestWire = serde_json::from_value(response)?;

        {
            let mut state = self.image.lock();
            state.stored = Some(StoredImage { session, image_b64 });
            state.confirm(epoch, session, generation);
        }

        Ok(IngestResult {
            session,
            dots: wire.dots,
            dot_count: wire.dot_count,
            image_width: wire.image_width,
            image_height: wire.image_height,
            canvas_width: wire.canvas_width.unwrap_or(canvas_width),
            canvas_height: wire.canvas_height.unwrap_or(canvas_height),
        })
    }

    /// Recompute the pattern of an ingested image with new parameters
    pub async fn recompute(&self, session: SessionId, params: &PatternParams) -> Result<PatternResult> {
        let generation = self.supervisor.generation();
        let mut payload = object(json!({
            "session_id": session.to_string(),
            "params": params,
        }));

        let epoch = {
            let mut state = self.image.lock();
            let Some(image) = state.stored.as_ref().filter(|image| image.session == session) else {
                return Err(BridgeError::Command(format!(
                    "No image loaded for session {}. Upload first.",
                    session
                )));
            };
            if state.held == Some((session, generation)) {
                state.epoch
            } else {
                payload.insert("image_b64".to_string(), Value::String(image.image_b64.clone()));
                state.replacing()
            }
        };

        let response = self
            .supervisor
            .send("regenerate", payload, self.timeouts.recompute)
            .await?;
        let result: PatternResult = serde_json::from_value(response)?;

        self.image.lock().confirm(epoch, session, generation);
        Ok(result)
    }

    /// Render dots to an image file's bytes
    pub async fn export(
        &self,
        dots: &[Dot],
        format: ExportFormat,
        width: u32,
        height: u32,
        shape: DotShape,
    ) -> Result<ExportResult> {
        if format.is_raster() {
            if let Some(library) = &self.raster_blocked_by {
                return Err(BridgeError::NativeLibraryMissing(library.clone()));
            }
        }

        let payload = object(json!({
            "dots": dots,
            "format": format,
            "width": width,
            "height": height,
            "dot_shape": shape.as_str(),
        }));
        let response = self.supervisor.send("export", payload, self.timeouts.export).await?;
        let wire: ExportWire = serde_json::from_value(response)?;
        let data = STANDARD
            .decode(wire.data_b64.as_bytes())
            .map_err(|e| BridgeError::UnexpectedResponse(format!("data_b64 is not base64: {}", e)))?;

        Ok(ExportResult {
            format: wire.format,
            data,
        })
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
