//! Commands that run the image worker

use crate::commands::provision::prepare_host;
use crate::common::block_on;
use crate::logger;
use crate::GlobalOpts;
use anyhow::{anyhow, Context};
use clap::{Args, Subcommand};
use halftone_bridge::{Bridge, Dot, DotShape, ExportFormat, PatternParams};
use halftone_config::Config;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Args, Debug, Clone)]
pub struct CanvasArgs {
    /// Canvas width in pixels
    #[arg(long, default_value_t = 800)]
    pub width: u32,
    /// Canvas height in pixels
    #[arg(long, default_value_t = 600)]
    pub height: u32,
}

#[derive(Subcommand, Debug, Clone)]
pub enum WorkerAction {
    /// Start the worker and check that it answers
    Ping,
    /// Upload an image and print its initial dot pattern as JSON
    Ingest {
        image: PathBuf,
        #[command(flatten)]
        canvas: CanvasArgs,
        /// Write the JSON here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Upload an image, then recompute its pattern with parameters
    Recompute {
        image: PathBuf,
        #[command(flatten)]
        canvas: CanvasArgs,
        /// Pattern parameter as key=value (repeatable), e.g. density=1.5
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Render a dot list (JSON array, or the output of ingest) to a file
    Export {
        dots: PathBuf,
        #[arg(short, long, default_value = "svg")]
        format: ExportFormat,
        #[arg(long, default_value = "circle")]
        shape: DotShape,
        #[command(flatten)]
        canvas: CanvasArgs,
        #[arg(short, long)]
        out: PathBuf,
    },
}

/// Inputs read and validated before the worker is started
enum Job {
    Ping,
    Ingest {
        image: Vec<u8>,
        canvas: CanvasArgs,
        out: Option<PathBuf>,
    },
    Recompute {
        image: Vec<u8>,
        canvas: CanvasArgs,
        params: PatternParams,
        out: Option<PathBuf>,
    },
    Export {
        dots: Vec<Dot>,
        format: ExportFormat,
        shape: DotShape,
        canvas: CanvasArgs,
        out: PathBuf,
    },
}

pub fn handle_worker(action: WorkerAction, yes: bool, _opts: &GlobalOpts) -> anyhow::Result<()> {
    let job = Job::prepare(action)?;

    let config = Config::load().context("Failed to load config")?;
    let startup = prepare_host(&config, yes)?;
    let bridge = startup.bridge(&config);
    let command = startup.worker_command(&config);

    block_on(async {
        bridge.start(command).await?;
        let outcome = job.run(&bridge).await;
        bridge.stop().await;
        outcome
    })?
}

impl Job {
    fn prepare(action: WorkerAction) -> anyhow::Result<Self> {
        Ok(match action {
            WorkerAction::Ping => Job::Ping,
            WorkerAction::Ingest { image, canvas, out } => Job::Ingest {
                image: read_image(&image)?,
                canvas,
                out,
            },
            WorkerAction::Recompute {
                image,
                canvas,
                params,
                out,
            } => {
                let params = recompute_params(&params, &canvas)?;
                Job::Recompute {
                    image: read_image(&image)?,
                    canvas,
                    params,
                    out,
                }
            }
            WorkerAction::Export {
                dots,
                format,
                shape,
                canvas,
                out,
            } => Job::Export {
                dots: read_dots(&dots)?,
                format,
                shape,
                canvas,
                out,
            },
        })
    }

    async fn run(self, bridge: &Bridge) -> anyhow::Result<()> {
        match self {
            Job::Ping => {
                bridge.ping().await?;
                logger::success("Worker is ready");
            }
            Job::Ingest { image, canvas, out } => {
                let result = bridge.ingest(&image, canvas.width, canvas.height).await?;
                let report = json!({
                    "session": result.session.to_string(),
                    "dots": result.dots,
                    "dot_count": result.dot_count,
                    "image_width": result.image_width,
                    "image_height": result.image_height,
                    "canvas_width": result.canvas_width,
                    "canvas_height": result.canvas_height,
                });
                emit(&report, out.as_deref())?;
            }
            Job::Recompute {
                image,
                canvas,
                params,
                out,
            } => {
                let ingested = bridge.ingest(&image, canvas.width, canvas.height).await?;
                let result = bridge.recompute(ingested.session, &params).await?;
                let report = json!({
                    "session": ingested.session.to_string(),
                    "dots": result.dots,
                    "dot_count": result.dot_count,
                    "image_width": result.image_width,
                    "image_height": result.image_height,
                });
                emit(&report, out.as_deref())?;
            }
            Job::Export {
                dots,
                format,
                shape,
                canvas,
                out,
            } => {
                let exported = bridge
                    .export(&dots, format, canvas.width, canvas.height, shape)
                    .await?;
                fs::write(&out, &exported.data)
                    .with_context(|| format!("Failed to write {}", out.display()))?;
                logger::success(&format!(
                    "Exported {} dots as {} to {}",
                    dots.len(),
                    exported.format,
                    out.display()
                ));
            }
        }
        Ok(())
    }
}

fn read_image(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))
}

/// Accept either a bare dot array or an object carrying `dots`
fn read_dots(path: &Path) -> anyhow::Result<Vec<Dot>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read dots {}", path.display()))?;
    parse_dots(&text).with_context(|| format!("Invalid dot list in {}", path.display()))
}

fn parse_dots(text: &str) -> anyhow::Result<Vec<Dot>> {
    let value: Value = serde_json::from_str(text)?;
    let dots = match value {
        Value::Object(mut map) => map
            .remove("dots")
            .ok_or_else(|| anyhow!("expected an array or an object with \"dots\""))?,
        other => other,
    };
    Ok(serde_json::from_value(dots)?)
}

fn parse_params(pairs: &[String]) -> anyhow::Result<PatternParams> {
    let mut params = PatternParams::new();
    for pair in pairs {
        params.set_pair(pair).map_err(|e| anyhow!(e))?;
    }
    Ok(params)
}

/// The worker lays a recomputed pattern out on the canvas named in its
/// params, so the canvas size travels there unless given explicitly
fn recompute_params(pairs: &[String], canvas: &CanvasArgs) -> anyhow::Result<PatternParams> {
    let mut params = parse_params(pairs)?;
    if params.get("canvas_width").is_none() {
        params.set("canvas_width", canvas.width);
    }
    if params.get("canvas_height").is_none() {
        params.set("canvas_height", canvas.height);
    }
    Ok(params)
}

fn emit(report: &Value, out: Option<&Path>) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(report)?;
    match out {
        Some(path) => {
            fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
            logger::success(&format!("Wrote {}", path.display()));
        }
        None => println!("{}", text),
    }
    Ok(())
}
