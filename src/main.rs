use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use capture_pipeline::config::PipelineConfig;
use capture_pipeline::pipeline::{FolderCapture, Pipeline, PipelineHandle, PipelineState};
use capture_pipeline::reconstruction::CommandEngine;

/// Minimum progress change worth logging
const PROGRESS_LOG_STEP: f64 = 0.05;

/// Capture a folder of photos and reconstruct a textured 3D model
#[derive(Parser, Debug)]
#[command(name = "capture-pipeline")]
#[command(about = "Captures photos of an object and reconstructs a textured 3D model")]
struct Args {
    /// Folder of photos to capture from
    #[arg(short, long)]
    source: PathBuf,

    /// Reconstruction program (overrides the config file)
    #[arg(short, long)]
    engine: Option<PathBuf>,

    /// Path to configuration TOML file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory workspaces are created in (default: documents folder)
    #[arg(short, long)]
    documents: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => {
            info!(config = %path.display(), "Loading config");
            PipelineConfig::load(path)?
        }
        None => PipelineConfig::default(),
    };
    if let Some(dir) = args.documents {
        config.documents_dir = Some(dir);
    }
    if let Some(program) = args.engine {
        config.engine.program = Some(program);
    }
    let program = config
        .engine
        .program
        .clone()
        .context("No reconstruction program configured; pass --engine or set [engine] program")?;

    let engine = CommandEngine::new(program, config.engine.args.clone());
    let capture = FolderCapture::new(args.source);
    let (pipeline, handle, rx) = Pipeline::new(config, capture, engine);
    let runner = tokio::spawn(pipeline.run(rx));

    handle.start();
    let outcome = watch_until_done(&handle).await;
    handle.shutdown();
    runner.await.context("Pipeline task panicked")?;

    let model = outcome?;
    println!("{}", model.display());
    Ok(())
}

/// Follow the pipeline until a model is ready to view or the attempt fails
async fn watch_until_done(handle: &PipelineHandle) -> Result<PathBuf> {
    let mut states = handle.subscribe();
    let mut logged_progress = 0.0;

    loop {
        let snapshot = states.borrow_and_update().clone();
        match &snapshot.state {
            PipelineState::Viewing => {
                if let Some(path) = snapshot.model_path.clone() {
                    info!(model = %path.display(), "🎨 Model ready to view");
                    return Ok(path);
                }
            }
            PipelineState::Failed(err) => bail!("Reconstruction failed: {}", err),
            PipelineState::Ready => {
                if let Some(err) = &snapshot.capture_error {
                    bail!("Could not start capture: {}", err);
                }
            }
            PipelineState::Reconstructing => {
                if snapshot.progress - logged_progress >= PROGRESS_LOG_STEP {
                    info!(percent = (snapshot.progress * 100.0).round(), "⏳ Reconstructing");
                    logged_progress = snapshot.progress;
                }
            }
            _ => {}
        }

        states
            .changed()
            .await
            .context("Pipeline stopped before producing a model")?;
    }
}
