/// Reconstruction attempt orchestration
///
/// One attempt runs through these phases, in order:
/// 1. Validating - stale output removed, images counted and size-checked
/// 2. SessionInit - engine session created, retried a fixed number of times
/// 3. Processing - one request submitted, output stream consumed in order
/// 4. Verifying - model file polled until readable, snapshot assets resolved
///
/// Any failure ends the attempt. There is no resuming; a new attempt starts
/// from Validating.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::engine::{
    EngineSession, OutputEvent, ReconstructionEngine, ReconstructionRequest, SessionConfig,
};
use crate::asset::resolve_snapshot;
use crate::config::ReconstructionSettings;
use crate::error::{PipelineError, Result};
use crate::workspace::Workspace;

/// Where an attempt currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Validating,
    SessionInit,
    Processing,
    Verifying,
    Resolved,
    Failed,
}

/// Receives updates from a running attempt
///
/// `finished` is called exactly once per submitted attempt.
pub trait ReconstructionObserver: Send + Sync + 'static {
    fn phase(&self, _phase: AttemptPhase) {}
    fn progress(&self, fraction: f64);
    fn finished(&self, result: Result<PathBuf>);
}

impl<T: ReconstructionObserver> ReconstructionObserver for Arc<T> {
    fn phase(&self, phase: AttemptPhase) {
        (**self).phase(phase)
    }

    fn progress(&self, fraction: f64) {
        (**self).progress(fraction)
    }

    fn finished(&self, result: Result<PathBuf>) {
        (**self).finished(result)
    }
}

/// Runs reconstruction attempts against an engine
pub struct Orchestrator<E> {
    engine: Arc<E>,
    settings: ReconstructionSettings,
    model_file_name: String,
}

impl<E> Clone for Orchestrator<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            settings: self.settings.clone(),
            model_file_name: self.model_file_name.clone(),
        }
    }
}

impl<E: ReconstructionEngine> Orchestrator<E> {
    pub fn new(engine: Arc<E>, settings: ReconstructionSettings, model_file_name: &str) -> Self {
        Self {
            engine,
            settings,
            model_file_name: model_file_name.to_string(),
        }
    }

    /// Start an attempt in the background
    ///
    /// Errors returned here happen before anything is spawned; everything
    /// after that is reported through `observer.finished`.
    pub fn submit<O: ReconstructionObserver>(
        &self,
        workspace: Arc<Workspace>,
        observer: O,
    ) -> Result<JoinHandle<()>> {
        if !workspace.models_dir().is_dir() {
            return Err(PipelineError::FileSystem(format!(
                "Model directory {} is missing",
                workspace.models_dir().display()
            )));
        }

        let orchestrator = self.clone();
        Ok(tokio::spawn(async move {
            let result = orchestrator.run(&workspace, &observer).await;
            observer.finished(result);
        }))
    }

    /// Run one attempt to completion and return the model path
    pub async fn run(
        &self,
        workspace: &Workspace,
        observer: &dyn ReconstructionObserver,
    ) -> Result<PathBuf> {
        let output_path = workspace.model_path(&self.model_file_name);
        let result = self.run_phases(workspace, &output_path, observer).await;

        match &result {
            Ok(path) => {
                info!(model = %path.display(), "🎉 Reconstruction finished");
                observer.phase(AttemptPhase::Resolved);
            }
            Err(err) => {
                error!(error = %err, "❌ Reconstruction attempt failed");
                observer.phase(AttemptPhase::Failed);
            }
        }
        result
    }

    async fn run_phases(
        &self,
        workspace: &Workspace,
        output_path: &Path,
        observer: &dyn ReconstructionObserver,
    ) -> Result<PathBuf> {
        observer.phase(AttemptPhase::Validating);
        let image_count = self.validate(workspace, output_path).await?;
        info!(images = image_count, "🔍 Input images validated");

        observer.phase(AttemptPhase::SessionInit);
        let mut session = self.create_session(workspace).await?;

        observer.phase(AttemptPhase::Processing);
        let request = ReconstructionRequest {
            output_path: output_path.to_path_buf(),
            detail: self.settings.detail,
        };
        session.process(&request)?;
        let outputs = session
            .take_outputs()
            .ok_or(PipelineError::ReconstructionFailed)?;
        consume_outputs(outputs, observer).await?;
        drop(session);

        observer.phase(AttemptPhase::Verifying);
        self.verify_model(output_path).await?;

        let snapshots = workspace.snapshots_dir().to_path_buf();
        task::spawn_blocking(move || resolve_snapshot(&snapshots))
            .await
            .map_err(|e| PipelineError::Processing(format!("Task join error: {}", e)))??;

        Ok(output_path.to_path_buf())
    }

    async fn validate(&self, workspace: &Workspace, output_path: &Path) -> Result<usize> {
        let workspace = workspace.clone();
        let output_path = output_path.to_path_buf();
        let settings = self.settings.clone();

        task::spawn_blocking(move || validate_inputs(&workspace, &output_path, &settings))
            .await
            .map_err(|e| PipelineError::Processing(format!("Task join error: {}", e)))?
    }

    async fn create_session(&self, workspace: &Workspace) -> Result<E::Session> {
        let config = SessionConfig::new(workspace.snapshots_dir());
        let attempts = self.settings.session_attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.engine.create_session(workspace.images_dir(), &config) {
                Ok(session) => {
                    info!(attempt, "🔧 Engine session created");
                    return Ok(session);
                }
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "Engine session creation failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        sleep(self.settings.session_retry_delay()).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PipelineError::ReconstructionFailed))
    }

    async fn verify_model(&self, path: &Path) -> Result<u64> {
        let attempts = self.settings.verify_attempts;

        for attempt in 1..=attempts {
            match probe_model_file(path).await {
                Ok(size) => {
                    info!(attempt, bytes = size, "📦 Model file verified");
                    return Ok(size);
                }
                Err(reason) => debug!(attempt, attempts, %reason, "Model file not ready"),
            }
            if attempt < attempts {
                sleep(self.settings.verify_delay()).await;
            }
        }

        Err(PipelineError::ModelFileNotFound)
    }
}

/// Remove stale output, then check image count and sizes
fn validate_inputs(
    workspace: &Workspace,
    output_path: &Path,
    settings: &ReconstructionSettings,
) -> Result<usize> {
    match fs::remove_file(output_path) {
        Ok(()) => debug!(path = %output_path.display(), "Removed stale model file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let images = workspace.image_files()?;
    if images.is_empty() {
        return Err(PipelineError::ReconstructionFailed);
    }
    if images.len() < settings.min_image_count {
        return Err(PipelineError::InsufficientImages {
            count: images.len(),
            required: settings.min_image_count,
        });
    }

    for image in &images {
        let size = fs::metadata(image)?.len();
        if size < settings.min_image_bytes {
            warn!(image = %image.display(), bytes = size, "Image below minimum size");
            return Err(PipelineError::InvalidInputImages);
        }
    }

    let shots = workspace.list_shots()?;
    if let (Some(first), Some(last)) = (shots.first(), shots.last()) {
        debug!(shots = shots.len(), first = first.id, last = last.id, "Shot range");
    }

    Ok(images.len())
}

/// Drain the engine's output stream for one request
///
/// The first request error sticks: later events are still consumed (and
/// progress still reported) but the attempt fails once the stream ends.
async fn consume_outputs(
    mut outputs: mpsc::Receiver<OutputEvent>,
    observer: &dyn ReconstructionObserver,
) -> Result<()> {
    let mut request_error: Option<PipelineError> = None;

    while let Some(event) = outputs.recv().await {
        match event {
            OutputEvent::RequestProgress(fraction) => observer.progress(fraction),
            OutputEvent::RequestError(err) => {
                error!(error = %err, "Engine reported a request error");
                if request_error.is_none() {
                    request_error = Some(err);
                }
            }
            OutputEvent::ProcessingComplete => {
                if request_error.is_none() {
                    info!("⚙️  Processing complete");
                    return Ok(());
                }
                debug!("Ignoring completion after a request error");
            }
            OutputEvent::Other(description) => debug!(%description, "Unhandled engine output"),
        }
    }

    Err(request_error.unwrap_or(PipelineError::ReconstructionFailed))
}

/// One readability check of the model file; returns its size
pub async fn probe_model_file(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| PipelineError::ModelFileNotFound)?;
    if !metadata.is_file() {
        return Err(PipelineError::ModelFileNotFound);
    }
    if metadata.len() == 0 {
        return Err(PipelineError::EmptyModelFile);
    }
    tokio::fs::File::open(path)
        .await
        .map_err(|_| PipelineError::ModelFileNotFound)?;
    Ok(metadata.len())
}
