//! Shared fixtures and fakes for unit tests.
//!
//! Provides a scripted capture device, a scripted reconstruction engine, an
//! observer that records what it is told, and helpers that lay out images
//! and snapshot bundles on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::asset::resolver::TEXTURE_SUFFIXES;
use crate::config::ReconstructionSettings;
use crate::error::{PipelineError, Result};
use crate::pipeline::{CaptureDevice, CaptureEvent};
use crate::reconstruction::{
    AttemptPhase, DetailLevel, EngineSession, OutputEvent, ReconstructionEngine,
    ReconstructionObserver, ReconstructionRequest, SessionConfig,
};
use crate::workspace::{ShotRecord, Workspace};

pub const SNAPSHOT_ID: &str = "3F2504E0-4F89-11D3-9A0C-0305E82C3301";

/// Retry settings with short delays
pub fn fast_settings() -> ReconstructionSettings {
    ReconstructionSettings {
        min_image_count: 3,
        min_image_bytes: 1024,
        session_attempts: 3,
        session_retry_delay_ms: 10,
        verify_attempts: 5,
        verify_delay_ms: 50,
        detail: DetailLevel::Reduced,
    }
}

/// Write `count` shots of `size` bytes into the workspace
pub fn write_images(workspace: &Workspace, count: usize, size: usize) {
    for id in 0..count {
        let path = workspace
            .images_dir()
            .join(ShotRecord::file_name(id as u32, "jpg"));
        fs::write(path, vec![0xABu8; size]).unwrap();
    }
}

/// Lay out a mesh the way the engine leaves it: textures under `0/`,
/// references pointing at the engine's scratch directory
pub fn write_snapshot_mesh(dir: &Path, stem: &str) -> PathBuf {
    let textures = dir.join("0");
    fs::create_dir_all(&textures).unwrap();

    let mut body = String::from("#usda 1.0\n");
    for suffix in TEXTURE_SUFFIXES {
        let name = format!("{}_{}", stem, suffix);
        fs::write(textures.join(&name), b"png").unwrap();
        body.push_str(&format!(
            "asset inputs:file = @/var/tmp/engine/{}@\n",
            name
        ));
    }

    let mesh = dir.join(format!("{}.usdc", stem));
    fs::write(&mesh, body).unwrap();
    mesh
}

/// One step of a scripted engine run
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(OutputEvent),
    Sleep(Duration),
    /// Write the model file at the request's output path
    WriteModel,
    /// Write a snapshot bundle into the checkpoint directory
    WriteSnapshot,
}

/// Engine that plays back a fixed script for every session
pub struct ScriptedEngine {
    script: Vec<ScriptStep>,
    failing_sessions: usize,
    attempts: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            failing_sessions: 0,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Snapshot, three progress events, model file, completion
    pub fn succeeding() -> Self {
        Self::new(vec![
            ScriptStep::WriteSnapshot,
            ScriptStep::Emit(OutputEvent::RequestProgress(0.25)),
            ScriptStep::Emit(OutputEvent::RequestProgress(0.5)),
            ScriptStep::Emit(OutputEvent::RequestProgress(1.0)),
            ScriptStep::WriteModel,
            ScriptStep::Emit(OutputEvent::ProcessingComplete),
        ])
    }

    /// Refuse the first `count` session creations
    pub fn failing_sessions(mut self, count: usize) -> Self {
        self.failing_sessions = count;
        self
    }

    pub fn session_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ReconstructionEngine for ScriptedEngine {
    type Session = ScriptedSession;

    fn create_session(&self, _input_dir: &Path, config: &SessionConfig) -> Result<ScriptedSession> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failing_sessions {
            return Err(PipelineError::Processing(format!(
                "session attempt {} refused",
                attempt
            )));
        }
        Ok(ScriptedSession {
            script: self.script.clone(),
            checkpoint_dir: config.checkpoint_dir.clone(),
            outputs: None,
        })
    }
}

pub struct ScriptedSession {
    script: Vec<ScriptStep>,
    checkpoint_dir: PathBuf,
    outputs: Option<mpsc::Receiver<OutputEvent>>,
}

impl EngineSession for ScriptedSession {
    fn process(&mut self, request: &ReconstructionRequest) -> Result<()> {
        let (tx, rx) = mpsc::channel(16);
        let script = self.script.clone();
        let output_path = request.output_path.clone();
        let snapshot_dir = self.checkpoint_dir.join(SNAPSHOT_ID);

        tokio::spawn(async move {
            for step in script {
                match step {
                    ScriptStep::Emit(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Sleep(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::WriteModel => fs::write(&output_path, b"usdz model bytes").unwrap(),
                    ScriptStep::WriteSnapshot => {
                        write_snapshot_mesh(&snapshot_dir, "baked_mesh");
                    }
                }
            }
        });

        self.outputs = Some(rx);
        Ok(())
    }

    fn take_outputs(&mut self) -> Option<mpsc::Receiver<OutputEvent>> {
        self.outputs.take()
    }
}

enum CaptureMode {
    Complete,
    FailFirst(PipelineError),
    Refuse,
    Idle,
    Hold,
}

/// Capture device that writes shots synchronously and reports them
pub struct ScriptedCapture {
    mode: CaptureMode,
    shots: usize,
    starts: AtomicUsize,
    held: Mutex<Vec<mpsc::Sender<CaptureEvent>>>,
}

impl ScriptedCapture {
    fn with_mode(mode: CaptureMode, shots: usize) -> Self {
        Self {
            mode,
            shots,
            starts: AtomicUsize::new(0),
            held: Mutex::new(Vec::new()),
        }
    }

    /// Writes `shots` images then completes
    pub fn completing(shots: usize) -> Self {
        Self::with_mode(CaptureMode::Complete, shots)
    }

    /// First session fails with `err`, later ones complete with `shots`
    pub fn failing_first(err: PipelineError, shots: usize) -> Self {
        Self::with_mode(CaptureMode::FailFirst(err), shots)
    }

    /// Refuses to start at all
    pub fn refusing() -> Self {
        Self::with_mode(CaptureMode::Refuse, 0)
    }

    /// Starts but never reports anything
    pub fn idle() -> Self {
        Self::with_mode(CaptureMode::Idle, 0)
    }

    /// Starts, reports nothing, and keeps every session's sender open
    pub fn holding() -> Self {
        Self::with_mode(CaptureMode::Hold, 0)
    }

    /// Sender of the `start`th session started in holding mode
    pub fn held_sender(&self, start: usize) -> mpsc::Sender<CaptureEvent> {
        self.held.lock().unwrap()[start].clone()
    }
}

impl CaptureDevice for ScriptedCapture {
    fn start(&self, workspace: &Workspace) -> Result<mpsc::Receiver<CaptureEvent>> {
        let start = self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.shots + 4);

        match &self.mode {
            CaptureMode::Refuse => {
                return Err(PipelineError::FileSystem("camera unavailable".into()))
            }
            CaptureMode::Idle => return Ok(rx),
            CaptureMode::Hold => {
                self.held.lock().unwrap().push(tx);
                return Ok(rx);
            }
            CaptureMode::FailFirst(err) if start == 0 => {
                tx.try_send(CaptureEvent::Started).unwrap();
                tx.try_send(CaptureEvent::Failed(err.clone())).unwrap();
                return Ok(rx);
            }
            CaptureMode::FailFirst(_) | CaptureMode::Complete => {}
        }

        write_images(workspace, self.shots, 2048);
        tx.try_send(CaptureEvent::Started).unwrap();
        for id in 0..self.shots {
            tx.try_send(CaptureEvent::ShotCaptured { id: id as u32 }).unwrap();
        }
        tx.try_send(CaptureEvent::Completed).unwrap();
        Ok(rx)
    }
}

/// Observer that keeps everything it receives
#[derive(Default)]
pub struct RecordingObserver {
    phases: Mutex<Vec<AttemptPhase>>,
    progress: Mutex<Vec<f64>>,
    finished: Mutex<Option<Result<PathBuf>>>,
}

impl RecordingObserver {
    pub fn phases(&self) -> Vec<AttemptPhase> {
        self.phases.lock().unwrap().clone()
    }

    pub fn progress_values(&self) -> Vec<f64> {
        self.progress.lock().unwrap().clone()
    }

    pub fn finished_result(&self) -> Option<Result<PathBuf>> {
        self.finished.lock().unwrap().clone()
    }
}

impl ReconstructionObserver for RecordingObserver {
    fn phase(&self, phase: AttemptPhase) {
        self.phases.lock().unwrap().push(phase);
    }

    fn progress(&self, fraction: f64) {
        self.progress.lock().unwrap().push(fraction);
    }

    fn finished(&self, result: Result<PathBuf>) {
        *self.finished.lock().unwrap() = Some(result);
    }
}
