/// The pipeline coordinator
///
/// `Pipeline` owns the lifecycle state. It is only mutated by `update`, and
/// `update` is only called by `run`, which drains a single message channel.
/// Capture observers, reconstruction tasks and callers all talk to it by
/// sending `Message`s, so no two transitions ever apply at once.
///
/// Every capture attempt gets a generation number. Messages from tasks carry
/// the generation they were started under; after a reset those are stale
/// and get dropped.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::capture::{CaptureDevice, CaptureEvent};
use super::state::{PipelineSnapshot, PipelineState};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::reconstruction::{AttemptPhase, Orchestrator, ReconstructionEngine, ReconstructionObserver};
use crate::workspace::{default_base_dir, Workspace};

/// Everything that can change the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Leave `Unset` and begin the first capture
    Start,
    /// Event forwarded from the capture device
    Capture { generation: u64, event: CaptureEvent },
    ReconstructionPhase { generation: u64, phase: AttemptPhase },
    ReconstructionProgress { generation: u64, fraction: f64 },
    ReconstructionFinished {
        generation: u64,
        result: Result<PathBuf>,
    },
    /// Caller wants to start over
    Restart,
    /// Caller is done with the current model
    Complete,
    /// Tear down and stop the run loop
    Shutdown,
}

/// Caller-side handle: send commands, watch the state
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<Message>,
    snapshot: watch::Receiver<PipelineSnapshot>,
}

impl PipelineHandle {
    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("Pipeline loop already stopped");
        }
    }

    pub fn start(&self) {
        self.send(Message::Start);
    }

    pub fn restart(&self) {
        self.send(Message::Restart);
    }

    pub fn complete(&self) {
        self.send(Message::Complete);
    }

    pub fn shutdown(&self) {
        self.send(Message::Shutdown);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.snapshot.clone()
    }
}

/// Forwards orchestrator callbacks into the message channel, tagged with the
/// generation the attempt was started under
struct GenerationObserver {
    tx: mpsc::UnboundedSender<Message>,
    generation: u64,
}

impl ReconstructionObserver for GenerationObserver {
    fn phase(&self, phase: AttemptPhase) {
        let _ = self.tx.send(Message::ReconstructionPhase {
            generation: self.generation,
            phase,
        });
    }

    fn progress(&self, fraction: f64) {
        let _ = self.tx.send(Message::ReconstructionProgress {
            generation: self.generation,
            fraction,
        });
    }

    fn finished(&self, result: Result<PathBuf>) {
        let _ = self.tx.send(Message::ReconstructionFinished {
            generation: self.generation,
            result,
        });
    }
}

/// The coordinator
pub struct Pipeline<C, E> {
    config: PipelineConfig,
    capture: Arc<C>,
    orchestrator: Orchestrator<E>,

    state: PipelineState,
    generation: u64,
    workspace: Option<Arc<Workspace>>,
    capture_task: Option<JoinHandle<()>>,
    reconstruction: Option<JoinHandle<()>>,

    tx: mpsc::UnboundedSender<Message>,
    snapshot: watch::Sender<PipelineSnapshot>,
}

impl<C: CaptureDevice, E: ReconstructionEngine> Pipeline<C, E> {
    /// Build the coordinator, its handle and the receiving end of its channel
    pub fn new(
        config: PipelineConfig,
        capture: C,
        engine: E,
    ) -> (Self, PipelineHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(PipelineSnapshot::default());
        let orchestrator = Orchestrator::new(
            Arc::new(engine),
            config.reconstruction.clone(),
            &config.model_file_name,
        );

        let pipeline = Self {
            config,
            capture: Arc::new(capture),
            orchestrator,
            state: PipelineState::Unset,
            generation: 0,
            workspace: None,
            capture_task: None,
            reconstruction: None,
            tx: tx.clone(),
            snapshot,
        };
        let handle = PipelineHandle {
            tx,
            snapshot: snapshot_rx,
        };

        (pipeline, handle, rx)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Apply messages until `Shutdown` or until every sender is gone
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            if !self.update(message) {
                break;
            }
        }
        self.reset();
        info!("Pipeline stopped");
    }

    /// Handle one message; false means stop
    pub fn update(&mut self, message: Message) -> bool {
        match message {
            Message::Start => {
                if self.state == PipelineState::Unset {
                    self.transition(PipelineState::Ready);
                } else {
                    debug!(state = %self.state, "Ignoring start, already running");
                }
            }
            Message::Capture { generation, event } => {
                if self.is_current(generation) {
                    self.on_capture_event(event);
                }
            }
            Message::ReconstructionPhase { generation, phase } => {
                if self.is_current(generation) {
                    debug!(?phase, "Reconstruction phase");
                }
            }
            Message::ReconstructionProgress {
                generation,
                fraction,
            } => {
                if self.is_current(generation) && self.state == PipelineState::Reconstructing {
                    self.snapshot.send_modify(|snapshot| snapshot.progress = fraction);
                }
            }
            Message::ReconstructionFinished { generation, result } => {
                if self.is_current(generation) {
                    self.on_reconstruction_finished(result);
                }
            }
            Message::Restart => self.transition(PipelineState::Restart),
            Message::Complete => self.transition(PipelineState::Completed),
            Message::Shutdown => return false,
        }
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "Discarding message from a previous attempt"
            );
            return false;
        }
        true
    }

    fn on_capture_event(&mut self, event: CaptureEvent) {
        if self.state != PipelineState::Capturing {
            debug!(state = %self.state, ?event, "Capture event outside capture");
            return;
        }

        match event {
            CaptureEvent::Completed => self.transition(PipelineState::PrepareToReconstruct),
            CaptureEvent::Failed(err) => {
                error!(error = %err, "Capture session failed");
                self.transition(PipelineState::Failed(err));
            }
            CaptureEvent::ShotCaptured { id } => {
                debug!(id, "Shot captured");
                self.snapshot.send_modify(|snapshot| snapshot.shot_count += 1);
            }
            CaptureEvent::Started => debug!("Capture session started"),
        }
    }

    fn on_reconstruction_finished(&mut self, result: Result<PathBuf>) {
        if self.state != PipelineState::Reconstructing {
            debug!(state = %self.state, "Reconstruction result outside reconstruction");
            return;
        }

        match result {
            Ok(model_path) => {
                self.snapshot
                    .send_modify(|snapshot| snapshot.model_path = Some(model_path));
                self.transition(PipelineState::Viewing);
            }
            Err(err) => self.transition(PipelineState::Failed(err)),
        }
    }

    /// Enter a state and run its entry action
    fn transition(&mut self, next: PipelineState) {
        info!(from = %self.state, to = %next, "State transition");
        self.state = next;
        self.publish();

        match self.state.clone() {
            PipelineState::Ready => self.enter_ready(),
            PipelineState::PrepareToReconstruct => self.enter_prepare_to_reconstruct(),
            PipelineState::Viewing => {
                // The attempt is over; the task ends on its own
                self.reconstruction = None;
            }
            PipelineState::Completed | PipelineState::Restart => {
                self.reset();
                self.transition(PipelineState::Ready);
            }
            PipelineState::Unset
            | PipelineState::Capturing
            | PipelineState::Reconstructing
            | PipelineState::Failed(_) => {}
        }
    }

    fn publish(&self) {
        let state = self.state.clone();
        let generation = self.generation;
        self.snapshot.send_modify(|snapshot| {
            if state != PipelineState::Viewing {
                snapshot.model_path = None;
            }
            snapshot.state = state;
            snapshot.generation = generation;
        });
    }

    fn enter_ready(&mut self) {
        self.generation += 1;
        self.snapshot.send_modify(|snapshot| {
            snapshot.progress = 0.0;
            snapshot.shot_count = 0;
        });

        match self.start_capture() {
            Ok(()) => {
                self.snapshot.send_modify(|snapshot| snapshot.capture_error = None);
                self.transition(PipelineState::Capturing);
            }
            Err(err) => {
                // Stay in Ready; the caller decides whether to restart
                error!(error = %err, "Could not start a capture session");
                self.workspace = None;
                self.snapshot
                    .send_modify(|snapshot| snapshot.capture_error = Some(err));
            }
        }
    }

    fn start_capture(&mut self) -> Result<()> {
        let base = match &self.config.documents_dir {
            Some(dir) => dir.clone(),
            None => default_base_dir()?,
        };
        let workspace = Arc::new(Workspace::create(&base)?);
        let mut events = self.capture.start(&workspace)?;

        let tx = self.tx.clone();
        let generation = self.generation;
        self.capture_task = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(Message::Capture { generation, event }).is_err() {
                    break;
                }
            }
        }));
        self.workspace = Some(workspace);
        Ok(())
    }

    fn enter_prepare_to_reconstruct(&mut self) {
        self.release_capture();

        let Some(workspace) = self.workspace.clone() else {
            warn!("No workspace to reconstruct from");
            self.transition(PipelineState::Failed(PipelineError::ReconstructionFailed));
            return;
        };
        if self.reconstruction.is_some() {
            warn!("A reconstruction is already in flight");
            return;
        }

        let observer = GenerationObserver {
            tx: self.tx.clone(),
            generation: self.generation,
        };
        match self.orchestrator.submit(workspace, observer) {
            Ok(handle) => {
                self.reconstruction = Some(handle);
                self.transition(PipelineState::Reconstructing);
            }
            Err(err) => self.transition(PipelineState::Failed(err)),
        }
    }

    fn release_capture(&mut self) {
        if let Some(task) = self.capture_task.take() {
            task.abort();
        }
    }

    /// Drop every session and workspace handle
    ///
    /// Returns false, and does nothing, if nothing was held.
    pub fn reset(&mut self) -> bool {
        if self.workspace.is_none() && self.capture_task.is_none() && self.reconstruction.is_none()
        {
            debug!("Nothing to reset");
            return false;
        }

        self.generation += 1;
        self.release_capture();
        // Not cancellable; its late callbacks are fenced by the generation
        if self.reconstruction.take().is_some() {
            debug!("Abandoning in-flight reconstruction");
        }
        if let Some(workspace) = self.workspace.take() {
            info!(root = %workspace.root().display(), "Workspace released");
        }
        self.snapshot.send_modify(|snapshot| {
            snapshot.progress = 0.0;
            snapshot.shot_count = 0;
            snapshot.model_path = None;
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruction::OutputEvent;
    use crate::test_utils::{fast_settings, ScriptStep, ScriptedCapture, ScriptedEngine};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::time::timeout;

    fn config(base: &TempDir) -> PipelineConfig {
        PipelineConfig {
            documents_dir: Some(base.path().to_path_buf()),
            reconstruction: fast_settings(),
            ..PipelineConfig::default()
        }
    }

    async fn wait_for(
        handle: &PipelineHandle,
        predicate: impl Fn(&PipelineSnapshot) -> bool,
    ) -> PipelineSnapshot {
        let mut rx = handle.subscribe();
        let snapshot = timeout(Duration::from_secs(10), rx.wait_for(|s| predicate(s)))
            .await
            .expect("timed out waiting for pipeline state")
            .expect("pipeline stopped");
        snapshot.clone()
    }

    #[tokio::test]
    async fn test_capture_to_viewing() {
        let base = tempdir().unwrap();
        let (pipeline, handle, rx) = Pipeline::new(
            config(&base),
            ScriptedCapture::completing(4),
            ScriptedEngine::succeeding(),
        );
        let runner = tokio::spawn(pipeline.run(rx));

        handle.start();
        let snapshot = wait_for(&handle, |s| s.state == PipelineState::Viewing).await;

        let model = snapshot.model_path.unwrap();
        assert!(model.ends_with("Models/model-mobile.usdz"));
        assert!(model.is_file());
        assert_eq!(snapshot.shot_count, 4);
        assert_eq!(snapshot.progress, 1.0);

        handle.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_failure_then_restart() {
        let base = tempdir().unwrap();
        let capture = ScriptedCapture::failing_first(PipelineError::FileSystem("disk full".into()), 4);
        let (pipeline, handle, rx) =
            Pipeline::new(config(&base), capture, ScriptedEngine::succeeding());
        let runner = tokio::spawn(pipeline.run(rx));

        handle.start();
        let failed = wait_for(&handle, |s| matches!(s.state, PipelineState::Failed(_))).await;
        assert_eq!(
            failed.state.error(),
            Some(&PipelineError::FileSystem("disk full".into()))
        );

        handle.restart();
        let viewing = wait_for(&handle, |s| s.state == PipelineState::Viewing).await;
        assert!(viewing.generation > failed.generation);
        assert_eq!(viewing.state.error(), None);

        handle.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconstruction_error_reaches_failed() {
        let base = tempdir().unwrap();
        let engine = ScriptedEngine::new(vec![ScriptStep::Emit(OutputEvent::RequestError(
            PipelineError::Processing("engine crashed".into()),
        ))]);
        let (pipeline, handle, rx) =
            Pipeline::new(config(&base), ScriptedCapture::completing(3), engine);
        let runner = tokio::spawn(pipeline.run(rx));

        handle.start();
        let failed = wait_for(&handle, |s| matches!(s.state, PipelineState::Failed(_))).await;
        assert_eq!(
            failed.state,
            PipelineState::Failed(PipelineError::Processing("engine crashed".into()))
        );
        assert!(failed.model_path.is_none());

        handle.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_images_reaches_failed() {
        let base = tempdir().unwrap();
        let (pipeline, handle, rx) = Pipeline::new(
            config(&base),
            ScriptedCapture::completing(2),
            ScriptedEngine::succeeding(),
        );
        let runner = tokio::spawn(pipeline.run(rx));

        handle.start();
        let failed = wait_for(&handle, |s| matches!(s.state, PipelineState::Failed(_))).await;
        assert_eq!(
            failed.state.error(),
            Some(&PipelineError::InsufficientImages { count: 2, required: 3 })
        );

        handle.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_start_failure_stays_ready() {
        let base = tempdir().unwrap();
        let (mut pipeline, handle, _rx) = Pipeline::new(
            config(&base),
            ScriptedCapture::refusing(),
            ScriptedEngine::succeeding(),
        );

        pipeline.update(Message::Start);

        assert_eq!(pipeline.state(), &PipelineState::Ready);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, PipelineState::Ready);
        assert!(matches!(snapshot.capture_error, Some(PipelineError::FileSystem(_))));
        // Nothing held, so a reset has nothing to do
        assert!(!pipeline.reset());
    }

    #[tokio::test]
    async fn test_completed_from_viewing_starts_new_capture() {
        let base = tempdir().unwrap();
        let (mut pipeline, handle, _rx) = Pipeline::new(
            config(&base),
            ScriptedCapture::idle(),
            ScriptedEngine::succeeding(),
        );

        pipeline.update(Message::Start);
        assert_eq!(pipeline.state(), &PipelineState::Capturing);
        let first = pipeline.generation();

        pipeline.state = PipelineState::Reconstructing;
        pipeline.update(Message::ReconstructionFinished {
            generation: first,
            result: Ok(PathBuf::from("/tmp/model.usdz")),
        });
        assert_eq!(pipeline.state(), &PipelineState::Viewing);
        assert_eq!(
            handle.snapshot().model_path,
            Some(PathBuf::from("/tmp/model.usdz"))
        );

        pipeline.update(Message::Complete);
        assert_eq!(pipeline.state(), &PipelineState::Capturing);
        assert!(pipeline.generation() > first);
        assert_eq!(handle.snapshot().model_path, None);
    }

    #[tokio::test]
    async fn test_stale_messages_are_discarded() {
        let base = tempdir().unwrap();
        let (mut pipeline, _handle, _rx) = Pipeline::new(
            config(&base),
            ScriptedCapture::idle(),
            ScriptedEngine::succeeding(),
        );

        pipeline.update(Message::Start);
        let stale = pipeline.generation();
        pipeline.update(Message::Restart);
        assert_eq!(pipeline.state(), &PipelineState::Capturing);
        assert_ne!(pipeline.generation(), stale);

        // Late events from the abandoned attempt change nothing
        pipeline.update(Message::Capture {
            generation: stale,
            event: CaptureEvent::Completed,
        });
        pipeline.update(Message::ReconstructionFinished {
            generation: stale,
            result: Err(PipelineError::ReconstructionFailed),
        });
        assert_eq!(pipeline.state(), &PipelineState::Capturing);
    }

    #[tokio::test]
    async fn test_reset_twice_is_noop() {
        let base = tempdir().unwrap();
        let (mut pipeline, _handle, _rx) = Pipeline::new(
            config(&base),
            ScriptedCapture::idle(),
            ScriptedEngine::succeeding(),
        );

        pipeline.update(Message::Start);
        assert!(pipeline.reset());
        let generation = pipeline.generation();

        assert!(!pipeline.reset());
        assert_eq!(pipeline.generation(), generation);
    }

    #[tokio::test]
    async fn test_restart_stops_forwarding_capture_events() {
        let base = tempdir().unwrap();
        let (pipeline, handle, rx) = Pipeline::new(
            config(&base),
            ScriptedCapture::holding(),
            ScriptedEngine::succeeding(),
        );
        let capture = Arc::clone(&pipeline.capture);
        let runner = tokio::spawn(pipeline.run(rx));

        handle.start();
        let first = wait_for(&handle, |s| s.state == PipelineState::Capturing).await;
        let sender = capture.held_sender(0);
        assert!(!sender.is_closed());

        handle.restart();
        wait_for(&handle, |s| {
            s.state == PipelineState::Capturing && s.generation > first.generation
        })
        .await;
        timeout(Duration::from_secs(5), sender.closed())
            .await
            .expect("capture channel still open after restart");
        assert!(!capture.held_sender(1).is_closed());

        handle.shutdown();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_waits_for_restart() {
        let base = tempdir().unwrap();
        let (mut pipeline, _handle, _rx) = Pipeline::new(
            config(&base),
            ScriptedCapture::idle(),
            ScriptedEngine::succeeding(),
        );

        pipeline.update(Message::Start);
        let generation = pipeline.generation();
        pipeline.update(Message::Capture {
            generation,
            event: CaptureEvent::Failed(PipelineError::InvalidInputImages),
        });
        assert_eq!(
            pipeline.state(),
            &PipelineState::Failed(PipelineError::InvalidInputImages)
        );

        // Events for the failed attempt do not move it
        pipeline.update(Message::Capture {
            generation,
            event: CaptureEvent::Completed,
        });
        pipeline.update(Message::Start);
        assert!(matches!(pipeline.state(), PipelineState::Failed(_)));

        pipeline.update(Message::Restart);
        assert_eq!(pipeline.state(), &PipelineState::Capturing);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let base = tempdir().unwrap();
        let (mut pipeline, _handle, _rx) = Pipeline::new(
            config(&base),
            ScriptedCapture::idle(),
            ScriptedEngine::succeeding(),
        );
        assert!(pipeline.update(Message::Start));
        assert!(!pipeline.update(Message::Shutdown));
    }
}
