/// Capture sources
///
/// A capture device writes shots into the workspace `Images/` directory and
/// reports what it is doing through a stream of events. The pipeline only
/// acts on `Completed` and `Failed`.

use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{PipelineError, Result};
use crate::workspace::shot::is_image_file;
use crate::workspace::{ShotRecord, Workspace};

/// Buffered capture events between device and observer task
const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Started,
    ShotCaptured { id: u32 },
    Completed,
    Failed(PipelineError),
}

/// Something that can run a capture session into a workspace
pub trait CaptureDevice: Send + Sync + 'static {
    /// Begin capturing. The session ends when the returned receiver is
    /// dropped or after `Completed`/`Failed` is sent.
    fn start(&self, workspace: &Workspace) -> Result<mpsc::Receiver<CaptureEvent>>;
}

/// Imports an existing folder of photos as a capture session
///
/// Images are copied in path order and renamed `IMG_0000.<ext>`,
/// `IMG_0001.<ext>`, ...
#[derive(Debug, Clone)]
pub struct FolderCapture {
    source: PathBuf,
}

impl FolderCapture {
    pub fn new(source: PathBuf) -> Self {
        Self { source }
    }
}

impl CaptureDevice for FolderCapture {
    fn start(&self, workspace: &Workspace) -> Result<mpsc::Receiver<CaptureEvent>> {
        if !self.source.is_dir() {
            return Err(PipelineError::FileSystem(format!(
                "Capture source {} is not a directory",
                self.source.display()
            )));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let source = self.source.clone();
        let images_dir = workspace.images_dir().to_path_buf();

        // Copying is blocking file I/O
        task::spawn_blocking(move || import_folder(&source, &images_dir, &tx));

        Ok(rx)
    }
}

/// Copy every image under `source` into `images_dir` as numbered shots
fn import_folder(source: &Path, images_dir: &Path, tx: &mpsc::Sender<CaptureEvent>) {
    if tx.blocking_send(CaptureEvent::Started).is_err() {
        return;
    }

    info!(source = %source.display(), "🔍 Scanning capture folder");

    let mut files: Vec<PathBuf> = WalkDir::new(source)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_image_file(path))
        .collect();
    files.sort();

    if files.is_empty() {
        warn!(source = %source.display(), "No images found in capture folder");
        let _ = tx.blocking_send(CaptureEvent::Failed(PipelineError::ReconstructionFailed));
        return;
    }

    for (index, path) in files.iter().enumerate() {
        let id = index as u32;
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_default();
        let destination = images_dir.join(ShotRecord::file_name(id, &extension));

        if let Err(e) = fs::copy(path, &destination) {
            let err = PipelineError::FileSystem(format!(
                "Failed to copy {}: {}",
                path.display(),
                e
            ));
            let _ = tx.blocking_send(CaptureEvent::Failed(err));
            return;
        }

        if tx.blocking_send(CaptureEvent::ShotCaptured { id }).is_err() {
            // Session torn down
            return;
        }

        if (index + 1) % 100 == 0 {
            info!(count = index + 1, "⏳ Imported shots");
        }
    }

    info!(count = files.len(), "✅ Capture complete");
    let _ = tx.blocking_send(CaptureEvent::Completed);
}
