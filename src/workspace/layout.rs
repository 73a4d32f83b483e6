/// Workspace directory tree
///
/// Each capture session gets a timestamp-named root holding `Images`,
/// `Snapshots` and `Models`.

use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::shot::{is_image_file, ShotRecord};
use crate::error::{PipelineError, Result};

const IMAGES_DIR: &str = "Images";
const SNAPSHOTS_DIR: &str = "Snapshots";
const MODELS_DIR: &str = "Models";

/// Directory under the user's documents folder that holds all workspaces
const APP_DIR: &str = "capture-pipeline";

/// Timestamp format of workspace root names
const ROOT_NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S%.3f";

/// The directory tree owned by one capture session
///
/// A `Workspace` value only exists once all four directories have been
/// created and verified.
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    root: PathBuf,
    images: PathBuf,
    snapshots: PathBuf,
    models: PathBuf,
}

/// Base directory for workspaces
///
/// - Linux: ~/Documents/capture-pipeline
/// - macOS: ~/Documents/capture-pipeline
/// - Windows: {FOLDERID_Documents}\capture-pipeline
pub fn default_base_dir() -> Result<PathBuf> {
    let mut path = dirs::document_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| {
            PipelineError::FileSystem("Could not determine the documents directory".into())
        })?;
    path.push(APP_DIR);
    Ok(path)
}

impl Workspace {
    /// Create a fresh timestamp-named workspace under `base`
    ///
    /// On any failure the partially created root is removed, so callers
    /// never see half a workspace.
    pub fn create(base: &Path) -> Result<Self> {
        fs::create_dir_all(base).map_err(|e| {
            PipelineError::FileSystem(format!("Failed to create {}: {}", base.display(), e))
        })?;

        let root = create_unique_root(base)?;
        Self::populate_or_remove(&root)
    }

    /// Populate a fresh root, removing it again if that fails
    fn populate_or_remove(root: &Path) -> Result<Self> {
        match Self::populate(root) {
            Ok(workspace) => {
                info!(root = %root.display(), "📁 Workspace created");
                Ok(workspace)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(root) {
                    warn!(root = %root.display(), error = %cleanup, "Failed to remove partial workspace");
                }
                Err(err)
            }
        }
    }

    fn populate(root: &Path) -> Result<Self> {
        let workspace = Self {
            root: root.to_path_buf(),
            images: root.join(IMAGES_DIR),
            snapshots: root.join(SNAPSHOTS_DIR),
            models: root.join(MODELS_DIR),
        };

        for dir in [&workspace.images, &workspace.snapshots, &workspace.models] {
            fs::create_dir_all(dir).map_err(|e| {
                PipelineError::FileSystem(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        // Re-check everything, including the root, after creation
        for dir in workspace.dirs() {
            if !dir.is_dir() {
                return Err(PipelineError::FileSystem(format!(
                    "{} is not a directory",
                    dir.display()
                )));
            }
        }

        Ok(workspace)
    }

    fn dirs(&self) -> [&Path; 4] {
        [
            self.root.as_path(),
            self.images.as_path(),
            self.snapshots.as_path(),
            self.models.as_path(),
        ]
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> &Path {
        &self.images
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots
    }

    pub fn models_dir(&self) -> &Path {
        &self.models
    }

    /// Path of the model file with the given name inside `Models/`
    pub fn model_path(&self, file_name: &str) -> PathBuf {
        self.models.join(file_name)
    }

    /// All image files in `Images/`, hidden entries skipped, sorted by name
    pub fn image_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.images)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            if path.is_file() && is_image_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Captured shots ordered by id
    ///
    /// Reads the directory as it is right now; capture may still be adding
    /// files, so two calls can disagree.
    pub fn list_shots(&self) -> Result<Vec<ShotRecord>> {
        let mut shots: Vec<ShotRecord> = self
            .image_files()?
            .into_iter()
            .filter_map(|path| {
                let shot = ShotRecord::from_path(&path);
                if shot.is_none() {
                    warn!(file = %path.display(), "Skipping image with unexpected name");
                }
                shot
            })
            .collect();

        shots.sort_by_key(|shot| shot.id);
        debug!(count = shots.len(), "Listed shots");
        Ok(shots)
    }
}

/// Create the root directory, appending `-1`, `-2`, ... if the timestamp
/// name is already taken
fn create_unique_root(base: &Path) -> Result<PathBuf> {
    let stamp = Local::now().format(ROOT_NAME_FORMAT).to_string();
    let mut candidate = base.join(&stamp);
    let mut suffix = 0;

    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && suffix < 100 => {
                suffix += 1;
                candidate = base.join(format!("{}-{}", stamp, suffix));
            }
            Err(e) => {
                return Err(PipelineError::FileSystem(format!(
                    "Failed to create {}: {}",
                    candidate.display(),
                    e
                )))
            }
        }
    }
}
