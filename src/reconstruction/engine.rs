/// Reconstruction engine interface
///
/// The engine is a black box: it is given a directory of images and a
/// configuration, accepts one output request per session and reports back
/// through an ordered stream of events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::error::{PipelineError, Result};

/// Mesh and texture resolution of the produced model
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    Preview,
    Reduced,
    Medium,
    Full,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOrdering {
    Unordered,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSensitivity {
    Normal,
    High,
}

/// Fixed per-session engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Where the engine writes its snapshot bundles
    pub checkpoint_dir: PathBuf,
    pub sample_ordering: SampleOrdering,
    pub feature_sensitivity: FeatureSensitivity,
}

impl SessionConfig {
    pub fn new(checkpoint_dir: &Path) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.to_path_buf(),
            sample_ordering: SampleOrdering::Unordered,
            feature_sensitivity: FeatureSensitivity::Normal,
        }
    }
}

/// The single request submitted per attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructionRequest {
    pub output_path: PathBuf,
    pub detail: DetailLevel,
}

/// One event from the engine's output stream
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    ProcessingComplete,
    /// Fraction of work done, 0.0 to 1.0
    RequestProgress(f64),
    RequestError(PipelineError),
    /// Anything the pipeline does not act on
    Other(String),
}

/// Creates sessions over a directory of images
pub trait ReconstructionEngine: Send + Sync + 'static {
    type Session: EngineSession;

    fn create_session(&self, input_dir: &Path, config: &SessionConfig) -> Result<Self::Session>;
}

/// A live engine session
pub trait EngineSession: Send + 'static {
    /// Submit a request. Events for it arrive on the output stream.
    fn process(&mut self, request: &ReconstructionRequest) -> Result<()>;

    /// The output stream. It can be taken once; later calls return None.
    fn take_outputs(&mut self) -> Option<mpsc::Receiver<OutputEvent>>;
}

impl DetailLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailLevel::Preview => "preview",
            DetailLevel::Reduced => "reduced",
            DetailLevel::Medium => "medium",
            DetailLevel::Full => "full",
            DetailLevel::Raw => "raw",
        }
    }
}

impl fmt::Display for DetailLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SampleOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SampleOrdering::Unordered => "unordered",
            SampleOrdering::Sequential => "sequential",
        })
    }
}

impl fmt::Display for FeatureSensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FeatureSensitivity::Normal => "normal",
            FeatureSensitivity::High => "high",
        })
    }
}
