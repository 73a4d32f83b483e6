/// Pipeline lifecycle states and the snapshot published to observers

use std::fmt;
use std::path::PathBuf;

use crate::error::PipelineError;

/// Current stage of the pipeline
///
/// `Failed` carries its cause, so leaving it drops the error.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PipelineState {
    #[default]
    Unset,
    Ready,
    Capturing,
    PrepareToReconstruct,
    Reconstructing,
    Viewing,
    Completed,
    Restart,
    Failed(PipelineError),
}

impl PipelineState {
    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            PipelineState::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Unset => "unset",
            PipelineState::Ready => "ready",
            PipelineState::Capturing => "capturing",
            PipelineState::PrepareToReconstruct => "prepare-to-reconstruct",
            PipelineState::Reconstructing => "reconstructing",
            PipelineState::Viewing => "viewing",
            PipelineState::Completed => "completed",
            PipelineState::Restart => "restart",
            PipelineState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Failed(err) => write!(f, "failed ({})", err),
            other => f.write_str(other.name()),
        }
    }
}

/// What observers see after every change
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineSnapshot {
    pub state: PipelineState,
    /// Identifies the current capture/reconstruction attempt
    pub generation: u64,
    /// Last reconstruction progress reported, 0.0 to 1.0
    pub progress: f64,
    /// Shots reported by the capture device this attempt
    pub shot_count: usize,
    /// Set while `Viewing`
    pub model_path: Option<PathBuf>,
    /// Why the last capture could not be started, if it could not
    pub capture_error: Option<PipelineError>,
}
