/// Error taxonomy for the whole pipeline
///
/// Every failure that can end a capture or reconstruction attempt is one of
/// these. Values are cloneable so the coordinator can keep the cause attached
/// to the `Failed` state and publish it to observers.

use std::io;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("The reconstructed model file is empty")]
    EmptyModelFile,

    #[error("The reconstructed model file was not found")]
    ModelFileNotFound,

    /// `required` is the same value validation compared against.
    #[error("Not enough images to reconstruct: captured {count}, need at least {required}")]
    InsufficientImages { count: usize, required: usize },

    #[error("Reconstruction failed")]
    ReconstructionFailed,

    #[error("One or more captured images are invalid or corrupted")]
    InvalidInputImages,

    #[error("Reconstruction engine error: {0}")]
    Processing(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Could not resolve model textures: {0}")]
    AssetResolution(String),
}

impl From<io::Error> for PipelineError {
    fn from(err: io::Error) -> Self {
        PipelineError::FileSystem(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
