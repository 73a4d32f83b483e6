/// Pipeline configuration
///
/// Loaded from a TOML file. Every field has a default so an empty file
/// (or no file at all) gives a working configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::reconstruction::DetailLevel;

/// Fixed name of the single model file produced per attempt
pub const DEFAULT_MODEL_FILE_NAME: &str = "model-mobile.usdz";

/// Top-level configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base directory for workspaces (None = user documents directory)
    pub documents_dir: Option<PathBuf>,
    /// File name of the reconstructed model inside `Models/`
    pub model_file_name: String,
    pub reconstruction: ReconstructionSettings,
    pub engine: EngineSettings,
}

/// Validation thresholds and retry policy for one reconstruction attempt
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReconstructionSettings {
    /// Fewer images than this fails validation
    pub min_image_count: usize,
    /// Images smaller than this are treated as corrupted
    pub min_image_bytes: u64,
    /// Engine session creation attempts
    pub session_attempts: u32,
    pub session_retry_delay_ms: u64,
    /// Model file probes after processing completes
    pub verify_attempts: u32,
    pub verify_delay_ms: u64,
    /// Detail level of the single output request
    pub detail: DetailLevel,
}

/// External reconstruction program
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct EngineSettings {
    pub program: Option<PathBuf>,
    /// Extra arguments passed before the generated ones
    pub args: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            documents_dir: None,
            model_file_name: DEFAULT_MODEL_FILE_NAME.to_string(),
            reconstruction: ReconstructionSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

impl Default for ReconstructionSettings {
    fn default() -> Self {
        Self {
            min_image_count: 3,
            min_image_bytes: 1024,
            session_attempts: 3,
            session_retry_delay_ms: 1000,
            verify_attempts: 10,
            verify_delay_ms: 500,
            detail: DetailLevel::Reduced,
        }
    }
}

impl ReconstructionSettings {
    pub fn session_retry_delay(&self) -> Duration {
        Duration::from_millis(self.session_retry_delay_ms)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }
}

impl PipelineConfig {
    /// Parse from a TOML string
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Read and parse a TOML config file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}
