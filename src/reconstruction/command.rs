/// External-process reconstruction engine
///
/// Runs a reconstruction program as a child process. The program gets the
/// input, checkpoint and output locations as flags and reports back on
/// stdout, one JSON object per line:
///
/// ```text
/// {"event":"progress","fraction":0.42}
/// {"event":"error","message":"not enough features"}
/// {"event":"complete"}
/// ```
///
/// Lines that are not recognised become `OutputEvent::Other`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::engine::{
    EngineSession, OutputEvent, ReconstructionEngine, ReconstructionRequest, SessionConfig,
};
use crate::error::{PipelineError, Result};

/// Buffered events between the stdout reader and the orchestrator
const OUTPUT_BUFFER: usize = 64;

/// Wire format of one stdout line
#[derive(Deserialize, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireEvent {
    Progress { fraction: f64 },
    Complete,
    Error { message: String },
    #[serde(other)]
    Unknown,
}

/// Map one stdout line to an output event
pub fn parse_event_line(line: &str) -> OutputEvent {
    match serde_json::from_str::<WireEvent>(line.trim()) {
        Ok(WireEvent::Progress { fraction }) => OutputEvent::RequestProgress(fraction),
        Ok(WireEvent::Complete) => OutputEvent::ProcessingComplete,
        Ok(WireEvent::Error { message }) => OutputEvent::RequestError(PipelineError::Processing(message)),
        Ok(WireEvent::Unknown) | Err(_) => OutputEvent::Other(line.trim().to_string()),
    }
}

/// Engine backed by an external program
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl ReconstructionEngine for CommandEngine {
    type Session = CommandSession;

    fn create_session(&self, input_dir: &Path, config: &SessionConfig) -> Result<CommandSession> {
        if !input_dir.is_dir() {
            return Err(PipelineError::Processing(format!(
                "Input directory {} does not exist",
                input_dir.display()
            )));
        }
        if !config.checkpoint_dir.is_dir() {
            return Err(PipelineError::Processing(format!(
                "Checkpoint directory {} does not exist",
                config.checkpoint_dir.display()
            )));
        }

        Ok(CommandSession {
            program: self.program.clone(),
            args: self.args.clone(),
            input_dir: input_dir.to_path_buf(),
            config: config.clone(),
            submitted: false,
            outputs: None,
        })
    }
}

/// One run of the external program
#[derive(Debug)]
pub struct CommandSession {
    program: PathBuf,
    args: Vec<String>,
    input_dir: PathBuf,
    config: SessionConfig,
    submitted: bool,
    outputs: Option<mpsc::Receiver<OutputEvent>>,
}

impl CommandSession {
    fn command(&self, request: &ReconstructionRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--input")
            .arg(&self.input_dir)
            .arg("--checkpoint")
            .arg(&self.config.checkpoint_dir)
            .arg("--output")
            .arg(&request.output_path)
            .arg("--detail")
            .arg(request.detail.as_str())
            .arg("--ordering")
            .arg(self.config.sample_ordering.to_string())
            .arg("--sensitivity")
            .arg(self.config.feature_sensitivity.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl EngineSession for CommandSession {
    fn process(&mut self, request: &ReconstructionRequest) -> Result<()> {
        if self.submitted {
            return Err(PipelineError::Processing(
                "A request was already submitted to this session".into(),
            ));
        }

        let mut child = self.command(request).spawn().map_err(|e| {
            PipelineError::Processing(format!("Failed to start {}: {}", self.program.display(), e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Processing("Engine stdout not captured".into()))?;
        self.submitted = true;

        info!(program = %self.program.display(), detail = %request.detail, "🚀 Engine started");

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        tokio::spawn(async move {
            // The engine may keep writing after it reports completion, so
            // stdout is read to the end even once nobody is listening
            let mut forwarding = true;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !forwarding || line.trim().is_empty() {
                    continue;
                }
                if tx.send(parse_event_line(&line)).await.is_err() {
                    debug!("Output stream dropped, draining engine output");
                    forwarding = false;
                }
            }

            match child.wait().await {
                Ok(status) if status.success() => debug!("Engine exited cleanly"),
                Ok(status) => {
                    let err = PipelineError::Processing(format!("Engine exited with {}", status));
                    let _ = tx.send(OutputEvent::RequestError(err)).await;
                }
                Err(e) => {
                    let err = PipelineError::Processing(format!("Failed to wait for engine: {}", e));
                    let _ = tx.send(OutputEvent::RequestError(err)).await;
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
