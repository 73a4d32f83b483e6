/// Reconstruction module
///
/// This module turns a workspace of captured images into a verified model:
/// - Engine interface and request types (engine.rs)
/// - Attempt orchestration: validate, session, process, verify (orchestrator.rs)
/// - External-program engine implementation (command.rs)

pub mod command;
pub mod engine;
pub mod orchestrator;

pub use command::CommandEngine;
pub use engine::{
    DetailLevel, EngineSession, OutputEvent, ReconstructionEngine, ReconstructionRequest,
    SessionConfig,
};
pub use orchestrator::{AttemptPhase, Orchestrator, ReconstructionObserver};
