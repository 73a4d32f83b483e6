//! Capture-to-model pipeline
//!
//! Captures photos of an object into a fresh workspace, hands them to a
//! reconstruction engine, verifies the model it writes and fixes up the
//! texture paths of the engine's snapshot bundle.
//!
//! The entry point is [`pipeline::Pipeline`]: build it with a
//! [`pipeline::CaptureDevice`] and a [`reconstruction::ReconstructionEngine`],
//! spawn [`pipeline::Pipeline::run`] and drive it through the returned
//! [`pipeline::PipelineHandle`].

pub mod asset;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod reconstruction;
pub mod workspace;

#[cfg(test)]
mod test_utils;

pub use error::{PipelineError, Result};
