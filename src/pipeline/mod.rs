/// Pipeline coordination module
///
/// This module sequences capture, reconstruction and presentation:
/// - Lifecycle states and published snapshots (state.rs)
/// - Capture devices and their events (capture.rs)
/// - The coordinator and its message loop (machine.rs)

pub mod capture;
pub mod machine;
pub mod state;

pub use capture::{CaptureDevice, CaptureEvent, FolderCapture};
pub use machine::{Message, Pipeline, PipelineHandle};
pub use state::{PipelineSnapshot, PipelineState};
