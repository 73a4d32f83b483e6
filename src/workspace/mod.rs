/// Workspace management module
///
/// This module owns the on-disk layout of one capture session:
/// - Directory creation and verification (layout.rs)
/// - Shot filenames and enumeration of captured images (shot.rs)

pub mod layout;
pub mod shot;

pub use layout::{default_base_dir, Workspace};
pub use shot::ShotRecord;
