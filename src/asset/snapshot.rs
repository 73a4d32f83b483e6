/// Snapshot bundle discovery
///
/// The engine leaves its checkpoint under `Snapshots/<id>/`. Every mesh in
/// that bundle gets its texture references resolved.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use super::resolver::{AssetPathResolver, MESH_EXTENSIONS};
use crate::error::{PipelineError, Result};

/// Length of a dashed identifier such as `3F2504E0-4F89-11D3-9A0C-0305E82C3301`
const SNAPSHOT_ID_LEN: usize = 36;
const DASH_POSITIONS: [usize; 4] = [8, 13, 18, 23];

/// True for names shaped like `8-4-4-4-12` hex digits
pub fn is_snapshot_id(name: &str) -> bool {
    name.len() == SNAPSHOT_ID_LEN
        && name.bytes().enumerate().all(|(i, byte)| {
            if DASH_POSITIONS.contains(&i) {
                byte == b'-'
            } else {
                byte.is_ascii_hexdigit()
            }
        })
}

/// First entry of the snapshots directory (by name) with an identifier name
pub fn find_snapshot_id(snapshots_dir: &Path) -> Result<Option<String>> {
    let mut names: Vec<String> = fs::read_dir(snapshots_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| is_snapshot_id(name))
        .collect();
    names.sort();
    Ok(names.into_iter().next())
}

/// Mesh files anywhere under a snapshot bundle, sorted by path
pub fn find_meshes(snapshot_dir: &Path) -> Vec<PathBuf> {
    let mut meshes: Vec<PathBuf> = WalkDir::new(snapshot_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.to_string_lossy().to_lowercase())
                .map_or(false, |ext| MESH_EXTENSIONS.contains(&ext.as_str()))
        })
        .collect();
    meshes.sort();
    meshes
}

/// Locate the snapshot bundle and resolve every mesh in it
///
/// Returns the snapshot identifier that was processed.
pub fn resolve_snapshot(snapshots_dir: &Path) -> Result<String> {
    let snapshot_id = find_snapshot_id(snapshots_dir)?.ok_or_else(|| {
        PipelineError::AssetResolution(format!(
            "No snapshot bundle in {}",
            snapshots_dir.display()
        ))
    })?;

    let snapshot_dir = snapshots_dir.join(&snapshot_id);
    let meshes = find_meshes(&snapshot_dir);
    if meshes.is_empty() {
        warn!(snapshot = %snapshot_id, "Snapshot contains no mesh files");
    }

    for mesh in &meshes {
        AssetPathResolver::for_mesh(mesh)?.resolve()?;
    }

    info!(snapshot = %snapshot_id, meshes = meshes.len(), "✅ Snapshot assets resolved");
    Ok(snapshot_id)
}
