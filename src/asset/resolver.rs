/// Texture reference resolution for one mesh file
///
/// Layout produced by the engine for a mesh `<dir>/<stem>.usdc`:
/// - textures in `<dir>/0/<stem>_ao0.png`, `_norm0.png`, `_tex0.png`
/// - references inside the mesh carrying whatever directory the engine used
///
/// After resolution every reference is the bare texture file name and the
/// texture files sit beside the mesh.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};

/// Texture suffixes every mesh must have
pub const TEXTURE_SUFFIXES: [&str; 3] = ["ao0.png", "norm0.png", "tex0.png"];

/// Subfolder of the mesh directory the engine writes textures into
const TEXTURE_SUBDIR: &str = "0";

/// Mesh file extensions handled by the resolver
pub const MESH_EXTENSIONS: [&str; 2] = ["usdc", "usda"];

/// Bytes that end an embedded asset path
fn is_reference_delimiter(byte: u8) -> bool {
    matches!(
        byte,
        b'@' | b'"' | b'\'' | 0 | b'(' | b')' | b'[' | b']' | b'<' | b'>' | b'=' | b','
    ) || byte.is_ascii_whitespace()
}

fn is_path_separator(byte: u8) -> bool {
    byte == b'/' || byte == b'\\'
}

/// Resolves texture references and locations for a single mesh
#[derive(Debug, Clone)]
pub struct AssetPathResolver {
    mesh_path: PathBuf,
    mesh_dir: PathBuf,
    stem: String,
}

impl AssetPathResolver {
    pub fn for_mesh(mesh_path: &Path) -> Result<Self> {
        let stem = mesh_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| {
                PipelineError::AssetResolution(format!(
                    "Invalid mesh file name: {}",
                    mesh_path.display()
                ))
            })?
            .to_string();
        let mesh_dir = mesh_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Ok(Self {
            mesh_path: mesh_path.to_path_buf(),
            mesh_dir,
            stem,
        })
    }

    /// Names of the textures this mesh references, e.g. `baked_mesh_tex0.png`
    pub fn texture_names(&self) -> Vec<String> {
        TEXTURE_SUFFIXES
            .iter()
            .map(|suffix| format!("{}_{}", self.stem, suffix))
            .collect()
    }

    /// Where the engine wrote a texture
    pub fn source_path(&self, texture_name: &str) -> PathBuf {
        self.mesh_dir.join(TEXTURE_SUBDIR).join(texture_name)
    }

    /// Where the rewritten references expect a texture
    pub fn expected_path(&self, texture_name: &str) -> PathBuf {
        self.mesh_dir.join(texture_name)
    }

    /// Check, rewrite, relocate. Safe to run again on a resolved mesh.
    pub fn resolve(&self) -> Result<()> {
        self.check_textures()?;
        let rewritten = self.resolve_texture_paths()?;
        let moved = self.move_textures_to_expected_location()?;

        info!(
            mesh = %self.mesh_path.display(),
            rewritten,
            moved,
            "🧵 Resolved texture paths"
        );
        Ok(())
    }

    /// Every texture must exist either where the engine put it or where it
    /// is expected
    pub fn check_textures(&self) -> Result<()> {
        for name in self.texture_names() {
            if !self.source_path(&name).is_file() && !self.expected_path(&name).is_file() {
                return Err(PipelineError::AssetResolution(format!(
                    "Missing texture {} for {}",
                    name,
                    self.mesh_path.display()
                )));
            }
        }
        Ok(())
    }

    /// Rewrite embedded texture references to bare file names
    ///
    /// Returns the number of references changed. The mesh is only written
    /// back when that number is non-zero.
    pub fn resolve_texture_paths(&self) -> Result<usize> {
        let data = fs::read(&self.mesh_path).map_err(|e| {
            PipelineError::AssetResolution(format!(
                "Failed to read {}: {}",
                self.mesh_path.display(),
                e
            ))
        })?;

        let names = self.texture_names();
        let (rewritten, count) = rewrite_references(&data, &names);
        if count == 0 {
            debug!(mesh = %self.mesh_path.display(), "Texture references already resolved");
            return Ok(0);
        }

        let tmp_path = self.mesh_path.with_extension("resolving");
        fs::write(&tmp_path, &rewritten)
            .and_then(|_| fs::rename(&tmp_path, &self.mesh_path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp_path);
                PipelineError::AssetResolution(format!(
                    "Failed to rewrite {}: {}",
                    self.mesh_path.display(),
                    e
                ))
            })?;

        Ok(count)
    }

    /// Move textures from the engine's subfolder to beside the mesh
    ///
    /// A texture already at its destination is left alone. Returns the
    /// number of files moved.
    pub fn move_textures_to_expected_location(&self) -> Result<usize> {
        let mut moved = 0;
        for name in self.texture_names() {
            let destination = self.expected_path(&name);
            if destination.exists() {
                continue;
            }

            let source = self.source_path(&name);
            move_file(&source, &destination).map_err(|e| {
                PipelineError::AssetResolution(format!(
                    "Failed to move {} to {}: {}",
                    source.display(),
                    destination.display(),
                    e
                ))
            })?;
            moved += 1;
        }
        Ok(moved)
    }
}

/// Rename, falling back to copy + delete across filesystems
fn move_file(source: &Path, destination: &Path) -> std::io::Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    fs::copy(source, destination)?;
    fs::remove_file(source)
}

/// Replace every `<dir>/<name>` reference with `<name>`
///
/// An occurrence of a texture name only counts as a reference to it when
/// the byte before it is a path separator, a delimiter, or the start of the
/// buffer. Occurrences already bare are left as they are.
fn rewrite_references(data: &[u8], names: &[String]) -> (Vec<u8>, usize) {
    let mut spans: Vec<(usize, usize, usize)> = Vec::new(); // (start, end, name index)

    for (index, name) in names.iter().enumerate() {
        let needle = name.as_bytes();
        let mut from = 0;
        while let Some(offset) = find(&data[from..], needle) {
            let name_start = from + offset;
            let end = name_start + needle.len();
            from = end;

            if name_start == 0 || is_reference_delimiter(data[name_start - 1]) {
                continue;
            }
            if !is_path_separator(data[name_start - 1]) {
                // Part of a longer file name
                continue;
            }

            let mut start = name_start;
            while start > 0 && !is_reference_delimiter(data[start - 1]) {
                start -= 1;
            }
            spans.push((start, end, index));
        }
    }

    if spans.is_empty() {
        return (data.to_vec(), 0);
    }

    spans.sort_by_key(|span| span.0);
    let mut output = Vec::with_capacity(data.len());
    let mut cursor = 0;
    let mut count = 0;
    for (start, end, index) in spans {
        if start < cursor {
            continue;
        }
        output.extend_from_slice(&data[cursor..start]);
        output.extend_from_slice(names[index].as_bytes());
        cursor = end;
        count += 1;
    }
    output.extend_from_slice(&data[cursor..]);

    (output, count)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
