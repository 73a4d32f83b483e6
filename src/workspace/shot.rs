/// Shot records and the `IMG_<id>` filename codec
///
/// Captured images are named `IMG_0000.HEIC`, `IMG_0001.JPG`, ... The numeric
/// part identifies the shot and gives the capture order.

use std::path::{Path, PathBuf};

/// Filename prefix shared by every shot (including the separator)
const SHOT_PREFIX: &str = "IMG_";

/// Accepted image extensions, compared case-insensitively
pub const IMAGE_EXTENSIONS: [&str; 3] = ["heic", "jpg", "jpeg"];

/// One captured image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShotRecord {
    pub id: u32,
    pub path: PathBuf,
}

impl ShotRecord {
    /// Build a record from an image path, None if the name is not a shot name
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        let id = parse_id(stem)?;
        Some(Self {
            id,
            path: path.to_path_buf(),
        })
    }

    /// Full filename for a shot, e.g. `IMG_0007.jpg`
    pub fn file_name(id: u32, extension: &str) -> String {
        format!("{}.{}", id_string(id), extension)
    }
}

/// `IMG_` followed by the id zero-padded to four digits
pub fn id_string(id: u32) -> String {
    format!("{}{:04}", SHOT_PREFIX, id)
}

/// Parse the id out of a filename stem such as `IMG_0042`
///
/// The stem is split at the last `_`; everything up to and including it must
/// be exactly `IMG_`. Ids wider than four digits still parse.
pub fn parse_id(stem: &str) -> Option<u32> {
    let split = stem.rfind('_')? + 1;
    let (prefix, digits) = stem.split_at(split);
    if prefix != SHOT_PREFIX {
        return None;
    }
    digits.parse::<u32>().ok()
}

/// True if the path has one of the accepted image extensions
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map_or(false, |ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}
