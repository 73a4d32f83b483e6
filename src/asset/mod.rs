/// Asset post-processing module
///
/// The reconstruction engine leaves a snapshot bundle of mesh and texture
/// files whose internal references point where the engine wrote them, not
/// where they live. This module fixes that up:
/// - Per-mesh texture reference rewriting and relocation (resolver.rs)
/// - Locating the snapshot bundle and its meshes (snapshot.rs)

pub mod resolver;
pub mod snapshot;

pub use resolver::AssetPathResolver;
pub use snapshot::resolve_snapshot;
