//! JavaScript/TypeScript bundler.
//!
//! Bundles multiple entry points into chunk files.
//!
//! ## Architecture
//!
//! 1. **Resolution** - Resolve import specifiers to [`ModuleId`]s
//! 2. **Graph** - Load, scan and resolve modules level by level from the entries
//! 3. **Chunks** - Assign modules to entry and shared chunks
//! 4. **Emit** - Render each chunk, its source map and the module manifest
//!
//! [`Rebuilder`] wraps steps 2-4 for incremental rebuilds; the
//! [`Engine`](crate::Engine) ties everything to a configuration and storage.

pub mod codes;

mod assets;
mod builder;
mod chunks;
mod emit;
mod error;
mod graph;
mod incremental;
mod loader;
mod metafile;
mod resolve;
mod rewrite;
mod scan;
mod sourcemap;
mod transform;

pub use assets::{Asset, asset_file_name, collect_assets};
pub use builder::{CancelToken, GraphBuilder};
pub use chunks::{
    Chunk, ChunkKind, ChunkSet, EntryPoint, SplitOptions, name_entries, split,
};
pub use emit::{
    BundleFormat, EmitOptions, EmittedChunk, ModuleOutput, chunk_file_name, emit,
};
pub use error::{BuildError, EmitError, ParseError, ResolveError, ServeError};
pub use graph::{DependencyEdge, ModuleGraph, ModuleId, ModuleNode};
pub use incremental::{
    Artifact, BuildSnapshot, Invalidation, RebuildRequest, RebuildState, Rebuilder, invalidate,
};
pub use loader::{Loader, LoaderTable};
pub use metafile::{MetaImport, MetaInput, MetaOutput, MetaOutputInput, Metafile};
pub use resolve::{DEFAULT_EXTENSIONS, ResolveCache, ResolveOptions, Resolver};
pub use scan::{ImportKind, ImportParser, ImportRecord, Scanner, scan_imports};
pub use sourcemap::{SourceMap, SourceMapBuilder};
pub use transform::{TransformOptions, TransformOutput, transform_with};

/// Transform `source` using the built-in import scanner.
///
/// # Errors
/// `ParseError` when the loader or the scanner rejects the input.
pub fn transform(
    source: &str,
    options: &TransformOptions,
) -> Result<TransformOutput, ParseError> {
    transform_with(&Scanner, source, options)
}
