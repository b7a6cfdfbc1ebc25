//! Static assets.
//!
//! Modules loaded with the `file` loader are copied to the output directory
//! under a content-hashed name; the module itself only exports the URL.

use super::graph::{ModuleGraph, ModuleId};
use super::loader::mime_for;
use kiln_util::hash::ContentHash;
use std::sync::Arc;

/// A module emitted as its own output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// Output file name (`{stem}.{hash8}.{ext}`).
    pub file_name: String,
    /// Module the asset was loaded from.
    pub source: ModuleId,
    /// Raw content.
    pub contents: Arc<[u8]>,
}

impl Asset {
    /// Create the asset for a module's raw bytes.
    #[must_use]
    pub fn new(id: &ModuleId, bytes: &[u8]) -> Self {
        Self {
            file_name: asset_file_name(id, &ContentHash::of(bytes)),
            source: id.clone(),
            contents: Arc::from(bytes),
        }
    }

    /// URL of the asset relative to the chunk importing it.
    #[must_use]
    pub fn url(&self) -> String {
        format!("./{}", self.file_name)
    }

    #[must_use]
    pub fn content_type(&self) -> &'static str {
        mime_for(self.source.extension().unwrap_or_default())
    }
}

/// Output file name of an asset: `{stem}.{hash8}.{ext}`.
#[must_use]
pub fn asset_file_name(id: &ModuleId, hash: &ContentHash) -> String {
    match id.extension() {
        Some(ext) => format!("{}.{}.{ext}", id.stem(), hash.short(8)),
        None => format!("{}.{}", id.stem(), hash.short(8)),
    }
}

/// Assets of every module in `graph`, ordered by file name. Modules with
/// identical content share one file name and are emitted once.
#[must_use]
pub fn collect_assets(graph: &ModuleGraph) -> Vec<Asset> {
    let mut assets: Vec<Asset> = graph
        .iter()
        .filter_map(|node| node.asset.clone())
        .collect();
    assets.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    assets.dedup_by(|a, b| a.file_name == b.file_name);
    assets
}
