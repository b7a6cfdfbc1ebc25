//! Build metadata in the esbuild metafile layout.
//!
//! ```json
//! {
//!   "inputs":  { "src/app.js": { "bytes": 120, "imports": [{ "path": "src/a.js", "kind": "import-statement" }] } },
//!   "outputs": { "dist/app.js": { "bytes": 900, "inputs": { "src/app.js": { "bytesInOutput": 160 } },
//!                                 "imports": [], "entryPoint": "src/app.js" } }
//! }
//! ```

use super::assets::collect_assets;
use super::chunks::ChunkSet;
use super::emit::EmittedChunk;
use super::graph::ModuleGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// An import edge of an input or output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaImport {
    pub path: String,
    pub kind: String,
    /// Left to the runtime; `path` is the specifier as written.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
}

/// A source module read by the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInput {
    pub bytes: usize,
    pub imports: Vec<MetaImport>,
}

/// Contribution of one input to an output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaOutputInput {
    pub bytes_in_output: usize,
}

/// A file produced by the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaOutput {
    pub bytes: usize,
    pub inputs: BTreeMap<String, MetaOutputInput>,
    pub imports: Vec<MetaImport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

/// Inputs and outputs of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metafile {
    pub inputs: BTreeMap<String, MetaInput>,
    pub outputs: BTreeMap<String, MetaOutput>,
}

impl Metafile {
    /// Describe a build. Paths are relative to `root`; output paths are
    /// prefixed with `outdir` (itself relative to `root`).
    #[must_use]
    pub fn new(
        graph: &ModuleGraph,
        chunk_set: &ChunkSet,
        emitted: &[EmittedChunk],
        root: &Path,
        outdir: &str,
    ) -> Self {
        let inputs = graph
            .iter()
            .map(|node| {
                let imports = node
                    .edges()
                    .map(|edge| MetaImport {
                        path: edge.to.relative_key(root),
                        kind: edge.kind.as_str().to_string(),
                        external: false,
                    })
                    .chain(node.externals.iter().map(|import| MetaImport {
                        path: import.specifier.clone(),
                        kind: import.kind.as_str().to_string(),
                        external: true,
                    }))
                    .collect();
                (
                    node.id.relative_key(root),
                    MetaInput {
                        bytes: node.raw_len,
                        imports,
                    },
                )
            })
            .collect();

        let output_path = |file: &str| {
            if outdir.is_empty() || outdir == "." {
                file.to_string()
            } else {
                format!("{}/{file}", outdir.trim_end_matches('/'))
            }
        };

        let mut outputs = BTreeMap::new();
        for out in emitted {
            let chunk = chunk_set.get(&out.id);
            let mut imports: Vec<MetaImport> = Vec::new();
            if let Some(chunk) = chunk {
                imports.extend(chunk.imports.iter().map(|id| MetaImport {
                    path: output_path(&format!("{id}.js")),
                    kind: "import-statement".to_string(),
                    external: false,
                }));
                imports.extend(chunk.dynamic_imports.iter().map(|id| MetaImport {
                    path: output_path(&format!("{id}.js")),
                    kind: "dynamic-import".to_string(),
                    external: false,
                }));
            }

            outputs.insert(
                output_path(&out.file_name),
                MetaOutput {
                    bytes: out.text.len(),
                    inputs: out
                        .manifest
                        .iter()
                        .map(|m| {
                            (
                                m.id.relative_key(root),
                                MetaOutputInput {
                                    bytes_in_output: m.bytes,
                                },
                            )
                        })
                        .collect(),
                    imports,
                    entry_point: chunk
                        .and_then(|c| c.entry.as_ref())
                        .map(|id| id.relative_key(root)),
                },
            );

            if let Some(map) = &out.source_map {
                outputs.insert(
                    output_path(&out.map_file_name()),
                    MetaOutput {
                        bytes: map.to_json().len(),
                        inputs: BTreeMap::new(),
                        imports: Vec::new(),
                        entry_point: None,
                    },
                );
            }
        }

        for asset in collect_assets(graph) {
            let mut inputs = BTreeMap::new();
            inputs.insert(
                asset.source.relative_key(root),
                MetaOutputInput {
                    bytes_in_output: asset.contents.len(),
                },
            );
            outputs.insert(
                output_path(&asset.file_name),
                MetaOutput {
                    bytes: asset.contents.len(),
                    inputs,
                    imports: Vec::new(),
                    entry_point: None,
                },
            );
        }

        Self { inputs, outputs }
    }

    /// Serialize as pretty-printed JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
