//! Bundle output emission.
//!
//! Writes one chunk of a [`ChunkSet`] as JavaScript. Every module becomes a
//! factory registered with the bundle runtime (`__kiln`); its `import` and
//! `export` statements are rewritten into registry calls. Module bodies keep
//! their line structure so the source map can stay line-level.

use super::chunks::{Chunk, ChunkSet};
use super::error::BuildError;
use super::graph::{ModuleGraph, ModuleId, ModuleNode};
use super::loader::js_string;
use super::rewrite::{RewriteContext, Rewritten, rewrite_module};
use super::sourcemap::{SourceMap, SourceMapBuilder};
use indexmap::IndexSet;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Output module format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleFormat {
    /// ES module; chunks import each other with `import "./x.js"`.
    #[default]
    Esm,
    /// CommonJS; the entry's exports become `module.exports`.
    Cjs,
    /// Self-executing function.
    Iife,
}

impl BundleFormat {
    /// Format name as used in configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Esm => "esm",
            Self::Cjs => "cjs",
            Self::Iife => "iife",
        }
    }
}

impl fmt::Display for BundleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BundleFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "esm" | "es" | "module" => Ok(Self::Esm),
            "cjs" | "commonjs" => Ok(Self::Cjs),
            "iife" => Ok(Self::Iife),
            _ => Err(format!("unknown format '{s}' (expected esm, cjs or iife)")),
        }
    }
}

/// Emission options.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub format: BundleFormat,
    /// Produce a V3 source map and a `sourceMappingURL` comment.
    pub sourcemap: bool,
    /// Directory that registry keys and source map paths are relative to.
    pub root: PathBuf,
}

/// Bytes a module contributed to a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleOutput {
    pub id: ModuleId,
    pub bytes: usize,
}

/// A chunk rendered to text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedChunk {
    /// Chunk id.
    pub id: String,
    /// Output file name (`<id>.js`).
    pub file_name: String,
    /// JavaScript text.
    pub text: String,
    pub source_map: Option<SourceMap>,
    /// Modules in output order with their size in the output.
    pub manifest: Vec<ModuleOutput>,
}

impl EmittedChunk {
    /// File name of the source map (`<id>.js.map`).
    #[must_use]
    pub fn map_file_name(&self) -> String {
        format!("{}.map", self.file_name)
    }
}

/// Output file name for a chunk id.
#[must_use]
pub fn chunk_file_name(id: &str) -> String {
    format!("{id}.js")
}

/// Registry shared by every module of a bundle. `host` is the
/// environment's own `require`, used for external modules.
const RUNTIME: &str = r#"  var defs = {};
  var cache = {};
  var externals = {};
  function define(id, factory) {
    if (!(id in defs)) defs[id] = factory;
  }
  function external(id, mod) {
    externals[id] = mod;
  }
  function require(id) {
    if (id in cache) return cache[id].exports;
    var factory = defs[id];
    if (!factory) {
      if (id in externals) return externals[id];
      if (host) return host(id);
      throw new Error("kiln: module not found: " + id);
    }
    var module = (cache[id] = { exports: {} });
    factory.call(module.exports, module, module.exports, require);
    return module.exports;
  }
  function bind(target, name, get) {
    Object.defineProperty(target, name, { enumerable: true, configurable: true, get: get });
  }
  function esm(exports, getters) {
    Object.defineProperty(exports, "__esModule", { value: true });
    for (var name in getters) bind(exports, name, getters[name]);
  }
  function interop(mod) {
    if (mod && (mod.__esModule || mod[Symbol.toStringTag] === "Module")) return mod;
    var ns = mod !== null && typeof mod === "object" ? Object.assign({}, mod) : {};
    ns.default = mod;
    return ns;
  }
  function reexport(exports, mod, names) {
    var keys = names ? Object.keys(names) : Object.keys(mod);
    keys.forEach(function (name) {
      if (!names && (name === "default" || name in exports)) return;
      var from = names ? names[name] : name;
      bind(exports, name, function () {
        return from === "*" ? mod : mod[from];
      });
    });
  }
  return {
    define: define,
    external: external,
    require: require,
    interop: interop,
    esm: esm,
    reexport: reexport
  };"#;

const HOST_REQUIRE: &str = r#"typeof require === "function" ? require : null"#;

/// The `__kiln` runtime declaration. A `shared` runtime lives on
/// `globalThis` so that every chunk of a split build uses one registry.
pub(crate) fn runtime_prelude(shared: bool) -> String {
    if shared {
        format!("var __kiln = globalThis.__kiln || (globalThis.__kiln = (function (host) {{\n{RUNTIME}\n}})({HOST_REQUIRE}));\n")
    } else {
        format!("var __kiln = (function (host) {{\n{RUNTIME}\n}})({HOST_REQUIRE});\n")
    }
}

/// Accumulates output text and tracks the current line.
struct Output {
    text: String,
    line: u32,
}

impl Output {
    fn new() -> Self {
        Self {
            text: String::new(),
            line: 0,
        }
    }

    fn line(&mut self, s: &str) {
        self.text.push_str(s);
        self.text.push('\n');
        self.line += 1;
    }

    fn block(&mut self, s: &str) {
        for l in s.lines() {
            self.line(l);
        }
    }
}

/// Answers rewrite queries for one module of one chunk.
struct ChunkContext<'a> {
    node: &'a ModuleNode,
    chunk: &'a Chunk,
    chunk_set: &'a ChunkSet,
    root: &'a Path,
}

impl RewriteContext for ChunkContext<'_> {
    fn module_key(&self, specifier: &str) -> Option<String> {
        self.node
            .target_of(specifier)
            .map(|id| id.relative_key(self.root))
    }

    fn dynamic_import(&self, specifier: &str) -> Option<String> {
        let target = self.node.target_of(specifier)?;
        let key = js_string(&target.relative_key(self.root));
        if self.chunk.modules.contains(target) {
            return Some(format!(
                "Promise.resolve().then(() => __kiln.interop(require({key})))"
            ));
        }
        let file = self
            .chunk_set
            .entries()
            .iter()
            .find(|entry| entry.id == *target)
            .map(|entry| entry.name.as_str())
            .or_else(|| self.chunk_set.chunks_for(target).first().map(String::as_str))
            .map(chunk_file_name)?;
        Some(format!(
            "import({}).then(() => __kiln.interop(require({key})))",
            js_string(&format!("./{file}"))
        ))
    }
}

struct RenderedModule<'a> {
    node: &'a ModuleNode,
    key: String,
    body: Rewritten,
}

/// Render `chunk` to JavaScript.
///
/// Modules appear in the chunk's order (dependencies first). The output
/// depends only on the inputs.
///
/// # Errors
/// `BuildError::ParseFailed` when a module body cannot be rewritten.
pub fn emit(
    graph: &ModuleGraph,
    chunk_set: &ChunkSet,
    chunk: &Chunk,
    options: &EmitOptions,
) -> Result<EmittedChunk, BuildError> {
    let file_name = chunk_file_name(&chunk.id);

    let rendered: Vec<RenderedModule<'_>> = chunk
        .modules
        .par_iter()
        .filter_map(|id| graph.get(id))
        .map(|node| {
            let ctx = ChunkContext {
                node,
                chunk,
                chunk_set,
                root: &options.root,
            };
            rewrite_module(&node.source, node.loader.allows_jsx(), &ctx)
                .map(|body| RenderedModule {
                    node,
                    key: node.id.relative_key(&options.root),
                    body,
                })
                .map_err(|source| BuildError::ParseFailed {
                    module: node.id.clone(),
                    source,
                })
        })
        .collect::<Result<_, BuildError>>()?;

    // ES modules cannot `require`: externals are imported up front and
    // handed to the runtime
    let externals: IndexSet<&str> = if options.format == BundleFormat::Esm {
        rendered
            .iter()
            .flat_map(|m| &m.node.externals)
            .filter(|import| !import.kind.is_dynamic())
            .map(|import| import.specifier.as_str())
            .collect()
    } else {
        IndexSet::new()
    };

    let mut out = Output::new();
    let mut map = options.sourcemap.then(SourceMapBuilder::new);
    let mut manifest = Vec::with_capacity(rendered.len());

    if options.format == BundleFormat::Iife {
        out.line("(function () {");
    }
    if options.format == BundleFormat::Esm {
        for import in &chunk.imports {
            out.line(&format!(
                "import {};",
                js_string(&format!("./{}", chunk_file_name(import)))
            ));
        }
        for (idx, specifier) in externals.iter().enumerate() {
            out.line(&format!(
                "import * as __kiln_ext{idx} from {};",
                js_string(specifier)
            ));
        }
    }
    out.block(&runtime_prelude(options.format == BundleFormat::Esm));
    for (idx, specifier) in externals.iter().enumerate() {
        out.line(&format!(
            "__kiln.external({}, __kiln_ext{idx});",
            js_string(specifier)
        ));
    }

    for module in &rendered {
        let start = out.text.len();
        let source_idx = map
            .as_mut()
            .map(|m| m.add_source(&module.key, &module.node.source));

        out.line(&format!(
            "__kiln.define({}, function (module, exports, require) {{",
            js_string(&module.key)
        ));
        if let Some(header) = &module.body.header {
            out.line(&format!("  {header}"));
        }
        for (idx, line) in module.body.lines.iter().enumerate() {
            if let (Some(map), Some(source_idx)) = (map.as_mut(), source_idx) {
                let source_line = u32::try_from(idx).unwrap_or(u32::MAX);
                map.add_line_mapping(out.line, source_idx, source_line);
            }
            if line.is_empty() {
                out.line("");
            } else {
                out.line(&format!("  {line}"));
            }
        }
        out.line("});");

        manifest.push(ModuleOutput {
            id: module.node.id.clone(),
            bytes: out.text.len() - start,
        });
    }

    if let Some(entry) = &chunk.entry {
        let key = js_string(&entry.relative_key(&options.root));
        match options.format {
            BundleFormat::Esm => out.line(&format!("export default __kiln.require({key});")),
            BundleFormat::Cjs => out.line(&format!("module.exports = __kiln.require({key});")),
            BundleFormat::Iife => out.line(&format!("__kiln.require({key});")),
        }
    }
    if options.format == BundleFormat::Iife {
        out.line("})();");
    }

    let source_map = map.map(|m| m.build(&file_name));
    if source_map.is_some() {
        out.line(&format!("//# sourceMappingURL={file_name}.map"));
    }

    Ok(EmittedChunk {
        id: chunk.id.clone(),
        file_name,
        text: out.text,
        source_map,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::chunks::{EntryPoint, SplitOptions, split};
    use crate::bundler::graph::tests::graph;
    use crate::bundler::loader::Loader;
    use crate::bundler::scan::{ImportKind, ImportRecord};
    use kiln_util::hash::ContentHash;
    use std::sync::Arc;

    fn module(path: &str, source: &str, imports: &[(&str, &str, ImportKind)]) -> Arc<ModuleNode> {
        Arc::new(ModuleNode {
            id: ModuleId::from_path(path),
            loader: Loader::Js,
            source: source.to_string(),
            hash: ContentHash::of(source.as_bytes()),
            raw_len: source.len(),
            imports: imports
                .iter()
                .map(|(spec, _, kind)| ImportRecord {
                    specifier: (*spec).to_string(),
                    kind: *kind,
                    line: 1,
                })
                .collect(),
            resolved: imports
                .iter()
                .map(|(_, target, _)| ModuleId::from_path(target))
                .collect(),
            externals: Vec::new(),
            asset: None,
        })
    }

    fn options(format: BundleFormat, sourcemap: bool) -> EmitOptions {
        EmitOptions {
            format,
            sourcemap,
            root: PathBuf::from("/proj"),
        }
    }

    fn app_graph() -> ModuleGraph {
        graph(vec![
            module(
                "/proj/src/app.js",
                "import { greet } from './greet';\nconsole.log(greet('kiln'));\n",
                &[("./greet", "/proj/src/greet.js", ImportKind::Static)],
            ),
            module(
                "/proj/src/greet.js",
                "export function greet(name) {\n  return `hi ${name}`;\n}\n",
                &[],
            ),
        ])
    }

    fn entries(paths: &[&str]) -> Vec<EntryPoint> {
        paths
            .iter()
            .map(|p| {
                let id = ModuleId::from_path(p);
                EntryPoint::new(id.stem().to_string(), id)
            })
            .collect()
    }

    fn emit_entry(graph: &ModuleGraph, format: BundleFormat, sourcemap: bool) -> EmittedChunk {
        let set = split(graph, &entries(&["/proj/src/app.js"]), SplitOptions::default());
        emit(graph, &set, &set.chunks()[0], &options(format, sourcemap)).unwrap()
    }

    #[test]
    fn test_esm_chunk_layout() {
        let out = emit_entry(&app_graph(), BundleFormat::Esm, false);
        assert_eq!(out.file_name, "app.js");

        let text = &out.text;
        assert!(text.starts_with("var __kiln = globalThis.__kiln"));
        let greet = text.find("__kiln.define(\"src/greet.js\"").unwrap();
        let app = text.find("__kiln.define(\"src/app.js\"").unwrap();
        assert!(greet < app, "dependencies come first");
        assert!(text.contains(
            "  const __kiln_m0 = __kiln.interop(require(\"src/greet.js\"));"
        ));
        assert!(text.contains("  __kiln.esm(exports, { greet: () => greet });"));
        assert!(text.ends_with("export default __kiln.require(\"src/app.js\");\n"));
        assert!(!text.contains("sourceMappingURL"));

        assert_eq!(out.manifest.len(), 2);
        assert_eq!(out.manifest[0].id, ModuleId::from_path("/proj/src/greet.js"));
        assert!(out.manifest.iter().all(|m| m.bytes > 0));
    }

    #[test]
    fn test_cjs_and_iife_tails() {
        let cjs = emit_entry(&app_graph(), BundleFormat::Cjs, false);
        assert!(cjs.text.starts_with("var __kiln = (function (host) {"));
        assert!(cjs.text.ends_with("module.exports = __kiln.require(\"src/app.js\");\n"));

        let iife = emit_entry(&app_graph(), BundleFormat::Iife, false);
        assert!(iife.text.starts_with("(function () {\nvar __kiln = (function (host) {"));
        assert!(iife.text.ends_with("__kiln.require(\"src/app.js\");\n})();\n"));
        assert!(!iife.text.contains("export default"));
    }

    #[test]
    fn test_source_map_lines() {
        let out = emit_entry(&app_graph(), BundleFormat::Esm, true);
        let map = out.source_map.as_ref().unwrap();
        assert_eq!(map.file, "app.js");
        assert_eq!(map.sources, vec!["src/greet.js", "src/app.js"]);
        assert!(map.sources_content[1].starts_with("import { greet }"));
        assert!(out.text.ends_with("//# sourceMappingURL=app.js.map\n"));

        // Every source line is mapped, on the output line holding its code
        let segments: Vec<&str> = map.mappings.split(';').collect();
        assert_eq!(segments.iter().filter(|s| !s.is_empty()).count(), 5);
        let log_line = out
            .text
            .lines()
            .position(|l| l.trim_start().starts_with("console.log(__kiln_m0.greet"))
            .unwrap();
        assert!(!segments[log_line].is_empty());
        assert!(segments[log_line - 2].is_empty(), "export header is unmapped");
        assert!(segments[log_line - 3].is_empty(), "define line is unmapped");
    }

    #[test]
    fn test_emit_is_deterministic() {
        let g = app_graph();
        let a = emit_entry(&g, BundleFormat::Esm, true);
        let b = emit_entry(&g, BundleFormat::Esm, true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_shared_chunk_is_imported() {
        let g = graph(vec![
            module(
                "/proj/a.js",
                "import './shared';\n",
                &[("./shared", "/proj/shared.js", ImportKind::Static)],
            ),
            module(
                "/proj/b.js",
                "import './shared';\n",
                &[("./shared", "/proj/shared.js", ImportKind::Static)],
            ),
            module("/proj/shared.js", "export const x = 1;\n", &[]),
        ]);
        let options_split = SplitOptions {
            splitting: true,
            min_shared_chunk_bytes: None,
        };
        let set = split(&g, &entries(&["/proj/a.js", "/proj/b.js"]), options_split);
        let shared = &set.chunks()[2];
        let opts = options(BundleFormat::Esm, false);

        let a = emit(&g, &set, &set.chunks()[0], &opts).unwrap();
        assert!(a.text.starts_with(&format!("import \"./{}.js\";\n", shared.id)));
        assert!(!a.text.contains("export const x"));

        let s = emit(&g, &set, shared, &opts).unwrap();
        assert!(s.text.contains("__kiln.define(\"shared.js\""));
        assert!(!s.text.contains("export default __kiln.require"));
    }

    #[test]
    fn test_dynamic_import_split_or_inlined() {
        let g = graph(vec![
            module(
                "/proj/main.js",
                "const page = import('./page');\n",
                &[("./page", "/proj/page.js", ImportKind::Dynamic)],
            ),
            module("/proj/page.js", "export default 1;\n", &[]),
        ]);
        let main = entries(&["/proj/main.js"]);
        let opts = options(BundleFormat::Esm, false);

        let set = split(&g, &main, SplitOptions::default());
        let inlined = emit(&g, &set, &set.chunks()[0], &opts).unwrap();
        assert!(inlined.text.contains(
            "const page = Promise.resolve().then(() => __kiln.interop(require(\"page.js\")));"
        ));

        let set = split(
            &g,
            &main,
            SplitOptions {
                splitting: true,
                min_shared_chunk_bytes: None,
            },
        );
        let split_out = emit(&g, &set, &set.chunks()[0], &opts).unwrap();
        assert!(split_out.text.contains(
            "const page = import(\"./page.js\").then(() => __kiln.interop(require(\"page.js\")));"
        ));
        assert!(!split_out.text.contains("__kiln.define(\"page.js\""));
    }

    #[test]
    fn test_import_cycle_reads_through_module_variables() {
        let g = graph(vec![
            module(
                "/proj/a.js",
                "import { b } from './b';\nexport const a = 1;\nexport function useB() {\n  return b;\n}\n",
                &[("./b", "/proj/b.js", ImportKind::Static)],
            ),
            module(
                "/proj/b.js",
                "import { a } from './a';\nexport const b = () => a;\n",
                &[("./a", "/proj/a.js", ImportKind::Static)],
            ),
        ]);
        let set = split(&g, &entries(&["/proj/a.js"]), SplitOptions::default());
        let out = emit(&g, &set, &set.chunks()[0], &options(BundleFormat::Cjs, false)).unwrap();

        // Neither module copies the other's bindings at require time
        assert!(!out.text.contains("const { a }"));
        assert!(!out.text.contains("const { b }"));
        assert!(out.text.contains("  return __kiln_m0.b;"));
        assert!(out.text.contains("  const b = () => __kiln_m0.a;"));
        assert!(out.text.contains("  __kiln.esm(exports, { a: () => a, useB: () => useB });"));
    }

    #[test]
    fn test_unlexable_module_fails_emit() {
        let mut node = (*module("/proj/app.jsx", "const a = <div>{x</div>;\n", &[])).clone();
        node.loader = Loader::Jsx;
        let g = graph(vec![Arc::new(node)]);
        let set = split(&g, &entries(&["/proj/app.jsx"]), SplitOptions::default());
        let err = emit(&g, &set, &set.chunks()[0], &options(BundleFormat::Esm, false)).unwrap_err();
        assert!(matches!(
            err,
            BuildError::ParseFailed { ref module, .. } if module.as_str() == "/proj/app.jsx"
        ));
    }

    #[test]
    fn test_externals_are_left_to_the_host() {
        let mut node = (*module(
            "/proj/app.js",
            "import React from 'react';\nconst fs = require('node:fs');\nconst lazy = import('lodash');\n",
            &[],
        ))
        .clone();
        node.externals = vec![
            ImportRecord {
                specifier: "react".to_string(),
                kind: ImportKind::Static,
                line: 1,
            },
            ImportRecord {
                specifier: "node:fs".to_string(),
                kind: ImportKind::Require,
                line: 2,
            },
            ImportRecord {
                specifier: "lodash".to_string(),
                kind: ImportKind::Dynamic,
                line: 3,
            },
        ];
        let g = graph(vec![Arc::new(node)]);
        let set = split(&g, &entries(&["/proj/app.js"]), SplitOptions::default());

        let esm = emit(&g, &set, &set.chunks()[0], &options(BundleFormat::Esm, false)).unwrap();
        assert!(esm.text.starts_with(
            "import * as __kiln_ext0 from \"react\";\nimport * as __kiln_ext1 from \"node:fs\";\n"
        ));
        assert!(esm.text.contains("__kiln.external(\"react\", __kiln_ext0);\n"));
        assert!(!esm.text.contains("from \"lodash\""));
        assert!(esm.text.contains("  const __kiln_m0 = __kiln.interop(require(\"react\"));"));
        assert!(esm.text.contains("  const fs = require('node:fs');"));
        assert!(esm.text.contains("  const lazy = import('lodash');"));

        let cjs = emit(&g, &set, &set.chunks()[0], &options(BundleFormat::Cjs, false)).unwrap();
        assert!(!cjs.text.contains("import * as"));
        assert!(cjs.text.contains("if (host) return host(id);"));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("ESM".parse::<BundleFormat>(), Ok(BundleFormat::Esm));
        assert_eq!("commonjs".parse::<BundleFormat>(), Ok(BundleFormat::Cjs));
        assert_eq!("iife".parse::<BundleFormat>(), Ok(BundleFormat::Iife));
        assert!("umd".parse::<BundleFormat>().is_err());
    }
}
