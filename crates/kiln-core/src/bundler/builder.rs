//! Graph construction.
//!
//! Breadth-first traversal from the entry modules. Each level is loaded,
//! parsed and resolved in parallel; the visited set and the graph are only
//! touched by the coordinating loop between levels.

use super::assets::Asset;
use super::error::BuildError;
use super::graph::{ModuleGraph, ModuleId, ModuleNode};
use super::loader::LoaderTable;
use super::resolve::{ResolveCache, Resolver};
use super::scan::ImportParser;
use crate::storage::Storage;
use kiln_util::hash::ContentHash;
use rayon::prelude::*;
use rustc_hash::FxHashSet as HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cooperative cancellation flag shared between a build and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The build stops at its next level boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a node in the new graph came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Carried over from the prior graph without reading storage.
    Carried,
    /// Re-read, but the content hash matched the prior node.
    Reused,
    /// Loaded, parsed and resolved from scratch.
    Parsed,
}

/// Builds a [`ModuleGraph`] from entry modules.
pub struct GraphBuilder<'a> {
    resolver: &'a Resolver,
    cache: &'a ResolveCache,
    storage: &'a dyn Storage,
    parser: &'a dyn ImportParser,
    loaders: &'a LoaderTable,
    cancel: Option<&'a CancelToken>,
}

impl<'a> GraphBuilder<'a> {
    /// Create a builder over the given collaborators.
    #[must_use]
    pub fn new(
        resolver: &'a Resolver,
        cache: &'a ResolveCache,
        storage: &'a dyn Storage,
        parser: &'a dyn ImportParser,
        loaders: &'a LoaderTable,
    ) -> Self {
        Self {
            resolver,
            cache,
            storage,
            parser,
            loaders,
            cancel: None,
        }
    }

    /// Stop at the next level boundary once `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Build the graph reachable from `entries`.
    ///
    /// Every module is re-read. When `prior` holds a node whose content hash
    /// matches the fresh bytes, that node is reused by reference.
    ///
    /// # Errors
    /// The first failure in breadth-first order; no partial graph is
    /// returned.
    pub fn build(
        &self,
        entries: &[ModuleId],
        prior: Option<&ModuleGraph>,
    ) -> Result<ModuleGraph, BuildError> {
        self.traverse(entries, prior, None)
    }

    /// Rebuild after a change. Prior nodes outside `invalidated` are carried
    /// over without touching storage; invalidated modules (and any module
    /// new to the graph) are loaded afresh.
    ///
    /// # Errors
    /// Same as [`GraphBuilder::build`].
    pub fn rebuild(
        &self,
        entries: &[ModuleId],
        prior: &ModuleGraph,
        invalidated: &HashSet<ModuleId>,
    ) -> Result<ModuleGraph, BuildError> {
        self.traverse(entries, Some(prior), Some(invalidated))
    }

    fn traverse(
        &self,
        entries: &[ModuleId],
        prior: Option<&ModuleGraph>,
        invalidated: Option<&HashSet<ModuleId>>,
    ) -> Result<ModuleGraph, BuildError> {
        let mut graph = ModuleGraph::new();
        let mut visited: HashSet<ModuleId> = HashSet::default();
        let mut level: Vec<ModuleId> = entries
            .iter()
            .filter(|id| visited.insert((*id).clone()))
            .cloned()
            .collect();

        let mut depth = 0usize;
        let mut counts = [0usize; 3];

        while !level.is_empty() {
            self.check_cancelled()?;
            debug!(depth, modules = level.len(), "loading graph level");

            let results: Vec<Result<(Arc<ModuleNode>, Origin), BuildError>> = level
                .par_iter()
                .map(|id| self.process(id, prior, invalidated))
                .collect();

            let mut next = Vec::new();
            for result in results {
                let (node, origin) = result?;
                counts[origin as usize] += 1;
                for target in &node.resolved {
                    if visited.insert(target.clone()) {
                        next.push(target.clone());
                    }
                }
                graph.insert(node);
            }

            level = next;
            depth += 1;
        }

        self.check_cancelled()?;
        debug!(
            modules = graph.len(),
            carried = counts[Origin::Carried as usize],
            reused = counts[Origin::Reused as usize],
            parsed = counts[Origin::Parsed as usize],
            "module graph built"
        );
        Ok(graph)
    }

    fn check_cancelled(&self) -> Result<(), BuildError> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(BuildError::Cancelled),
            _ => Ok(()),
        }
    }

    fn process(
        &self,
        id: &ModuleId,
        prior: Option<&ModuleGraph>,
        invalidated: Option<&HashSet<ModuleId>>,
    ) -> Result<(Arc<ModuleNode>, Origin), BuildError> {
        let prior_node = prior.and_then(|graph| graph.get(id));

        if let (Some(node), Some(invalidated)) = (prior_node, invalidated) {
            if !invalidated.contains(id) {
                return Ok((Arc::clone(node), Origin::Carried));
            }
        }

        let bytes = self.storage.read(id.path()).map_err(|source| BuildError::Io {
            module: id.clone(),
            source,
        })?;
        let hash = ContentHash::of(&bytes);

        if let Some(node) = prior_node {
            if node.hash == hash {
                return Ok((Arc::clone(node), Origin::Reused));
            }
        }

        let parse_failed = |source| BuildError::ParseFailed {
            module: id.clone(),
            source,
        };
        let loader = self.loaders.loader_for(id).map_err(parse_failed)?;
        let source = loader.load(id, &bytes).map_err(parse_failed)?;
        let (externals, imports): (Vec<_>, Vec<_>) = self
            .parser
            .parse(id, loader, &source)
            .map_err(parse_failed)?
            .into_iter()
            .partition(|import| self.resolver.is_external(&import.specifier));

        let resolved = imports
            .iter()
            .map(|import| {
                self.resolver
                    .resolve(self.cache, &import.specifier, Some(id))
                    .map_err(|source| BuildError::Resolve {
                        importer: Some(id.clone()),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let node = ModuleNode {
            id: id.clone(),
            loader,
            source,
            hash,
            raw_len: bytes.len(),
            imports,
            resolved,
            externals,
            asset: loader.emits_asset().then(|| Asset::new(id, &bytes)),
        };
        Ok((Arc::new(node), Origin::Parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::error::{ParseError, ResolveError};
    use crate::bundler::loader::Loader;
    use crate::bundler::resolve::ResolveOptions;
    use crate::bundler::scan::Scanner;
    use crate::storage::MemoryStorage;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        resolver: Resolver,
        cache: ResolveCache,
        loaders: LoaderTable,
    }

    impl Fixture {
        fn new(files: &[(&str, &str)]) -> Self {
            Self::with_options(files, ResolveOptions::default())
        }

        fn with_options(files: &[(&str, &str)], options: ResolveOptions) -> Self {
            let storage = Arc::new(MemoryStorage::with_files(files.iter().copied()));
            let resolver = Resolver::new(options, storage.clone());
            Self {
                storage,
                resolver,
                cache: ResolveCache::new(),
                loaders: LoaderTable::new(),
            }
        }

        fn builder(&self) -> GraphBuilder<'_> {
            GraphBuilder::new(
                &self.resolver,
                &self.cache,
                self.storage.as_ref(),
                &Scanner,
                &self.loaders,
            )
        }
    }

    fn ids(paths: &[&str]) -> Vec<ModuleId> {
        paths.iter().map(ModuleId::from_path).collect()
    }

    #[test]
    fn test_build_linear_graph() {
        let fx = Fixture::new(&[
            ("/src/a.js", "import { b } from './b';\nexport const a = b;\n"),
            ("/src/b.js", "export { c as b } from './c';\n"),
            ("/src/c.js", "export const c = 1;\n"),
        ]);

        let graph = fx.builder().build(&ids(&["/src/a.js"]), None).unwrap();

        assert_eq!(graph.len(), 3);
        assert!(graph.dangling_edges().is_empty());
        let order: Vec<&str> = graph.ids().map(ModuleId::as_str).collect();
        assert_eq!(order, vec!["/src/a.js", "/src/b.js", "/src/c.js"]);
        let a = graph.get(&ModuleId::from_path("/src/a.js")).unwrap();
        assert_eq!(a.target_of("./b").map(ModuleId::as_str), Some("/src/b.js"));
    }

    #[test]
    fn test_build_cycle_terminates() {
        let fx = Fixture::new(&[
            ("/src/a.js", "import './b';\n"),
            ("/src/b.js", "import './a';\n"),
        ]);

        let graph = fx.builder().build(&ids(&["/src/a.js"]), None).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edges().len(), 2);
    }

    #[test]
    fn test_build_follows_dynamic_imports() {
        let fx = Fixture::new(&[
            ("/src/a.js", "const m = () => import('./lazy');\n"),
            ("/src/lazy.js", "export default 1;\n"),
        ]);

        let graph = fx.builder().build(&ids(&["/src/a.js"]), None).unwrap();
        let a = graph.get(&ModuleId::from_path("/src/a.js")).unwrap();
        assert_eq!(a.dynamic_dependencies().count(), 1);
        assert!(graph.contains(&ModuleId::from_path("/src/lazy.js")));
    }

    #[test]
    fn test_build_data_modules() {
        let fx = Fixture::new(&[
            ("/src/a.js", "import data from './data.json';\n"),
            ("/src/data.json", "{\"n\": 1}"),
        ]);

        let graph = fx.builder().build(&ids(&["/src/a.js"]), None).unwrap();
        let data = graph.get(&ModuleId::from_path("/src/data.json")).unwrap();
        assert_eq!(data.source, "export default {\"n\":1};\n");
        assert!(data.imports.is_empty());
    }

    #[test]
    fn test_parse_failure_names_module() {
        let fx = Fixture::new(&[
            ("/src/a.js", "import './bad';\n"),
            ("/src/bad.js", "function broken() {\n"),
        ]);

        let err = fx.builder().build(&ids(&["/src/a.js"]), None).unwrap_err();
        match err {
            BuildError::ParseFailed { module, source } => {
                assert_eq!(module.as_str(), "/src/bad.js");
                assert!(matches!(source, ParseError::SyntaxInvalid { line: 1, .. }));
            }
            other => panic!("expected ParseFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_jsx_syntax_error_fails_build() {
        let fx = Fixture::new(&[
            ("/src/index.jsx", "import './bad.jsx';\nexport const App = () => <div />;\n"),
            ("/src/bad.jsx", "function broken() {\n  return (1;\n"),
        ]);

        let err = fx.builder().build(&ids(&["/src/index.jsx"]), None).unwrap_err();
        match err {
            BuildError::ParseFailed { module, source } => {
                assert_eq!(module.as_str(), "/src/bad.jsx");
                assert!(matches!(source, ParseError::SyntaxInvalid { line: 2, .. }));
            }
            other => panic!("expected ParseFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_external_imports_are_not_resolved() {
        let fx = Fixture::with_options(
            &[
                (
                    "/src/a.js",
                    "import React from 'react';\nimport { b } from './b';\nconst fs = require('node:fs');\n",
                ),
                ("/src/b.js", "export const b = 1;\n"),
            ],
            ResolveOptions {
                external: vec!["react".to_string(), "node:*".to_string()],
                ..ResolveOptions::default()
            },
        );

        let graph = fx.builder().build(&ids(&["/src/a.js"]), None).unwrap();
        assert_eq!(graph.len(), 2);
        let a = graph.get(&ModuleId::from_path("/src/a.js")).unwrap();
        let externals: Vec<&str> = a.externals.iter().map(|i| i.specifier.as_str()).collect();
        assert_eq!(externals, vec!["react", "node:fs"]);
        assert_eq!(a.imports.len(), 1);
        assert_eq!(a.resolved, ids(&["/src/b.js"]));
    }

    #[test]
    fn test_file_loader_attaches_asset() {
        let mut fx = Fixture::new(&[
            ("/src/a.js", "import logo from './logo.png';\n"),
            ("/src/logo.png", "PNG"),
        ]);
        fx.loaders = LoaderTable::new().with_override("png", Loader::File);

        let graph = fx.builder().build(&ids(&["/src/a.js"]), None).unwrap();
        let logo = graph.get(&ModuleId::from_path("/src/logo.png")).unwrap();
        let asset = logo.asset.as_ref().unwrap();
        assert_eq!(asset.contents.as_ref(), b"PNG");
        assert_eq!(logo.source, format!("export default \"{}\";\n", asset.url()));
        assert!(graph.get(&ModuleId::from_path("/src/a.js")).unwrap().asset.is_none());
    }

    #[test]
    fn test_resolve_failure_names_importer() {
        let fx = Fixture::new(&[("/src/a.js", "import './missing';\n")]);

        let err = fx.builder().build(&ids(&["/src/a.js"]), None).unwrap_err();
        match err {
            BuildError::Resolve { importer, source } => {
                assert_eq!(importer.unwrap().as_str(), "/src/a.js");
                assert!(matches!(source, ResolveError::NotFound { .. }));
            }
            other => panic!("expected Resolve, got {other:?}"),
        }
    }

    #[test]
    fn test_unreadable_entry_is_io_error() {
        let fx = Fixture::new(&[]);
        let err = fx.builder().build(&ids(&["/src/gone.js"]), None).unwrap_err();
        assert!(matches!(err, BuildError::Io { .. }));
    }

    #[test]
    fn test_build_reuses_unchanged_nodes_by_hash() {
        let fx = Fixture::new(&[
            ("/src/a.js", "import './b';\n"),
            ("/src/b.js", "export const b = 1;\n"),
        ]);
        let entries = ids(&["/src/a.js"]);
        let first = fx.builder().build(&entries, None).unwrap();

        fx.storage.set("/src/b.js", "export const b = 2;\n");
        let second = fx.builder().build(&entries, Some(&first)).unwrap();

        let a = ModuleId::from_path("/src/a.js");
        let b = ModuleId::from_path("/src/b.js");
        assert!(Arc::ptr_eq(first.get(&a).unwrap(), second.get(&a).unwrap()));
        assert!(!Arc::ptr_eq(first.get(&b).unwrap(), second.get(&b).unwrap()));
    }

    #[test]
    fn test_rebuild_carries_over_without_reading() {
        let fx = Fixture::new(&[
            ("/src/a.js", "import './b';\nimport './c';\n"),
            ("/src/b.js", "export const b = 1;\n"),
            ("/src/c.js", "export const c = 1;\n"),
        ]);
        let entries = ids(&["/src/a.js"]);
        let first = fx.builder().build(&entries, None).unwrap();
        assert_eq!(fx.storage.read_count("/src/c.js"), 1);

        fx.storage.set("/src/b.js", "import './d';\n");
        fx.storage.set("/src/d.js", "export default 4;\n");
        let invalidated: HashSet<ModuleId> = ids(&["/src/a.js", "/src/b.js"]).into_iter().collect();
        let second = fx
            .builder()
            .rebuild(&entries, &first, &invalidated)
            .unwrap();

        let c = ModuleId::from_path("/src/c.js");
        assert!(Arc::ptr_eq(first.get(&c).unwrap(), second.get(&c).unwrap()));
        assert_eq!(fx.storage.read_count("/src/c.js"), 1);
        assert!(second.contains(&ModuleId::from_path("/src/d.js")));
        assert_eq!(second.len(), 4);
    }

    #[test]
    fn test_cancelled_build_returns_no_graph() {
        let fx = Fixture::new(&[("/src/a.js", "export {};\n")]);
        let token = CancelToken::new();
        token.cancel();

        let err = fx
            .builder()
            .with_cancel(&token)
            .build(&ids(&["/src/a.js"]), None)
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
    }
}
