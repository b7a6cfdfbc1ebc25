//! Module dependency graph.
//!
//! Nodes are keyed by [`ModuleId`] and stored behind `Arc` so that an
//! unchanged node can be shared verbatim between successive snapshots.

use super::assets::Asset;
use super::loader::Loader;
use super::scan::{ImportKind, ImportRecord};
use indexmap::IndexMap;
use kiln_util::hash::ContentHash;
use kiln_util::path::{display_relative, normalize};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Canonical identity of a source unit: normalized absolute path plus an
/// optional query variant (`/src/icon.svg?raw`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId {
    key: Arc<str>,
    path_len: usize,
}

impl ModuleId {
    /// Create an id from a path and optional query. The path is lexically
    /// normalized; callers are expected to pass absolute paths.
    #[must_use]
    pub fn new(path: &Path, query: Option<&str>) -> Self {
        let path = normalize(path).to_string_lossy().into_owned();
        let path_len = path.len();
        let key = match query {
            Some(q) if !q.is_empty() => format!("{path}?{q}"),
            _ => path,
        };
        Self {
            key: key.into(),
            path_len,
        }
    }

    /// Create an id for a plain path with no query.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::new(path.as_ref(), None)
    }

    /// Full key, including the query suffix.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Filesystem path of the module.
    #[must_use]
    pub fn path(&self) -> &Path {
        Path::new(&self.key[..self.path_len])
    }

    /// Query variant, without the leading `?`.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.key.get(self.path_len + 1..)
    }

    /// File extension of the path, without the dot.
    #[must_use]
    pub fn extension(&self) -> Option<&str> {
        self.path().extension().and_then(|e| e.to_str())
    }

    /// File stem of the path.
    #[must_use]
    pub fn stem(&self) -> &str {
        self.path()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("module")
    }

    /// Stable, machine-independent key relative to `root` (forward slashes,
    /// query preserved). Used as the registry key in emitted code.
    #[must_use]
    pub fn relative_key(&self, root: &Path) -> String {
        let mut key = display_relative(self.path(), root);
        if let Some(query) = self.query() {
            key.push('?');
            key.push_str(query);
        }
        key
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({})", self.key)
    }
}

/// A loaded, scanned and resolved module.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    /// Identity of this module.
    pub id: ModuleId,
    /// Loader that produced `source`.
    pub loader: Loader,
    /// JavaScript source produced by the loader.
    pub source: String,
    /// BLAKE3 hash of the raw bytes read from storage.
    pub hash: ContentHash,
    /// Size of the raw bytes read from storage.
    pub raw_len: usize,
    /// Import records in first-appearance order.
    pub imports: Vec<ImportRecord>,
    /// Resolved target of each import, parallel to `imports`.
    pub resolved: Vec<ModuleId>,
    /// Imports left to the runtime, in first-appearance order.
    pub externals: Vec<ImportRecord>,
    /// Output file for `file`-loaded modules.
    pub asset: Option<Asset>,
}

impl ModuleNode {
    /// Resolved target for an import specifier.
    #[must_use]
    pub fn target_of(&self, specifier: &str) -> Option<&ModuleId> {
        self.imports
            .iter()
            .position(|import| import.specifier == specifier)
            .map(|idx| &self.resolved[idx])
    }

    /// Outgoing edges of this node.
    pub fn edges(&self) -> impl Iterator<Item = DependencyEdge> + '_ {
        self.imports
            .iter()
            .zip(&self.resolved)
            .map(|(import, target)| DependencyEdge {
                from: self.id.clone(),
                to: target.clone(),
                kind: import.kind,
            })
    }

    /// Targets of static (non-`import()`) imports.
    pub fn static_dependencies(&self) -> impl Iterator<Item = &ModuleId> {
        self.imports
            .iter()
            .zip(&self.resolved)
            .filter(|(import, _)| !import.kind.is_dynamic())
            .map(|(_, target)| target)
    }

    /// Targets of dynamic `import()` expressions.
    pub fn dynamic_dependencies(&self) -> impl Iterator<Item = &ModuleId> {
        self.imports
            .iter()
            .zip(&self.resolved)
            .filter(|(import, _)| import.kind.is_dynamic())
            .map(|(_, target)| target)
    }
}

/// Importer → imported relation, derived from node import lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: ModuleId,
    pub to: ModuleId,
    pub kind: ImportKind,
}

/// The module dependency graph.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    /// Nodes in discovery order.
    nodes: IndexMap<ModuleId, Arc<ModuleNode>>,
}

impl ModuleGraph {
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, replacing any node with the same id.
    pub fn insert(&mut self, node: Arc<ModuleNode>) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Get a node by id.
    #[must_use]
    pub fn get(&self, id: &ModuleId) -> Option<&Arc<ModuleNode>> {
        self.nodes.get(id)
    }

    /// Whether the graph contains `id`.
    #[must_use]
    pub fn contains(&self, id: &ModuleId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of modules in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if graph is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over nodes in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModuleNode>> {
        self.nodes.values()
    }

    /// Iterate over module ids in discovery order.
    pub fn ids(&self) -> impl Iterator<Item = &ModuleId> {
        self.nodes.keys()
    }

    /// Find a module by filesystem path, ignoring query variants.
    pub fn ids_for_path<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a ModuleId> + 'a {
        let path = normalize(path);
        self.nodes.keys().filter(move |id| id.path() == path)
    }

    /// All edges in the graph.
    #[must_use]
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.nodes.values().flat_map(|node| node.edges()).collect()
    }

    /// Edges whose target is not a node of this graph. Always empty for
    /// graphs produced by the builder.
    #[must_use]
    pub fn dangling_edges(&self) -> Vec<DependencyEdge> {
        self.edges()
            .into_iter()
            .filter(|edge| !self.nodes.contains_key(&edge.to))
            .collect()
    }

    /// Reverse adjacency: module → modules importing it.
    #[must_use]
    pub fn importers(&self) -> HashMap<ModuleId, Vec<ModuleId>> {
        let mut reverse: HashMap<ModuleId, Vec<ModuleId>> = HashMap::default();
        for node in self.nodes.values() {
            for target in &node.resolved {
                let importers = reverse.entry(target.clone()).or_default();
                if !importers.contains(&node.id) {
                    importers.push(node.id.clone());
                }
            }
        }
        reverse
    }

    /// The given modules plus every module that transitively imports one of
    /// them. Seeds not present in the graph are ignored.
    #[must_use]
    pub fn ancestors_closure<'a>(
        &self,
        seeds: impl IntoIterator<Item = &'a ModuleId>,
    ) -> HashSet<ModuleId> {
        let reverse = self.importers();
        let mut closure = HashSet::default();
        let mut stack: Vec<ModuleId> = seeds
            .into_iter()
            .filter(|id| self.contains(id))
            .cloned()
            .collect();

        while let Some(id) = stack.pop() {
            if !closure.insert(id.clone()) {
                continue;
            }
            if let Some(importers) = reverse.get(&id) {
                stack.extend(importers.iter().filter(|i| !closure.contains(*i)).cloned());
            }
        }

        closure
    }

    /// Modules reachable from `start` (inclusive). Dynamic imports are only
    /// followed when `follow_dynamic` is set.
    #[must_use]
    pub fn reachable_from(&self, start: &ModuleId, follow_dynamic: bool) -> HashSet<ModuleId> {
        let mut seen = HashSet::default();
        let mut stack = vec![start.clone()];

        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            for (import, target) in node.imports.iter().zip(&node.resolved) {
                if (follow_dynamic || !import.kind.is_dynamic()) && !seen.contains(target) {
                    stack.push(target.clone());
                }
            }
        }

        seen
    }

    /// Order `members` so that dependencies come before dependents.
    ///
    /// Depth-first post-order; roots and siblings are visited in `ModuleId`
    /// order so the result is deterministic. Cycles are broken at the first
    /// back edge, and edges leaving `members` are ignored.
    #[must_use]
    pub fn toposort(&self, members: &HashSet<ModuleId>) -> Vec<ModuleId> {
        let mut roots: Vec<&ModuleId> = members.iter().collect();
        roots.sort();

        let mut visited: HashSet<ModuleId> = HashSet::default();
        let mut order = Vec::with_capacity(members.len());

        for root in roots {
            if visited.contains(root) {
                continue;
            }
            visited.insert(root.clone());
            // (module, sorted in-set dependencies, next dependency index)
            let mut stack = vec![(root.clone(), self.sorted_deps(root, members), 0usize)];

            while let Some((_, deps, next)) = stack.last_mut() {
                if let Some(dep) = deps.get(*next).cloned() {
                    *next += 1;
                    if visited.insert(dep.clone()) {
                        let dep_deps = self.sorted_deps(&dep, members);
                        stack.push((dep, dep_deps, 0));
                    }
                } else if let Some((id, _, _)) = stack.pop() {
                    order.push(id);
                }
            }
        }

        order
    }

    fn sorted_deps(&self, id: &ModuleId, members: &HashSet<ModuleId>) -> Vec<ModuleId> {
        let mut deps: Vec<ModuleId> = self
            .nodes
            .get(id)
            .map(|node| {
                node.resolved
                    .iter()
                    .filter(|d| members.contains(*d) && *d != id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        deps.sort();
        deps.dedup();
        deps
    }
}
