//! Code splitting and chunk assignment.
//!
//! Without splitting, every entry gets one self-contained chunk. With
//! splitting, each module lands in exactly one chunk: the chunk of the only
//! entry that reaches it, or a shared chunk keyed by the set of entries that
//! do. Dynamic `import()` targets become implicit entries.

use super::graph::{ModuleGraph, ModuleId};
use kiln_util::hash::ContentHash;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::BTreeMap;
use tracing::debug;

/// A named build root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// Output file stem.
    pub name: String,
    /// Root module.
    pub id: ModuleId,
    /// Discovered through a dynamic import rather than declared.
    pub implicit: bool,
}

impl EntryPoint {
    /// Create a declared entry point.
    #[must_use]
    pub fn new(name: impl Into<String>, id: ModuleId) -> Self {
        Self {
            name: name.into(),
            id,
            implicit: false,
        }
    }
}

/// Name declared entries after their file stems, keeping declared order.
/// Duplicate stems get a numeric suffix (`index`, `index-2`, ...) and
/// duplicate modules are dropped.
#[must_use]
pub fn name_entries(ids: &[ModuleId]) -> Vec<EntryPoint> {
    let mut taken = HashSet::default();
    let mut seen = HashSet::default();
    ids.iter()
        .filter(|id| seen.insert((*id).clone()))
        .map(|id| EntryPoint::new(unique_name(id.stem(), &mut taken), id.clone()))
        .collect()
}

fn unique_name(stem: &str, taken: &mut HashSet<String>) -> String {
    let mut name = stem.to_string();
    let mut n = 2;
    while !taken.insert(name.clone()) {
        name = format!("{stem}-{n}");
        n += 1;
    }
    name
}

/// Role of a chunk in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Output for a declared entry point.
    Entry,
    /// Output for a dynamically imported module.
    Dynamic,
    /// Modules needed by several entries.
    Shared,
}

impl ChunkKind {
    /// Name used in metafiles and JSON output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Dynamic => "dynamic",
            Self::Shared => "shared",
        }
    }
}

/// A single output artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Output file stem, unique within a build.
    pub id: String,
    pub kind: ChunkKind,
    /// Module run when the chunk is loaded (entry and dynamic chunks).
    pub entry: Option<ModuleId>,
    /// Member modules, dependencies first.
    pub modules: Vec<ModuleId>,
    /// Names of the entries this chunk serves, in entry order.
    pub entries: Vec<String>,
    /// Chunks that must be loaded before this one.
    pub imports: Vec<String>,
    /// Chunks loaded on demand by `import()` inside this one.
    pub dynamic_imports: Vec<String>,
}

/// Splitting options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitOptions {
    /// Hoist shared modules into shared chunks.
    pub splitting: bool,
    /// Shared chunks below this many source bytes are merged into the shared
    /// chunk with the most entries in common.
    pub min_shared_chunk_bytes: Option<usize>,
}

/// Result of chunk assignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSet {
    chunks: Vec<Chunk>,
    /// Declared entries followed by implicit ones.
    entries: Vec<EntryPoint>,
    /// Module -> ids of the chunks containing it.
    manifest: BTreeMap<ModuleId, Vec<String>>,
}

impl ChunkSet {
    /// All chunks: entry chunks in entry order, then shared chunks.
    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Chunk by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.id == id)
    }

    /// Entry points, including implicit ones.
    #[must_use]
    pub fn entries(&self) -> &[EntryPoint] {
        &self.entries
    }

    /// Ids of the chunks containing `module`.
    #[must_use]
    pub fn chunks_for(&self, module: &ModuleId) -> &[String] {
        self.manifest.get(module).map_or(&[], Vec::as_slice)
    }

    /// Module -> chunk ids.
    #[must_use]
    pub fn manifest(&self) -> &BTreeMap<ModuleId, Vec<String>> {
        &self.manifest
    }

    /// Number of chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether there are no chunks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn from_chunks(chunks: Vec<Chunk>, entries: Vec<EntryPoint>) -> Self {
        let mut manifest: BTreeMap<ModuleId, Vec<String>> = BTreeMap::new();
        for chunk in &chunks {
            for module in &chunk.modules {
                manifest
                    .entry(module.clone())
                    .or_default()
                    .push(chunk.id.clone());
            }
        }
        Self {
            chunks,
            entries,
            manifest,
        }
    }
}

/// Assign the modules of `graph` to chunks.
#[must_use]
pub fn split(graph: &ModuleGraph, entries: &[EntryPoint], options: SplitOptions) -> ChunkSet {
    let set = if options.splitting {
        split_shared(graph, entries, options.min_shared_chunk_bytes)
    } else {
        split_per_entry(graph, entries)
    };
    debug!(
        chunks = set.len(),
        splitting = options.splitting,
        "assigned modules to chunks"
    );
    set
}

/// One self-contained chunk per declared entry; dynamic imports inlined.
fn split_per_entry(graph: &ModuleGraph, entries: &[EntryPoint]) -> ChunkSet {
    let chunks = entries
        .iter()
        .map(|entry| {
            let members = graph.reachable_from(&entry.id, true);
            Chunk {
                id: entry.name.clone(),
                kind: ChunkKind::Entry,
                entry: Some(entry.id.clone()),
                modules: graph.toposort(&members),
                entries: vec![entry.name.clone()],
                imports: Vec::new(),
                dynamic_imports: Vec::new(),
            }
        })
        .collect();
    ChunkSet::from_chunks(chunks, entries.to_vec())
}

/// Modules grouped by the sorted indices of the entries reaching them.
struct Group {
    entries: Vec<usize>,
    modules: HashSet<ModuleId>,
}

fn split_shared(
    graph: &ModuleGraph,
    declared: &[EntryPoint],
    min_shared_bytes: Option<usize>,
) -> ChunkSet {
    let entries = with_implicit_entries(graph, declared);

    // Entry indices reaching each module over static edges
    let mut reaching: HashMap<ModuleId, Vec<usize>> = HashMap::default();
    for (idx, entry) in entries.iter().enumerate() {
        for module in graph.reachable_from(&entry.id, false) {
            if graph.contains(&module) {
                reaching.entry(module).or_default().push(idx);
            }
        }
    }

    let mut own: Vec<HashSet<ModuleId>> = vec![HashSet::default(); entries.len()];
    let mut shared: BTreeMap<Vec<usize>, HashSet<ModuleId>> = BTreeMap::new();
    for (module, idxs) in reaching {
        if idxs.len() == 1 {
            own[idxs[0]].insert(module);
        } else {
            shared.entry(idxs).or_default().insert(module);
        }
    }

    let mut groups: Vec<Group> = shared
        .into_iter()
        .map(|(entries, modules)| Group { entries, modules })
        .collect();
    if let Some(threshold) = min_shared_bytes {
        merge_small_groups(graph, &mut groups, threshold);
    }
    // First serving entry, then the remaining entry indices
    groups.sort_by(|a, b| a.entries.cmp(&b.entries));

    let mut chunks: Vec<Chunk> = entries
        .iter()
        .zip(own)
        .map(|(entry, members)| Chunk {
            id: entry.name.clone(),
            kind: if entry.implicit {
                ChunkKind::Dynamic
            } else {
                ChunkKind::Entry
            },
            entry: Some(entry.id.clone()),
            modules: graph.toposort(&members),
            entries: vec![entry.name.clone()],
            imports: Vec::new(),
            dynamic_imports: Vec::new(),
        })
        .collect();

    for group in groups {
        let mut names: Vec<&str> = group
            .entries
            .iter()
            .map(|&i| entries[i].name.as_str())
            .collect();
        names.sort_unstable();
        let key = names.join(",");
        chunks.push(Chunk {
            id: format!("chunk-{}", ContentHash::of(key.as_bytes()).short(8)),
            kind: ChunkKind::Shared,
            entry: None,
            modules: graph.toposort(&group.modules),
            entries: group
                .entries
                .iter()
                .map(|&i| entries[i].name.clone())
                .collect(),
            imports: Vec::new(),
            dynamic_imports: Vec::new(),
        });
    }

    link_chunks(graph, &entries, &mut chunks);
    ChunkSet::from_chunks(chunks, entries)
}

/// Declared entries followed by every `import()` target reachable from
/// them, in `ModuleId` order.
fn with_implicit_entries(graph: &ModuleGraph, declared: &[EntryPoint]) -> Vec<EntryPoint> {
    let mut reachable: HashSet<ModuleId> = HashSet::default();
    for entry in declared {
        reachable.extend(graph.reachable_from(&entry.id, true));
    }

    let declared_ids: HashSet<&ModuleId> = declared.iter().map(|e| &e.id).collect();
    let mut targets: Vec<&ModuleId> = reachable
        .iter()
        .filter_map(|id| graph.get(id))
        .flat_map(|node| node.dynamic_dependencies())
        .filter(|target| !declared_ids.contains(target))
        .collect();
    targets.sort();
    targets.dedup();

    let mut taken: HashSet<String> = declared.iter().map(|e| e.name.clone()).collect();
    let mut entries = declared.to_vec();
    for target in targets {
        entries.push(EntryPoint {
            name: unique_name(target.stem(), &mut taken),
            id: target.clone(),
            implicit: true,
        });
    }
    entries
}

fn group_bytes(graph: &ModuleGraph, group: &Group) -> usize {
    group
        .modules
        .iter()
        .filter_map(|id| graph.get(id))
        .map(|node| node.source.len())
        .sum()
}

/// Merge shared groups smaller than `threshold` into the group sharing the
/// most entries with them. The merged group serves the union of entries.
fn merge_small_groups(graph: &ModuleGraph, groups: &mut Vec<Group>, threshold: usize) {
    groups.sort_by(|a, b| a.entries.cmp(&b.entries));

    while groups.len() > 1 {
        let smallest = groups
            .iter()
            .enumerate()
            .map(|(i, g)| (group_bytes(graph, g), i))
            .filter(|(bytes, _)| *bytes < threshold)
            .min();
        let Some((_, small)) = smallest else {
            break;
        };

        let shared_count = |other: &Group| {
            other
                .entries
                .iter()
                .filter(|e| groups[small].entries.contains(e))
                .count()
        };
        // Most entries in common; earliest group on ties
        let Some(target) = (0..groups.len())
            .filter(|&i| i != small)
            .max_by(|&a, &b| {
                shared_count(&groups[a])
                    .cmp(&shared_count(&groups[b]))
                    .then(b.cmp(&a))
            })
        else {
            break;
        };

        let merged = groups.remove(small);
        let target = if target > small { target - 1 } else { target };
        let into = &mut groups[target];
        into.entries.extend(merged.entries);
        into.entries.sort_unstable();
        into.entries.dedup();
        into.modules.extend(merged.modules);
        debug!(entries = ?into.entries, "merged small shared chunk");
    }
}

/// Fill in each chunk's static and dynamic chunk imports.
fn link_chunks(graph: &ModuleGraph, entries: &[EntryPoint], chunks: &mut [Chunk]) {
    let mut home: HashMap<&ModuleId, usize> = HashMap::default();
    for (idx, chunk) in chunks.iter().enumerate() {
        for module in &chunk.modules {
            home.insert(module, idx);
        }
    }
    let entry_chunk: HashMap<&ModuleId, usize> = entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| (&entry.id, idx))
        .collect();

    let mut links: Vec<(Vec<usize>, Vec<usize>)> = Vec::with_capacity(chunks.len());
    for (idx, chunk) in chunks.iter().enumerate() {
        let mut imports: Vec<usize> = Vec::new();
        let mut dynamic: Vec<usize> = Vec::new();

        // An entry whose root module was hoisted loads it from elsewhere
        if let Some(&owner) = chunk.entry.as_ref().and_then(|e| home.get(e)) {
            imports.push(owner);
        }
        for node in chunk.modules.iter().filter_map(|id| graph.get(id)) {
            imports.extend(node.static_dependencies().filter_map(|d| home.get(d).copied()));
            dynamic.extend(
                node.dynamic_dependencies()
                    .filter_map(|d| entry_chunk.get(d).copied()),
            );
        }

        for list in [&mut imports, &mut dynamic] {
            list.retain(|&other| other != idx);
            list.sort_unstable();
            list.dedup();
        }
        links.push((imports, dynamic));
    }

    let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
    for (chunk, (imports, dynamic)) in chunks.iter_mut().zip(links) {
        chunk.imports = imports.into_iter().map(|i| ids[i].clone()).collect();
        chunk.dynamic_imports = dynamic.into_iter().map(|i| ids[i].clone()).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::graph::tests::{graph, node, node_with};

    fn entries(paths: &[&str]) -> Vec<EntryPoint> {
        let ids: Vec<ModuleId> = paths.iter().map(ModuleId::from_path).collect();
        name_entries(&ids)
    }

    fn module_names(chunk: &Chunk) -> Vec<&str> {
        chunk.modules.iter().map(ModuleId::stem).collect()
    }

    fn splitting() -> SplitOptions {
        SplitOptions {
            splitting: true,
            min_shared_chunk_bytes: None,
        }
    }

    /// a imports b and c, b imports c, d imports c.
    fn abcd() -> ModuleGraph {
        graph(vec![
            node("/src/a.js", &["/src/b.js", "/src/c.js"]),
            node("/src/b.js", &["/src/c.js"]),
            node("/src/c.js", &[]),
            node("/src/d.js", &["/src/c.js"]),
        ])
    }

    #[test]
    fn test_without_splitting_one_chunk_per_entry() {
        let set = split(&abcd(), &entries(&["/src/a.js"]), SplitOptions::default());

        assert_eq!(set.len(), 1);
        let chunk = &set.chunks()[0];
        assert_eq!(chunk.id, "a");
        assert_eq!(module_names(chunk), vec!["c", "b", "a"]);
        assert!(chunk.imports.is_empty());
    }

    #[test]
    fn test_without_splitting_shared_modules_are_duplicated() {
        let set = split(
            &abcd(),
            &entries(&["/src/a.js", "/src/d.js"]),
            SplitOptions::default(),
        );

        assert_eq!(set.len(), 2);
        assert_eq!(module_names(&set.chunks()[1]), vec!["c", "d"]);
        assert_eq!(set.chunks_for(&ModuleId::from_path("/src/c.js")), ["a", "d"]);
    }

    #[test]
    fn test_splitting_hoists_shared_module() {
        let set = split(&abcd(), &entries(&["/src/a.js", "/src/d.js"]), splitting());

        let ids: Vec<&str> = set.chunks().iter().map(|c| c.id.as_str()).collect();
        let shared_id = format!("chunk-{}", ContentHash::of(b"a,d").short(8));
        assert_eq!(ids, vec!["a", "d", shared_id.as_str()]);

        assert_eq!(module_names(&set.chunks()[0]), vec!["b", "a"]);
        assert_eq!(module_names(&set.chunks()[1]), vec!["d"]);
        let shared = &set.chunks()[2];
        assert_eq!(shared.kind, ChunkKind::Shared);
        assert_eq!(module_names(shared), vec!["c"]);
        assert_eq!(shared.entries, vec!["a".to_string(), "d".to_string()]);

        assert_eq!(set.chunks()[0].imports, vec![shared_id.clone()]);
        assert_eq!(set.chunks()[1].imports, vec![shared_id]);
    }

    #[test]
    fn test_splitting_single_copy() {
        let g = graph(vec![
            node("/src/a.js", &["/src/x.js", "/src/y.js"]),
            node("/src/b.js", &["/src/y.js", "/src/z.js"]),
            node("/src/c.js", &["/src/x.js", "/src/z.js", "/src/y.js"]),
            node("/src/x.js", &["/src/util.js"]),
            node("/src/y.js", &["/src/util.js"]),
            node("/src/z.js", &[]),
            node("/src/util.js", &["/src/x.js"]),
        ]);
        let set = split(&g, &entries(&["/src/a.js", "/src/b.js", "/src/c.js"]), splitting());

        for id in g.ids() {
            assert_eq!(set.chunks_for(id).len(), 1, "{id} must be in exactly one chunk");
        }
        let total: usize = set.chunks().iter().map(|c| c.modules.len()).sum();
        assert_eq!(total, g.len());
    }

    #[test]
    fn test_split_is_idempotent() {
        let g = abcd();
        let e = entries(&["/src/a.js", "/src/d.js"]);
        assert_eq!(split(&g, &e, splitting()), split(&g, &e, splitting()));
    }

    #[test]
    fn test_dynamic_import_becomes_implicit_entry() {
        let g = graph(vec![
            node_with("/src/main.js", &["/src/util.js"], &["/src/page.js"]),
            node("/src/page.js", &["/src/util.js", "/src/view.js"]),
            node("/src/util.js", &[]),
            node("/src/view.js", &[]),
        ]);
        let set = split(&g, &entries(&["/src/main.js"]), splitting());

        let page = set.get("page").unwrap();
        assert_eq!(page.kind, ChunkKind::Dynamic);
        assert_eq!(module_names(page), vec!["view", "page"]);
        assert!(set.entries()[1].implicit);

        let main = set.get("main").unwrap();
        assert_eq!(module_names(main), vec!["main"]);
        assert_eq!(main.dynamic_imports, vec!["page".to_string()]);

        let util = ModuleId::from_path("/src/util.js");
        let shared = &set.chunks_for(&util)[0];
        assert!(shared.starts_with("chunk-"));
        assert_eq!(main.imports, vec![shared.clone()]);
        assert_eq!(page.imports, vec![shared.clone()]);
    }

    #[test]
    fn test_without_splitting_dynamic_imports_are_inlined() {
        let g = graph(vec![
            node_with("/src/main.js", &[], &["/src/page.js"]),
            node("/src/page.js", &[]),
        ]);
        let set = split(&g, &entries(&["/src/main.js"]), SplitOptions::default());
        assert_eq!(set.len(), 1);
        assert_eq!(module_names(&set.chunks()[0]), vec!["page", "main"]);
    }

    #[test]
    fn test_entry_reached_by_another_entry() {
        let g = graph(vec![
            node("/src/a.js", &["/src/b.js"]),
            node("/src/b.js", &[]),
        ]);
        let set = split(&g, &entries(&["/src/a.js", "/src/b.js"]), splitting());

        let b = set.get("b").unwrap();
        assert!(b.modules.is_empty());
        assert_eq!(b.imports.len(), 1);
        let shared = set.get(&b.imports[0]).unwrap();
        assert_eq!(module_names(shared), vec!["b"]);
    }

    #[test]
    fn test_small_shared_chunks_merge() {
        let g = graph(vec![
            node("/src/a.js", &["/src/ab.js", "/src/abc.js"]),
            node("/src/b.js", &["/src/ab.js", "/src/abc.js"]),
            node("/src/c.js", &["/src/abc.js"]),
            node("/src/ab.js", &[]),
            node("/src/abc.js", &[]),
        ]);
        let e = entries(&["/src/a.js", "/src/b.js", "/src/c.js"]);

        let unmerged = split(&g, &e, splitting());
        assert_eq!(unmerged.len(), 5);

        let merged = split(
            &g,
            &e,
            SplitOptions {
                splitting: true,
                min_shared_chunk_bytes: Some(1_000),
            },
        );
        assert_eq!(merged.len(), 4);
        let shared = &merged.chunks()[3];
        assert_eq!(shared.entries, vec!["a", "b", "c"]);
        assert_eq!(module_names(shared).len(), 2);
        for id in g.ids() {
            assert_eq!(merged.chunks_for(id).len(), 1);
        }
    }

    #[test]
    fn test_name_entries_dedups_stems() {
        let ids: Vec<ModuleId> = ["/a/index.js", "/b/index.js", "/a/index.js", "/c/main.ts"]
            .iter()
            .map(ModuleId::from_path)
            .collect();
        let names: Vec<String> = name_entries(&ids).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["index", "index-2", "main"]);
    }
}
