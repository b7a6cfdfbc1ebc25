//! Incremental rebuilds.
//!
//! The [`Rebuilder`] owns the last committed [`BuildSnapshot`] and the set of
//! paths reported changed since. A rebuild invalidates the changed modules
//! plus everything that transitively imports them; all other nodes are
//! carried over from the prior graph by reference.
//!
//! State machine:
//!
//! ```text
//! Clean --notify--> Dirty --rebuild--> Rebuilding --ok--> Clean
//!                                                 \--err--> Failed
//! ```
//!
//! Rebuilds are serialized. A caller that arrives while another rebuild is
//! running waits for it and, if nothing changed in the meantime, returns the
//! snapshot it committed.

use super::assets::{Asset, collect_assets};
use super::builder::CancelToken;
use super::chunks::{ChunkSet, EntryPoint};
use super::emit::EmittedChunk;
use super::error::BuildError;
use super::graph::{ModuleGraph, ModuleId};
use super::metafile::Metafile;
use kiln_util::path::normalize;
use rustc_hash::FxHashSet as HashSet;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Everything produced by one successful build.
#[derive(Debug, Clone)]
pub struct BuildSnapshot {
    /// Commit counter, starting at 1.
    pub generation: u64,
    pub graph: ModuleGraph,
    /// Declared entry points.
    pub entries: Vec<EntryPoint>,
    pub chunks: ChunkSet,
    /// Emitted chunks, in chunk order.
    pub artifacts: Vec<EmittedChunk>,
    /// Files copied by the `file` loader, by file name.
    pub assets: Vec<Asset>,
    pub metafile: Option<Metafile>,
}

impl BuildSnapshot {
    /// Assemble a snapshot. The generation is assigned on commit.
    #[must_use]
    pub fn new(
        graph: ModuleGraph,
        entries: Vec<EntryPoint>,
        chunks: ChunkSet,
        artifacts: Vec<EmittedChunk>,
    ) -> Self {
        let assets = collect_assets(&graph);
        Self {
            generation: 0,
            graph,
            entries,
            chunks,
            artifacts,
            assets,
            metafile: None,
        }
    }

    /// Output file by name: a chunk (`app.js`), its source map
    /// (`app.js.map`) or an asset. A leading `/` or `./` is ignored.
    #[must_use]
    pub fn artifact(&self, file: &str) -> Option<Artifact> {
        let file = file.trim_start_matches('/').trim_start_matches("./");
        let chunk_file = self.artifacts.iter().find_map(|chunk| {
            if chunk.file_name == file {
                return Some(Artifact {
                    file_name: chunk.file_name.clone(),
                    chunk: Some(chunk.id.clone()),
                    contents: chunk.text.clone().into_bytes(),
                    content_type: "text/javascript",
                });
            }
            let map = chunk.source_map.as_ref()?;
            (chunk.map_file_name() == file).then(|| Artifact {
                file_name: chunk.map_file_name(),
                chunk: Some(chunk.id.clone()),
                contents: map.to_json().into_bytes(),
                content_type: "application/json",
            })
        });
        chunk_file.or_else(|| {
            self.assets
                .iter()
                .find(|asset| asset.file_name == file)
                .map(|asset| Artifact {
                    file_name: asset.file_name.clone(),
                    chunk: None,
                    contents: asset.contents.to_vec(),
                    content_type: asset.content_type(),
                })
        })
    }
}

/// A single servable output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    /// Id of the chunk the file belongs to; `None` for assets.
    pub chunk: Option<String>,
    pub contents: Vec<u8>,
    pub content_type: &'static str,
}

impl Artifact {
    /// Contents as text, for chunks and source maps.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.contents).ok()
    }
}

/// Rebuild lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildState {
    /// The committed snapshot reflects every reported change.
    Clean,
    /// Changes are pending.
    Dirty,
    /// A rebuild is running.
    Rebuilding,
    /// The last rebuild failed; the prior snapshot is still served.
    Failed,
}

impl RebuildState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Dirty => "dirty",
            Self::Rebuilding => "rebuilding",
            Self::Failed => "failed",
        }
    }
}

/// What a rebuild has to reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Reload everything (reusing nodes whose content hash is unchanged).
    Full,
    /// Reload only `affected`: the `changed` modules and their importers.
    Partial {
        changed: Vec<ModuleId>,
        affected: HashSet<ModuleId>,
    },
}

/// Map changed paths onto `graph`.
///
/// A path the graph does not contain forces a full rebuild: a new file may
/// change how existing specifiers resolve.
#[must_use]
pub fn invalidate(graph: &ModuleGraph, changed: &[PathBuf]) -> Invalidation {
    let mut seeds: Vec<ModuleId> = Vec::new();
    for path in changed {
        let path = normalize(path);
        let before = seeds.len();
        seeds.extend(graph.ids_for_path(&path).cloned());
        if seeds.len() == before {
            debug!(path = %path.display(), "changed path not in graph, rebuilding fully");
            return Invalidation::Full;
        }
    }
    seeds.sort();
    seeds.dedup();

    let affected = graph.ancestors_closure(&seeds);
    debug!(
        changed = seeds.len(),
        affected = affected.len(),
        "invalidated modules"
    );
    Invalidation::Partial {
        changed: seeds,
        affected,
    }
}

/// Inputs handed to a rebuild function.
pub struct RebuildRequest<'a> {
    /// Last committed snapshot, if any.
    pub prior: Option<&'a BuildSnapshot>,
    pub invalidation: &'a Invalidation,
    /// Paths reported changed since the prior snapshot.
    pub changed: &'a [PathBuf],
    /// Cancelled by [`Rebuilder::cancel`].
    pub cancel: &'a CancelToken,
}

struct Inner {
    state: RebuildState,
    snapshot: Option<Arc<BuildSnapshot>>,
    pending: BTreeSet<PathBuf>,
    force_full: bool,
    last_error: Option<String>,
    cancel: CancelToken,
}

/// Serializes rebuilds and owns the committed snapshot.
pub struct Rebuilder {
    inner: Mutex<Inner>,
    rebuild_lock: Mutex<()>,
}

impl Default for Rebuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Rebuilder {
    /// A rebuilder with no snapshot; the first rebuild is a full build.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RebuildState::Dirty,
                snapshot: None,
                pending: BTreeSet::new(),
                force_full: true,
                last_error: None,
                cancel: CancelToken::new(),
            }),
            rebuild_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record changed paths. Returns how many were not already pending.
    pub fn notify_changed(&self, paths: &[PathBuf]) -> usize {
        let mut inner = self.lock();
        let added = paths
            .iter()
            .filter(|p| inner.pending.insert(normalize(p)))
            .count();
        if inner.state != RebuildState::Rebuilding && !inner.pending.is_empty() {
            inner.state = RebuildState::Dirty;
        }
        debug!(added, pending = inner.pending.len(), "changes recorded");
        added
    }

    /// Make the next rebuild a full one.
    pub fn request_full(&self) {
        let mut inner = self.lock();
        inner.force_full = true;
        if inner.state != RebuildState::Rebuilding {
            inner.state = RebuildState::Dirty;
        }
    }

    /// Cancel the rebuild in flight, if any. It fails with
    /// [`BuildError::Cancelled`] and commits nothing.
    pub fn cancel(&self) {
        self.lock().cancel.cancel();
    }

    #[must_use]
    pub fn state(&self) -> RebuildState {
        self.lock().state
    }

    /// Last committed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<BuildSnapshot>> {
        self.lock().snapshot.clone()
    }

    /// Message of the last failed rebuild, cleared by the next success.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Paths waiting for the next rebuild.
    #[must_use]
    pub fn pending(&self) -> Vec<PathBuf> {
        self.lock().pending.iter().cloned().collect()
    }

    /// Bring the snapshot up to date using `build`.
    ///
    /// When the state is `Clean` the committed snapshot is returned without
    /// calling `build`. On success the result is committed atomically with
    /// the next generation number. On failure the prior snapshot stays in
    /// place and the changes stay pending.
    ///
    /// # Errors
    /// The error returned by `build`.
    pub fn rebuild_with<F>(&self, build: F) -> Result<Arc<BuildSnapshot>, BuildError>
    where
        F: FnOnce(RebuildRequest<'_>) -> Result<BuildSnapshot, BuildError>,
    {
        let _serial = self
            .rebuild_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (prior, changed, forced, cancel) = {
            let mut inner = self.lock();
            if inner.state == RebuildState::Clean {
                if let Some(snapshot) = &inner.snapshot {
                    debug!(generation = snapshot.generation, "snapshot is current");
                    return Ok(Arc::clone(snapshot));
                }
            }
            let changed: Vec<PathBuf> = std::mem::take(&mut inner.pending).into_iter().collect();
            let forced = std::mem::take(&mut inner.force_full);
            inner.state = RebuildState::Rebuilding;
            inner.cancel = CancelToken::new();
            (inner.snapshot.clone(), changed, forced, inner.cancel.clone())
        };

        let invalidation = match &prior {
            Some(prior) if !forced => invalidate(&prior.graph, &changed),
            _ => Invalidation::Full,
        };
        let result = build(RebuildRequest {
            prior: prior.as_deref(),
            invalidation: &invalidation,
            changed: &changed,
            cancel: &cancel,
        });

        let mut inner = self.lock();
        match result {
            Ok(mut snapshot) if !cancel.is_cancelled() => {
                snapshot.generation = prior.as_ref().map_or(1, |p| p.generation + 1);
                let snapshot = Arc::new(snapshot);
                inner.snapshot = Some(Arc::clone(&snapshot));
                inner.last_error = None;
                inner.state = if inner.pending.is_empty() && !inner.force_full {
                    RebuildState::Clean
                } else {
                    RebuildState::Dirty
                };
                debug!(generation = snapshot.generation, "snapshot committed");
                Ok(snapshot)
            }
            result => {
                let err = result.err().unwrap_or(BuildError::Cancelled);
                inner.pending.extend(changed);
                inner.force_full |= forced;
                inner.state = if matches!(err, BuildError::Cancelled) {
                    RebuildState::Dirty
                } else {
                    RebuildState::Failed
                };
                inner.last_error = Some(err.to_string());
                debug!(error = %err, "rebuild failed, keeping prior snapshot");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::error::ParseError;
    use crate::bundler::graph::tests::{graph, node};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn abc() -> ModuleGraph {
        // a -> b -> c, d -> c
        graph(vec![
            node("/p/a.js", &["/p/b.js"]),
            node("/p/b.js", &["/p/c.js"]),
            node("/p/c.js", &[]),
            node("/p/d.js", &["/p/c.js"]),
            node("/p/e.js", &[]),
        ])
    }

    fn snapshot(graph: ModuleGraph) -> BuildSnapshot {
        BuildSnapshot::new(graph, Vec::new(), ChunkSet::default(), Vec::new())
    }

    fn ok(_: RebuildRequest<'_>) -> Result<BuildSnapshot, BuildError> {
        Ok(snapshot(abc()))
    }

    fn ids(set: &HashSet<ModuleId>) -> Vec<String> {
        let mut ids: Vec<String> = set.iter().map(|id| id.stem().to_string()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_invalidate_includes_transitive_importers() {
        let inv = invalidate(&abc(), &[PathBuf::from("/p/c.js")]);
        let Invalidation::Partial { changed, affected } = inv else {
            panic!("expected partial invalidation");
        };
        assert_eq!(changed, vec![ModuleId::from_path("/p/c.js")]);
        assert_eq!(ids(&affected), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_invalidate_unknown_path_is_full() {
        let inv = invalidate(&abc(), &[PathBuf::from("/p/b.js"), PathBuf::from("/p/new.js")]);
        assert_eq!(inv, Invalidation::Full);
    }

    #[test]
    fn test_first_rebuild_is_full_and_commits() {
        let rebuilder = Rebuilder::new();
        assert_eq!(rebuilder.state(), RebuildState::Dirty);

        let snap = rebuilder
            .rebuild_with(|req| {
                assert!(req.prior.is_none());
                assert_eq!(*req.invalidation, Invalidation::Full);
                ok(req)
            })
            .unwrap();
        assert_eq!(snap.generation, 1);
        assert_eq!(rebuilder.state(), RebuildState::Clean);
        assert!(Arc::ptr_eq(&snap, &rebuilder.snapshot().unwrap()));
    }

    #[test]
    fn test_clean_rebuild_does_not_call_build() {
        let rebuilder = Rebuilder::new();
        let first = rebuilder.rebuild_with(ok).unwrap();
        let calls = AtomicUsize::new(0);
        let again = rebuilder
            .rebuild_with(|req| {
                calls.fetch_add(1, Ordering::SeqCst);
                ok(req)
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn test_partial_rebuild_after_notify() {
        let rebuilder = Rebuilder::new();
        rebuilder.rebuild_with(ok).unwrap();

        assert_eq!(rebuilder.notify_changed(&[PathBuf::from("/p/b.js")]), 1);
        assert_eq!(rebuilder.notify_changed(&[PathBuf::from("/p/b.js")]), 0);
        assert_eq!(rebuilder.state(), RebuildState::Dirty);

        let snap = rebuilder
            .rebuild_with(|req| {
                assert_eq!(req.changed, &[PathBuf::from("/p/b.js")]);
                let Invalidation::Partial { affected, .. } = req.invalidation else {
                    panic!("expected partial invalidation");
                };
                assert_eq!(ids(affected), vec!["a", "b"]);
                ok(req)
            })
            .unwrap();
        assert_eq!(snap.generation, 2);
        assert!(rebuilder.pending().is_empty());
    }

    #[test]
    fn test_failure_keeps_prior_snapshot_and_pending() {
        let rebuilder = Rebuilder::new();
        let good = rebuilder.rebuild_with(ok).unwrap();
        rebuilder.notify_changed(&[PathBuf::from("/p/c.js")]);

        let err = rebuilder
            .rebuild_with(|_| {
                Err(BuildError::ParseFailed {
                    module: ModuleId::from_path("/p/c.js"),
                    source: ParseError::syntax(1, "unexpected token"),
                })
            })
            .unwrap_err();
        assert!(matches!(err, BuildError::ParseFailed { .. }));
        assert_eq!(rebuilder.state(), RebuildState::Failed);
        assert!(Arc::ptr_eq(&good, &rebuilder.snapshot().unwrap()));
        assert_eq!(rebuilder.pending(), vec![PathBuf::from("/p/c.js")]);
        assert!(rebuilder.last_error().is_some());

        // The retry sees the same change and recovers
        let fixed = rebuilder
            .rebuild_with(|req| {
                assert_eq!(req.changed, &[PathBuf::from("/p/c.js")]);
                ok(req)
            })
            .unwrap();
        assert_eq!(fixed.generation, 2);
        assert_eq!(rebuilder.state(), RebuildState::Clean);
        assert!(rebuilder.last_error().is_none());
    }

    #[test]
    fn test_cancelled_rebuild_commits_nothing() {
        let rebuilder = Rebuilder::new();
        let err = rebuilder
            .rebuild_with(|req| {
                req.cancel.cancel();
                ok(req)
            })
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
        assert!(rebuilder.snapshot().is_none());
        assert_eq!(rebuilder.state(), RebuildState::Dirty);

        // A fresh token is used for the next attempt
        assert_eq!(rebuilder.rebuild_with(ok).unwrap().generation, 1);
    }

    #[test]
    fn test_waiting_caller_observes_committed_result() {
        let rebuilder = Rebuilder::new();
        let calls = AtomicUsize::new(0);
        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();

        std::thread::scope(|s| {
            let first = s.spawn(|| {
                let go_rx = go_rx;
                rebuilder.rebuild_with(|req| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    started_tx.send(()).unwrap();
                    go_rx.recv().unwrap();
                    ok(req)
                })
            });
            started_rx.recv().unwrap();
            assert_eq!(rebuilder.state(), RebuildState::Rebuilding);

            let second = s.spawn(|| {
                rebuilder.rebuild_with(|req| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ok(req)
                })
            });
            go_tx.send(()).unwrap();

            let a = first.join().unwrap().unwrap();
            let b = second.join().unwrap().unwrap();
            assert!(Arc::ptr_eq(&a, &b));
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_assets_are_served_by_file_name() {
        let mut logo = (*node("/p/logo.png", &[])).clone();
        logo.asset = Some(Asset::new(&logo.id, b"PNG"));
        let file_name = logo.asset.as_ref().unwrap().file_name.clone();
        let snap = snapshot(graph(vec![node("/p/a.js", &["/p/logo.png"]), Arc::new(logo)]));

        assert_eq!(snap.assets.len(), 1);
        let artifact = snap.artifact(&format!("./{file_name}")).unwrap();
        assert_eq!(artifact.contents, b"PNG");
        assert_eq!(artifact.content_type, "image/png");
        assert_eq!(artifact.chunk, None);
        assert!(snap.artifact("logo.png").is_none());
    }
}
