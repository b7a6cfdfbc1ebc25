//! The bundling engine.
//!
//! An [`Engine`] owns one build configuration together with everything that
//! persists between builds: the storage handle, the import parser, the
//! resolver and its cache, and the [`Rebuilder`] holding the last committed
//! snapshot. Callers drive it explicitly: `build` for a full build,
//! `notify_changed` + `rebuild` for incremental ones, `rebuild_and_get` to
//! serve a single output file.

use crate::bundler::{
    Artifact, BuildError, BuildSnapshot, ChunkKind, EmitError, EmittedChunk, GraphBuilder,
    ImportParser, Invalidation, LoaderTable, Metafile, ModuleId, ParseError, RebuildRequest,
    RebuildState, Rebuilder, ResolveCache, Resolver, Scanner, ServeError, SourceMap,
    TransformOptions, TransformOutput, emit, name_entries, split, transform_with,
};
use crate::config::BuildConfig;
use crate::storage::{FsStorage, Storage};
use kiln_util::hash::ContentHash;
use kiln_util::path::display_relative;
use rayon::prelude::*;
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of writing one output file.
#[derive(Debug)]
pub enum WriteStatus {
    /// Writing is disabled, or the file already holds this content.
    Skipped,
    Written,
    Failed(EmitError),
}

impl WriteStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Written => "written",
            Self::Failed(_) => "failed",
        }
    }
}

/// One chunk of a build result.
#[derive(Debug)]
pub struct OutputChunk {
    /// Chunk id (the file stem).
    pub id: String,
    pub kind: ChunkKind,
    /// Output path of the chunk file.
    pub path: PathBuf,
    /// Size of the chunk text.
    pub bytes: usize,
    pub has_source_map: bool,
    /// Entry module, relative to the working directory.
    pub entry: Option<String>,
    pub status: WriteStatus,
}

/// One asset of a build result.
#[derive(Debug)]
pub struct OutputAsset {
    pub path: PathBuf,
    /// Module the asset was loaded from, relative to the working directory.
    pub source: String,
    pub bytes: usize,
    pub status: WriteStatus,
}

/// Summary of a build.
#[derive(Debug)]
pub struct BuildResult {
    /// Generation of the snapshot this result describes.
    pub generation: u64,
    /// Chunks in output order.
    pub chunks: Vec<OutputChunk>,
    /// Assets by file name.
    pub assets: Vec<OutputAsset>,
    /// Module (relative to the working directory) → chunk ids.
    pub manifest: BTreeMap<String, Vec<String>>,
    pub metafile: Option<Metafile>,
    /// Number of modules in the graph.
    pub modules: usize,
}

impl BuildResult {
    /// Whether every output that was supposed to be written was written.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Write failures: chunks in order, then assets.
    pub fn failures(&self) -> impl Iterator<Item = &EmitError> {
        self.chunks
            .iter()
            .map(|c| &c.status)
            .chain(self.assets.iter().map(|a| &a.status))
            .filter_map(|status| match status {
                WriteStatus::Failed(e) => Some(e),
                _ => None,
            })
    }
}

/// Bundling engine for one configuration.
pub struct Engine {
    cwd: PathBuf,
    config: BuildConfig,
    storage: Arc<dyn Storage>,
    parser: Arc<dyn ImportParser>,
    resolver: Resolver,
    cache: ResolveCache,
    loaders: LoaderTable,
    rebuilder: Rebuilder,
    /// Content last written to each output path.
    written: Mutex<HashMap<PathBuf, ContentHash>>,
}

impl Engine {
    /// Create an engine reading and writing the real filesystem.
    ///
    /// # Errors
    /// `BuildError::Config` when the configuration is invalid.
    pub fn new(cwd: &Path, config: BuildConfig) -> Result<Self, BuildError> {
        Self::with_storage(cwd, config, Arc::new(FsStorage))
    }

    /// Create an engine over the given storage.
    ///
    /// # Errors
    /// `BuildError::Config` when the configuration is invalid.
    pub fn with_storage(
        cwd: &Path,
        config: BuildConfig,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, BuildError> {
        config.validate()?;
        let cwd = storage.canonicalize(cwd);
        let loaders = config.loader_table()?;
        let resolver = Resolver::new(config.resolve_options(&cwd), Arc::clone(&storage));
        Ok(Self {
            cwd,
            config,
            storage,
            parser: Arc::new(Scanner),
            resolver,
            cache: ResolveCache::new(),
            loaders,
            rebuilder: Rebuilder::new(),
            written: Mutex::default(),
        })
    }

    /// Replace the import parser.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn ImportParser>) -> Self {
        self.parser = parser;
        self
    }

    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Working directory all relative paths are resolved against.
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    #[must_use]
    pub fn resolve_cache(&self) -> &ResolveCache {
        &self.cache
    }

    /// Build everything from scratch and rewrite every output. Modules
    /// whose content is unchanged since the last snapshot are still reused.
    pub fn build(&self) -> Result<BuildResult, BuildError> {
        self.rebuilder.request_full();
        self.written_files().clear();
        self.run()
    }

    /// Report changed files. Relative paths are taken relative to the
    /// working directory. Returns how many paths were newly recorded.
    pub fn notify_changed(&self, paths: &[PathBuf]) -> usize {
        let paths: Vec<PathBuf> = paths
            .iter()
            .map(|p| self.storage.canonicalize(&self.cwd.join(p)))
            .collect();
        let dropped: usize = paths.iter().map(|p| self.cache.invalidate_path(p)).sum();
        debug!(paths = paths.len(), dropped, "resolver cache invalidated");
        self.rebuilder.notify_changed(&paths)
    }

    /// Bring the build up to date with the reported changes. Returns the
    /// current result without rebuilding when nothing changed; outputs a
    /// previous write failed on are written again either way.
    pub fn rebuild(&self) -> Result<BuildResult, BuildError> {
        self.run()
    }

    /// Rebuild if needed, then return one output file (`app.js` or
    /// `app.js.map`).
    ///
    /// # Errors
    /// The build error when the rebuild fails (the last good snapshot is
    /// still available through [`Engine::last_good`]), or
    /// `ServeError::UnknownChunk` when no such file exists.
    pub fn rebuild_and_get(&self, file: &str) -> Result<Artifact, ServeError> {
        let snapshot = self.rebuilder.rebuild_with(|req| self.build_snapshot(req))?;
        snapshot
            .artifact(file)
            .ok_or_else(|| ServeError::UnknownChunk(file.to_string()))
    }

    /// Last successfully committed snapshot.
    #[must_use]
    pub fn last_good(&self) -> Option<Arc<BuildSnapshot>> {
        self.rebuilder.snapshot()
    }

    #[must_use]
    pub fn state(&self) -> RebuildState {
        self.rebuilder.state()
    }

    /// Abandon the build in flight, if any.
    pub fn cancel(&self) {
        self.rebuilder.cancel();
    }

    /// Transform a single source string with this engine's parser.
    pub fn transform(
        &self,
        source: &str,
        options: &TransformOptions,
    ) -> Result<TransformOutput, ParseError> {
        transform_with(self.parser.as_ref(), source, options)
    }

    fn run(&self) -> Result<BuildResult, BuildError> {
        let started = Instant::now();
        let snapshot = self.rebuilder.rebuild_with(|req| self.build_snapshot(req))?;

        let result = self.finish(&snapshot);
        info!(
            generation = result.generation,
            modules = result.modules,
            chunks = result.chunks.len(),
            complete = result.is_complete(),
            elapsed_ms = started.elapsed().as_millis(),
            "build finished"
        );
        Ok(result)
    }

    fn resolve_entries(&self) -> Result<Vec<ModuleId>, BuildError> {
        self.config
            .entry_points
            .iter()
            .map(|entry| {
                self.resolver
                    .resolve_entry(entry, &self.cwd)
                    .map_err(|source| BuildError::Resolve {
                        importer: None,
                        source,
                    })
            })
            .collect()
    }

    fn build_snapshot(&self, req: RebuildRequest<'_>) -> Result<BuildSnapshot, BuildError> {
        let entry_ids = self.resolve_entries()?;
        let builder = GraphBuilder::new(
            &self.resolver,
            &self.cache,
            self.storage.as_ref(),
            self.parser.as_ref(),
            &self.loaders,
        )
        .with_cancel(req.cancel);

        let graph = match (req.prior, req.invalidation) {
            (Some(prior), Invalidation::Partial { affected, .. }) => {
                builder.rebuild(&entry_ids, &prior.graph, affected)?
            }
            (prior, _) => builder.build(&entry_ids, prior.map(|p| &p.graph))?,
        };

        let entries = name_entries(&entry_ids);
        let chunks = split(&graph, &entries, self.config.split_options());
        if req.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let options = self.config.emit_options(&self.cwd);
        let artifacts: Vec<EmittedChunk> = chunks
            .chunks()
            .par_iter()
            .map(|chunk| emit(&graph, &chunks, chunk, &options))
            .collect::<Result<_, _>>()?;

        let metafile = self.config.metafile.then(|| {
            let outdir = display_relative(&self.config.outdir_path(&self.cwd), &self.cwd);
            Metafile::new(&graph, &chunks, &artifacts, &self.cwd, &outdir)
        });

        let mut snapshot = BuildSnapshot::new(graph, entries, chunks, artifacts);
        snapshot.metafile = metafile;
        Ok(snapshot)
    }

    /// Summarize a snapshot, writing every output whose file does not
    /// already hold its content when writing is enabled.
    fn finish(&self, snapshot: &BuildSnapshot) -> BuildResult {
        let outdir = self.config.outdir_path(&self.cwd);
        let write = self.config.write;

        let chunks: Vec<OutputChunk> = snapshot
            .artifacts
            .par_iter()
            .map(|artifact| {
                let path = outdir.join(&artifact.file_name);
                let status = if write {
                    self.write_chunk(&outdir, artifact)
                } else {
                    WriteStatus::Skipped
                };
                let chunk = snapshot.chunks.get(&artifact.id);
                OutputChunk {
                    id: artifact.id.clone(),
                    kind: chunk.map_or(ChunkKind::Shared, |c| c.kind),
                    path,
                    bytes: artifact.text.len(),
                    has_source_map: artifact.source_map.is_some(),
                    entry: chunk
                        .and_then(|c| c.entry.as_ref())
                        .map(|id| id.relative_key(&self.cwd)),
                    status,
                }
            })
            .collect();

        let manifest = snapshot
            .chunks
            .manifest()
            .iter()
            .map(|(id, chunk_ids)| (id.relative_key(&self.cwd), chunk_ids.clone()))
            .collect();

        let assets = snapshot
            .assets
            .iter()
            .map(|asset| {
                let path = outdir.join(&asset.file_name);
                let status = if write {
                    match self.write_file(path.clone(), &asset.contents) {
                        Ok(true) => WriteStatus::Written,
                        Ok(false) => WriteStatus::Skipped,
                        Err(err) => {
                            debug!(error = %err, "asset write failed");
                            WriteStatus::Failed(err)
                        }
                    }
                } else {
                    WriteStatus::Skipped
                };
                OutputAsset {
                    path,
                    source: asset.source.relative_key(&self.cwd),
                    bytes: asset.contents.len(),
                    status,
                }
            })
            .collect();

        BuildResult {
            generation: snapshot.generation,
            chunks,
            assets,
            manifest,
            metafile: snapshot.metafile.clone(),
            modules: snapshot.graph.len(),
        }
    }

    /// Write a chunk and its source map.
    fn write_chunk(&self, outdir: &Path, artifact: &EmittedChunk) -> WriteStatus {
        let map = artifact.source_map.as_ref().map(SourceMap::to_json);
        let files = std::iter::once((artifact.file_name.clone(), artifact.text.as_bytes()))
            .chain(map.as_ref().map(|json| (artifact.map_file_name(), json.as_bytes())));

        let mut written = false;
        for (file_name, bytes) in files {
            match self.write_file(outdir.join(file_name), bytes) {
                Ok(w) => written |= w,
                Err(err) => {
                    debug!(error = %err, "chunk write failed");
                    return WriteStatus::Failed(err);
                }
            }
        }
        if written {
            WriteStatus::Written
        } else {
            WriteStatus::Skipped
        }
    }

    /// Write `bytes` to `path` unless this engine already wrote exactly
    /// that content there. Returns whether the file was written.
    fn write_file(&self, path: PathBuf, bytes: &[u8]) -> Result<bool, EmitError> {
        let hash = ContentHash::of(bytes);
        if self.written_files().get(&path) == Some(&hash) {
            return Ok(false);
        }
        match self.storage.write(&path, bytes) {
            Ok(()) => {
                self.written_files().insert(path, hash);
                Ok(true)
            }
            Err(source) => {
                self.written_files().remove(&path);
                Err(EmitError::WriteFailure { path, source })
            }
        }
    }

    fn written_files(&self) -> MutexGuard<'_, HashMap<PathBuf, ContentHash>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
