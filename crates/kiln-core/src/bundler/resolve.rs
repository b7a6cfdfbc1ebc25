//! Import specifier resolution.
//!
//! Maps a specifier plus importing module to a [`ModuleId`].
//!
//! ## Specifier Types
//!
//! - Relative: `./utils`, `../lib/foo`
//! - Absolute: `/abs/path/to/module`
//! - Bare: `lodash`, `@scope/pkg`, `react/jsx-runtime`
//!
//! Any specifier may carry a `?query` suffix, which selects a variant of the
//! same file and is kept in the resulting id.

use super::error::ResolveError;
use super::graph::ModuleId;
use crate::storage::Storage;
use kiln_util::path::normalize;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace};

/// Extensions tried, in order, when a specifier names no existing file.
pub const DEFAULT_EXTENSIONS: &[&str] = &[".ts", ".tsx", ".js", ".jsx", ".mjs", ".cjs", ".json"];

/// Resolution options.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Extensions appended to extensionless specifiers, in priority order.
    pub extensions: Vec<String>,
    /// Stems of directory index files, tried with each extension.
    pub index_files: Vec<String>,
    /// Directory holding packages for bare specifiers.
    pub package_root: Option<PathBuf>,
    /// Specifiers left to the runtime instead of bundled. A pattern matches
    /// itself and its subpaths (`react` covers `react/jsx-runtime`); one `*`
    /// matches any run of characters.
    pub external: Vec<String>,
}

impl ResolveOptions {
    /// Whether `specifier` is configured as external. The query suffix is
    /// ignored.
    #[must_use]
    pub fn is_external(&self, specifier: &str) -> bool {
        let (path_part, _) = split_query(specifier);
        self.external
            .iter()
            .any(|pattern| external_matches(pattern, path_part))
    }
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(ToString::to_string).collect(),
            index_files: vec!["index".to_string()],
            package_root: None,
            external: Vec::new(),
        }
    }
}

/// Import resolver. Stateless apart from its options; results are memoized
/// in a caller-owned [`ResolveCache`].
#[derive(Debug, Clone)]
pub struct Resolver {
    options: ResolveOptions,
    storage: Arc<dyn Storage>,
}

impl Resolver {
    /// Create a resolver reading through `storage`.
    #[must_use]
    pub fn new(options: ResolveOptions, storage: Arc<dyn Storage>) -> Self {
        Self { options, storage }
    }

    /// Resolution options.
    #[must_use]
    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Whether `specifier` is configured as external.
    #[must_use]
    pub fn is_external(&self, specifier: &str) -> bool {
        self.options.is_external(specifier)
    }

    /// Resolve `specifier` as imported from `from`.
    ///
    /// # Errors
    /// See [`ResolveError`] for the failure modes.
    pub fn resolve(
        &self,
        cache: &ResolveCache,
        specifier: &str,
        from: Option<&ModuleId>,
    ) -> Result<ModuleId, ResolveError> {
        let (path_part, query) = split_query(specifier);
        if path_part.trim().is_empty() || path_part.contains('\0') {
            return Err(ResolveError::InvalidSpecifier {
                specifier: specifier.to_string(),
            });
        }

        let relative = is_relative(path_part);
        let importer_dir = if relative {
            let Some(from) = from else {
                return Err(ResolveError::MissingImporter {
                    specifier: specifier.to_string(),
                });
            };
            Some(
                from.path()
                    .parent()
                    .map_or_else(|| PathBuf::from("/"), Path::to_path_buf),
            )
        } else {
            None
        };

        let key = CacheKey {
            dir: importer_dir.clone(),
            specifier: specifier.to_string(),
        };
        if let Some(hit) = cache.get(&key) {
            return Ok(hit);
        }

        let mut tried = Vec::new();
        let found = match importer_dir {
            Some(dir) => {
                self.resolve_file_or_directory(&normalize(&dir.join(path_part)), &mut tried)?
            }
            None if Path::new(path_part).is_absolute() => {
                self.resolve_file_or_directory(&normalize(Path::new(path_part)), &mut tried)?
            }
            None => self.resolve_bare(path_part, &mut tried)?,
        };

        let Some(path) = found else {
            return Err(ResolveError::NotFound {
                specifier: specifier.to_string(),
                from: from.cloned(),
                tried,
            });
        };

        let id = ModuleId::new(&path, query);
        trace!(specifier, resolved = %id, "resolved");
        cache.insert(key, path, id.clone());
        Ok(id)
    }

    /// Resolve a configured entry point path (absolute, or relative to
    /// `cwd`). Extensions and index files apply as for imports.
    ///
    /// # Errors
    /// Returns `NotFound` when no candidate exists.
    pub fn resolve_entry(&self, entry: &Path, cwd: &Path) -> Result<ModuleId, ResolveError> {
        let text = entry.to_string_lossy();
        let (path_part, query) = split_query(&text);
        if path_part.trim().is_empty() {
            return Err(ResolveError::InvalidSpecifier {
                specifier: text.to_string(),
            });
        }

        let target = normalize(&cwd.join(path_part));
        let mut tried = Vec::new();
        match self.resolve_file_or_directory(&target, &mut tried)? {
            Some(path) => Ok(ModuleId::new(&path, query)),
            None => Err(ResolveError::NotFound {
                specifier: text.to_string(),
                from: None,
                tried,
            }),
        }
    }

    /// Resolve a bare specifier against the package root.
    fn resolve_bare(
        &self,
        specifier: &str,
        tried: &mut Vec<PathBuf>,
    ) -> Result<Option<PathBuf>, ResolveError> {
        let Some(root) = &self.options.package_root else {
            return Ok(None);
        };

        let (pkg_name, subpath) = parse_bare_specifier(specifier);
        let pkg_dir = root.join(&pkg_name);
        if !self.storage.is_dir(&pkg_dir) {
            tried.push(pkg_dir);
            return Ok(None);
        }

        let manifest = self.read_manifest(&pkg_dir);

        if let Some(sub) = subpath {
            if let Some(entry) = manifest
                .as_ref()
                .and_then(|m| m.get("exports"))
                .and_then(|exports| resolve_exports(exports, &format!("./{sub}")))
            {
                if let Some(found) = self.resolve_file_or_directory(&pkg_dir.join(entry), tried)? {
                    return Ok(Some(found));
                }
            }
            return self.resolve_file_or_directory(&pkg_dir.join(sub), tried);
        }

        if let Some(manifest) = &manifest {
            let candidates = [
                manifest.get("exports").and_then(|e| resolve_exports(e, ".")),
                manifest.get("module").and_then(Value::as_str).map(String::from),
                manifest.get("main").and_then(Value::as_str).map(String::from),
            ];
            for entry in candidates.into_iter().flatten() {
                if let Some(found) = self.resolve_file_or_directory(&pkg_dir.join(entry), tried)? {
                    return Ok(Some(found));
                }
            }
        }

        self.resolve_index(&pkg_dir, tried)
    }

    fn read_manifest(&self, pkg_dir: &Path) -> Option<Value> {
        let path = pkg_dir.join("package.json");
        let bytes = self.storage.read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ignoring unreadable package.json");
                None
            }
        }
    }

    /// Resolve a path that might be a file or directory.
    fn resolve_file_or_directory(
        &self,
        target: &Path,
        tried: &mut Vec<PathBuf>,
    ) -> Result<Option<PathBuf>, ResolveError> {
        if let Some(found) = self.try_file(target.to_path_buf(), tried)? {
            return Ok(Some(found));
        }

        for ext in &self.options.extensions {
            let mut with_ext = target.as_os_str().to_owned();
            with_ext.push(ext);
            if let Some(found) = self.try_file(PathBuf::from(with_ext), tried)? {
                return Ok(Some(found));
            }
        }

        if self.storage.is_dir(target) {
            return self.resolve_index(target, tried);
        }

        Ok(None)
    }

    fn resolve_index(
        &self,
        dir: &Path,
        tried: &mut Vec<PathBuf>,
    ) -> Result<Option<PathBuf>, ResolveError> {
        for stem in &self.options.index_files {
            for ext in &self.options.extensions {
                if let Some(found) = self.try_file(dir.join(format!("{stem}{ext}")), tried)? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    fn try_file(
        &self,
        candidate: PathBuf,
        tried: &mut Vec<PathBuf>,
    ) -> Result<Option<PathBuf>, ResolveError> {
        if !self.storage.is_file(&candidate) {
            tried.push(candidate);
            return Ok(None);
        }
        self.check_case_collision(&candidate)?;
        Ok(Some(self.storage.canonicalize(&candidate)))
    }

    /// Reject a match whose directory holds several names that differ only
    /// in ASCII case.
    fn check_case_collision(&self, file: &Path) -> Result<(), ResolveError> {
        let (Some(dir), Some(name)) = (file.parent(), file.file_name()) else {
            return Ok(());
        };
        let name = name.to_string_lossy();
        let Ok(entries) = self.storage.list_dir(dir) else {
            return Ok(());
        };

        let candidates: Vec<PathBuf> = entries
            .iter()
            .filter(|entry| entry.eq_ignore_ascii_case(&name))
            .map(|entry| dir.join(entry))
            .collect();

        if candidates.len() > 1 {
            return Err(ResolveError::Ambiguous {
                specifier: file.display().to_string(),
                candidates,
            });
        }
        Ok(())
    }
}

fn external_matches(pattern: &str, specifier: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            specifier.len() >= prefix.len() + suffix.len()
                && specifier.starts_with(prefix)
                && specifier.ends_with(suffix)
        }
        None => {
            specifier == pattern
                || specifier
                    .strip_prefix(pattern)
                    .is_some_and(|rest| rest.starts_with('/'))
        }
    }
}

fn is_relative(specifier: &str) -> bool {
    specifier == "." || specifier == ".." || specifier.starts_with("./") || specifier.starts_with("../")
}

fn split_query(specifier: &str) -> (&str, Option<&str>) {
    match specifier.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (specifier, None),
    }
}

/// Parse a bare specifier into package name and subpath.
fn parse_bare_specifier(specifier: &str) -> (String, Option<String>) {
    let mut parts = specifier.splitn(if specifier.starts_with('@') { 3 } else { 2 }, '/');
    let mut name = parts.next().unwrap_or_default().to_string();
    if specifier.starts_with('@') {
        if let Some(pkg) = parts.next() {
            name = format!("{name}/{pkg}");
        }
    }
    let subpath = parts.next().filter(|s| !s.is_empty()).map(String::from);
    (name, subpath)
}

/// Resolve a package `exports` field for a subpath (`.` or `./x`).
fn resolve_exports(exports: &Value, subpath: &str) -> Option<String> {
    match exports {
        Value::String(s) if subpath == "." => Some(s.clone()),
        Value::Object(map) => {
            if let Some(value) = map.get(subpath) {
                return resolve_export_value(value);
            }
            // Conditions at the top level apply to "."
            let conditional = map.keys().all(|k| !k.starts_with('.'));
            if subpath == "." && conditional {
                return resolve_export_value(exports);
            }
            None
        }
        _ => None,
    }
}

/// Resolve a single export target, preferring `import` over `default` over
/// `require`.
fn resolve_export_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => ["import", "module", "default", "require"]
            .iter()
            .find_map(|cond| map.get(*cond).and_then(resolve_export_value)),
        Value::Array(items) => items.iter().find_map(resolve_export_value),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    /// Importer directory for relative specifiers.
    dir: Option<PathBuf>,
    specifier: String,
}

/// Memoized resolutions with a reverse index for path-based invalidation.
#[derive(Debug, Default)]
pub struct ResolveCache {
    entries: RwLock<HashMap<CacheKey, (PathBuf, ModuleId)>>,
    /// Resolved path -> keys that resolved to it.
    reverse_index: RwLock<HashMap<PathBuf, HashSet<CacheKey>>>,
}

impl ResolveCache {
    /// Create a new empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &CacheKey) -> Option<ModuleId> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|(_, id)| id.clone())
    }

    fn insert(&self, key: CacheKey, path: PathBuf, id: ModuleId) {
        self.reverse_index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.clone())
            .or_default()
            .insert(key.clone());
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, (path, id));
    }

    /// Drop every entry that could resolve differently after `path`
    /// changed: entries resolved to it, and relative lookups made from its
    /// directory (a new file can shadow an extension probe).
    ///
    /// Returns the number of entries invalidated.
    pub fn invalidate_path(&self, path: &Path) -> usize {
        let path = normalize(path);
        let parent = path.parent().map(Path::to_path_buf);

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut index = self
            .reverse_index
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut stale: HashSet<CacheKey> = index.remove(&path).unwrap_or_default();
        stale.extend(
            entries
                .keys()
                .filter(|key| key.dir.is_some() && key.dir == parent)
                .cloned(),
        );

        for key in &stale {
            if let Some((resolved, _)) = entries.remove(key) {
                if let Some(keys) = index.get_mut(&resolved) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&resolved);
                    }
                }
            }
        }

        let count = stale.len();
        if count > 0 {
            debug!(path = %path.display(), count, "invalidated resolver cache entries");
        }
        count
    }

    /// Number of cached resolutions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all cache entries.
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut index = self
            .reverse_index
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        entries.clear();
        index.clear();
    }
}
