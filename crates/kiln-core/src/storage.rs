//! Storage collaborator.
//!
//! The bundler reads sources, probes directories and writes chunks only
//! through [`Storage`], so builds can run against the real filesystem or an
//! in-memory tree.

use kiln_util::fs::atomic_write;
use kiln_util::path::normalize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Filesystem-like backend used by the resolver, builder and emitter.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Read a whole file.
    ///
    /// # Errors
    /// Returns an error if the file does not exist or cannot be read.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Replace a file's contents, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    /// Whether `path` is an existing file.
    fn is_file(&self, path: &Path) -> bool;

    /// Whether `path` is an existing directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Names of the entries directly inside `path`, sorted.
    ///
    /// # Errors
    /// Returns an error if `path` is not a readable directory.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Canonical form of an existing path. Defaults to lexical
    /// normalization.
    fn canonicalize(&self, path: &Path) -> PathBuf {
        normalize(path)
    }
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

impl Storage for FsStorage {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        atomic_write(path, bytes)
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    fn canonicalize(&self, path: &Path) -> PathBuf {
        dunce::canonicalize(path).unwrap_or_else(|_| normalize(path))
    }
}

/// In-memory file tree. Directories exist implicitly as prefixes of files.
#[derive(Default)]
pub struct MemoryStorage {
    files: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
    reads: RwLock<BTreeMap<PathBuf, usize>>,
}

impl MemoryStorage {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tree holding the given files.
    #[must_use]
    pub fn with_files<P, C>(files: impl IntoIterator<Item = (P, C)>) -> Self
    where
        P: AsRef<Path>,
        C: AsRef<[u8]>,
    {
        let storage = Self::new();
        for (path, contents) in files {
            storage.set(path, contents);
        }
        storage
    }

    /// Create or replace a file.
    pub fn set(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize(path.as_ref()), contents.as_ref().to_vec());
    }

    /// Delete a file. Returns whether it existed.
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&normalize(path.as_ref()))
            .is_some()
    }

    /// Current contents of a file.
    #[must_use]
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize(path.as_ref()))
            .cloned()
    }

    /// Number of successful reads of `path` so far.
    #[must_use]
    pub fn read_count(&self, path: impl AsRef<Path>) -> usize {
        self.reads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&normalize(path.as_ref()))
            .copied()
            .unwrap_or(0)
    }
}

impl fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemoryStorage")
            .field("files", &files.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let path = normalize(path);
        let bytes = self
            .files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path)
            .cloned()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such file: {}", path.display()),
                )
            })?;
        *self
            .reads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path)
            .or_default() += 1;
        Ok(bytes)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.set(path, bytes);
        Ok(())
    }

    fn is_file(&self, path: &Path) -> bool {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&normalize(path))
    }

    fn is_dir(&self, path: &Path) -> bool {
        let dir = normalize(path);
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|file| file != &dir && file.starts_with(&dir))
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let dir = normalize(path);
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = files
            .keys()
            .filter(|file| *file != &dir)
            .filter_map(|file| file.strip_prefix(&dir).ok())
            .filter_map(|rest| rest.components().next())
            .map(|first| first.as_os_str().to_string_lossy().into_owned())
            .collect();
        if names.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such directory: {}", dir.display()),
            ));
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}
