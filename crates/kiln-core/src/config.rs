use crate::bundler::{
    BuildError, BundleFormat, DEFAULT_EXTENSIONS, EmitOptions, Loader, LoaderTable,
    ResolveOptions, SplitOptions,
};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default name of the build configuration file.
pub const CONFIG_FILE: &str = "kiln.json";

/// Runtime configuration for the kiln CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Current working directory.
    pub cwd: PathBuf,

    /// Whether to emit JSON logs.
    pub json_logs: bool,

    /// Verbosity level (0 = INFO, 1 = DEBUG, 2+ = TRACE).
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            json_logs: false,
            verbosity: 0,
        }
    }
}

impl Config {
    /// Create a new config with the given working directory.
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..Default::default()
        }
    }

    /// Set verbosity level.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set JSON log output.
    #[must_use]
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }
}

/// Build configuration, as read from `kiln.json`.
///
/// ```json
/// {
///   "entryPoints": ["src/index.jsx"],
///   "outdir": "dist",
///   "format": "esm",
///   "splitting": true,
///   "sourcemap": true,
///   "loader": { ".png": "file" },
///   "external": ["react", "node:*"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Entry modules, relative to the working directory. Order is kept.
    pub entry_points: Vec<PathBuf>,
    /// Output directory, relative to the working directory.
    pub outdir: PathBuf,
    pub format: BundleFormat,
    /// Hoist modules shared between entries into shared chunks.
    pub splitting: bool,
    pub sourcemap: bool,
    /// Produce a metafile describing inputs and outputs.
    pub metafile: bool,
    /// Write outputs to `outdir`.
    pub write: bool,
    /// Extension → loader name overrides (`".png": "base64"`).
    pub loader: BTreeMap<String, String>,
    /// Specifiers left to the runtime instead of bundled. A `*` matches
    /// any run of characters; `pkg` also matches `pkg/sub/path`.
    pub external: Vec<String>,
    /// Extensions tried for extensionless specifiers, in order.
    pub resolve_extensions: Vec<String>,
    /// Directory holding packages; `node_modules` under the working
    /// directory when unset.
    pub package_root: Option<PathBuf>,
    /// Merge shared chunks smaller than this many bytes.
    pub min_shared_chunk_bytes: Option<usize>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            entry_points: Vec::new(),
            outdir: PathBuf::from("dist"),
            format: BundleFormat::Esm,
            splitting: false,
            sourcemap: false,
            metafile: false,
            write: true,
            loader: BTreeMap::new(),
            external: Vec::new(),
            resolve_extensions: DEFAULT_EXTENSIONS.iter().map(ToString::to_string).collect(),
            package_root: None,
            min_shared_chunk_bytes: None,
        }
    }
}

impl BuildConfig {
    /// Read a configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check the configuration for contradictions.
    ///
    /// # Errors
    /// `BuildError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.entry_points.is_empty() {
            return Err(BuildError::Config(
                "at least one entry point is required".to_string(),
            ));
        }
        if self.splitting && self.format != BundleFormat::Esm {
            return Err(BuildError::Config(format!(
                "code splitting requires the esm format (got {})",
                self.format
            )));
        }
        if self.resolve_extensions.is_empty() {
            return Err(BuildError::Config(
                "resolveExtensions must not be empty".to_string(),
            ));
        }
        if let Some(pattern) = self
            .external
            .iter()
            .find(|p| p.is_empty() || p.matches('*').count() > 1)
        {
            return Err(BuildError::Config(format!(
                "invalid external pattern '{pattern}' (at most one '*')"
            )));
        }
        self.loader_table().map(|_| ())
    }

    /// Loader table with the configured overrides.
    ///
    /// # Errors
    /// `BuildError::Config` for an unknown loader name.
    pub fn loader_table(&self) -> Result<LoaderTable, BuildError> {
        self.loader
            .iter()
            .try_fold(LoaderTable::new(), |table, (ext, name)| {
                let loader: Loader = name
                    .parse()
                    .map_err(|e: String| BuildError::Config(format!("loader for {ext}: {e}")))?;
                Ok(table.with_override(ext, loader))
            })
    }

    #[must_use]
    pub fn split_options(&self) -> SplitOptions {
        SplitOptions {
            splitting: self.splitting,
            min_shared_chunk_bytes: self.min_shared_chunk_bytes,
        }
    }

    #[must_use]
    pub fn resolve_options(&self, cwd: &Path) -> ResolveOptions {
        let package_root = self
            .package_root
            .as_ref()
            .map_or_else(|| cwd.join("node_modules"), |root| cwd.join(root));
        ResolveOptions {
            extensions: self
                .resolve_extensions
                .iter()
                .map(|ext| {
                    if ext.starts_with('.') {
                        ext.clone()
                    } else {
                        format!(".{ext}")
                    }
                })
                .collect(),
            package_root: Some(package_root),
            external: self.external.clone(),
            ..ResolveOptions::default()
        }
    }

    #[must_use]
    pub fn emit_options(&self, cwd: &Path) -> EmitOptions {
        EmitOptions {
            format: self.format,
            sourcemap: self.sourcemap,
            root: cwd.to_path_buf(),
        }
    }

    /// Absolute output directory.
    #[must_use]
    pub fn outdir_path(&self, cwd: &Path) -> PathBuf {
        cwd.join(&self.outdir)
    }
}
