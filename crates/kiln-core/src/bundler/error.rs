//! Bundler error taxonomy.
//!
//! Every error carries a stable code (see [`super::codes`]) so the CLI can
//! report failures as machine-readable JSON.

use super::codes;
use super::graph::ModuleId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to map a specifier to a module.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid import specifier '{specifier}'")]
    InvalidSpecifier { specifier: String },

    #[error("relative specifier '{specifier}' has no importing module")]
    MissingImporter { specifier: String },

    #[error("cannot resolve '{specifier}'{}", from_suffix(.from.as_ref()))]
    NotFound {
        specifier: String,
        from: Option<ModuleId>,
        tried: Vec<PathBuf>,
    },

    #[error("'{specifier}' is ambiguous: {} files differ only in case", .candidates.len())]
    Ambiguous {
        specifier: String,
        candidates: Vec<PathBuf>,
    },
}

fn from_suffix(from: Option<&ModuleId>) -> String {
    from.map(|id| format!(" from '{id}'")).unwrap_or_default()
}

impl ResolveError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSpecifier { .. } => codes::RESOLVE_INVALID_SPECIFIER,
            Self::MissingImporter { .. } => codes::RESOLVE_MISSING_IMPORTER,
            Self::NotFound { .. } => codes::RESOLVE_NOT_FOUND,
            Self::Ambiguous { .. } => codes::RESOLVE_AMBIGUOUS,
        }
    }
}

/// Failure to turn module bytes into scanned source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("syntax error on line {line}: {message}")]
    SyntaxInvalid { line: u32, message: String },

    #[error("no loader configured for extension '{extension}'")]
    UnsupportedLoader { extension: String },
}

impl ParseError {
    pub(crate) fn syntax(line: u32, message: impl Into<String>) -> Self {
        Self::SyntaxInvalid {
            line,
            message: message.into(),
        }
    }

    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SyntaxInvalid { .. } => codes::PARSE_SYNTAX_INVALID,
            Self::UnsupportedLoader { .. } => codes::PARSE_UNSUPPORTED_LOADER,
        }
    }
}

/// Failure of a whole build. Builds never return partial graphs.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid build config: {0}")]
    Config(String),

    #[error("{source}")]
    Resolve {
        importer: Option<ModuleId>,
        #[source]
        source: ResolveError,
    },

    #[error("failed to parse '{module}': {source}")]
    ParseFailed {
        module: ModuleId,
        #[source]
        source: ParseError,
    },

    #[error("failed to read '{module}': {source}")]
    Io {
        module: ModuleId,
        #[source]
        source: io::Error,
    },

    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => codes::BUILD_CONFIG_INVALID,
            Self::Resolve { .. } => codes::BUILD_RESOLVE_FAILED,
            Self::ParseFailed { .. } => codes::BUILD_PARSE_FAILED,
            Self::Io { .. } => codes::BUILD_IO_FAILURE,
            Self::Cancelled => codes::BUILD_CANCELLED,
        }
    }

    /// The module the failure is attributed to, if any.
    #[must_use]
    pub fn module(&self) -> Option<&ModuleId> {
        match self {
            Self::Resolve { importer, .. } => importer.as_ref(),
            Self::ParseFailed { module, .. } | Self::Io { module, .. } => Some(module),
            Self::Config(_) | Self::Cancelled => None,
        }
    }
}

/// Failure to persist an emitted chunk.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to write '{}': {source}", .path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl EmitError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::WriteFailure { .. } => codes::EMIT_WRITE_FAILURE,
        }
    }
}

/// Failure of a live-serve request.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("no chunk named '{0}' in the current build")]
    UnknownChunk(String),
}

impl ServeError {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Build(e) => e.code(),
            Self::UnknownChunk(_) => codes::SERVE_CHUNK_NOT_FOUND,
        }
    }
}
