use crate::bundler::{BuildError, ServeError};
use std::path::PathBuf;
use thiserror::Error;

/// Core error type for kiln operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Serve(#[from] ServeError),
}

impl Error {
    /// Stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigRead { .. } | Self::ConfigParse { .. } => {
                crate::bundler::codes::BUILD_CONFIG_INVALID
            }
            Self::Build(e) => e.code(),
            Self::Serve(e) => e.code(),
        }
    }
}
