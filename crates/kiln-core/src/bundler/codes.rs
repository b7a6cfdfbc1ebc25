//! Stable error codes for the bundler.
//!
//! All codes are SCREAMING_SNAKE_CASE and stable across versions.

/// Import specifier is empty or otherwise unusable.
pub const RESOLVE_INVALID_SPECIFIER: &str = "RESOLVE_INVALID_SPECIFIER";

/// Relative specifier used without an importing module.
pub const RESOLVE_MISSING_IMPORTER: &str = "RESOLVE_MISSING_IMPORTER";

/// No candidate file exists for the specifier.
pub const RESOLVE_NOT_FOUND: &str = "RESOLVE_NOT_FOUND";

/// More than one file matches the specifier ignoring case.
pub const RESOLVE_AMBIGUOUS: &str = "RESOLVE_AMBIGUOUS";

/// Module source is not syntactically valid for its loader.
pub const PARSE_SYNTAX_INVALID: &str = "PARSE_SYNTAX_INVALID";

/// No loader is configured for the module's extension.
pub const PARSE_UNSUPPORTED_LOADER: &str = "PARSE_UNSUPPORTED_LOADER";

/// Build configuration failed validation.
pub const BUILD_CONFIG_INVALID: &str = "BUILD_CONFIG_INVALID";

/// An import could not be resolved during graph construction.
pub const BUILD_RESOLVE_FAILED: &str = "BUILD_RESOLVE_FAILED";

/// A module failed to parse during graph construction.
pub const BUILD_PARSE_FAILED: &str = "BUILD_PARSE_FAILED";

/// A module could not be read.
pub const BUILD_IO_FAILURE: &str = "BUILD_IO_FAILURE";

/// The build was abandoned by its caller.
pub const BUILD_CANCELLED: &str = "BUILD_CANCELLED";

/// An emitted chunk could not be written.
pub const EMIT_WRITE_FAILURE: &str = "EMIT_WRITE_FAILURE";

/// A requested chunk does not exist in the current snapshot.
pub const SERVE_CHUNK_NOT_FOUND: &str = "SERVE_CHUNK_NOT_FOUND";
