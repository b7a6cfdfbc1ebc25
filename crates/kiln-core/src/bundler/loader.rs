//! Loader dispatch.
//!
//! Maps a module's extension to one of a closed set of loaders and turns the
//! module's raw bytes into JavaScript source.

use super::assets::asset_file_name;
use super::error::ParseError;
use super::graph::ModuleId;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use kiln_util::hash::ContentHash;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Loader {
    Js,
    Jsx,
    Ts,
    Tsx,
    Json,
    Text,
    Css,
    Base64,
    Binary,
    DataUrl,
    /// Copied to the output directory; the module exports its URL.
    File,
    Empty,
}

impl Loader {
    /// All loaders, for help text and validation.
    pub const ALL: [Loader; 12] = [
        Self::Js,
        Self::Jsx,
        Self::Ts,
        Self::Tsx,
        Self::Json,
        Self::Text,
        Self::Css,
        Self::Base64,
        Self::Binary,
        Self::DataUrl,
        Self::File,
        Self::Empty,
    ];

    /// Loader name as used in configuration.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Js => "js",
            Self::Jsx => "jsx",
            Self::Ts => "ts",
            Self::Tsx => "tsx",
            Self::Json => "json",
            Self::Text => "text",
            Self::Css => "css",
            Self::Base64 => "base64",
            Self::Binary => "binary",
            Self::DataUrl => "dataurl",
            Self::File => "file",
            Self::Empty => "empty",
        }
    }

    /// Built-in loader for an extension (without the dot).
    #[must_use]
    pub fn for_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "js" | "mjs" | "cjs" => Some(Self::Js),
            "jsx" => Some(Self::Jsx),
            "ts" | "mts" | "cts" => Some(Self::Ts),
            "tsx" => Some(Self::Tsx),
            "json" => Some(Self::Json),
            "txt" => Some(Self::Text),
            "css" => Some(Self::Css),
            _ => None,
        }
    }

    /// Whether the loader's output is scanned for imports.
    #[must_use]
    pub fn is_script(self) -> bool {
        matches!(self, Self::Js | Self::Jsx | Self::Ts | Self::Tsx)
    }

    /// Whether the source may contain JSX text, where quotes and slashes are
    /// not string or regex delimiters.
    #[must_use]
    pub fn allows_jsx(self) -> bool {
        matches!(self, Self::Jsx | Self::Tsx)
    }

    /// Whether the module is also emitted as a separate output file.
    #[must_use]
    pub fn emits_asset(self) -> bool {
        matches!(self, Self::File)
    }

    /// Turn raw module bytes into JavaScript source.
    ///
    /// Script loaders pass the text through; data loaders wrap the content
    /// in a single `export default`.
    ///
    /// # Errors
    /// `ParseError::SyntaxInvalid` when a text loader gets bytes that are
    /// not UTF-8, or the JSON loader gets invalid JSON.
    pub fn load(self, id: &ModuleId, bytes: &[u8]) -> Result<String, ParseError> {
        match self {
            Self::Js | Self::Jsx | Self::Ts | Self::Tsx => Ok(utf8(bytes)?.to_string()),
            Self::Json => {
                let value: serde_json::Value = serde_json::from_str(utf8(bytes)?).map_err(|e| {
                    ParseError::syntax(u32::try_from(e.line()).unwrap_or(u32::MAX), e.to_string())
                })?;
                Ok(format!("export default {value};\n"))
            }
            Self::Text => Ok(format!("export default {};\n", js_string(utf8(bytes)?))),
            Self::Css => Ok(format!(
                "const css = {};\nif (typeof document !== \"undefined\") document.head.appendChild(Object.assign(document.createElement(\"style\"), {{ textContent: css }}));\nexport default css;\n",
                js_string(utf8(bytes)?)
            )),
            Self::Base64 => Ok(format!(
                "export default {};\n",
                js_string(&BASE64.encode(bytes))
            )),
            Self::Binary => Ok(format!(
                "export default Uint8Array.from(atob({}), (c) => c.charCodeAt(0));\n",
                js_string(&BASE64.encode(bytes))
            )),
            Self::File => {
                let name = asset_file_name(id, &ContentHash::of(bytes));
                Ok(format!("export default {};\n", js_string(&format!("./{name}"))))
            }
            Self::DataUrl => {
                let mime = mime_for(id.extension().unwrap_or_default());
                let url = format!("data:{mime};base64,{}", BASE64.encode(bytes));
                Ok(format!("export default {};\n", js_string(&url)))
            }
            Self::Empty => Ok(String::new()),
        }
    }
}

impl fmt::Display for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Loader {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|l| l.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|l| l.name()).collect();
                format!("unknown loader '{s}' (expected one of: {})", names.join(", "))
            })
    }
}

/// Extension → loader table: built-in defaults plus configured overrides.
#[derive(Debug, Clone, Default)]
pub struct LoaderTable {
    overrides: HashMap<String, Loader>,
}

impl LoaderTable {
    /// Create a table with only the built-in defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the loader for an extension. A leading dot is optional.
    #[must_use]
    pub fn with_override(mut self, ext: &str, loader: Loader) -> Self {
        self.overrides
            .insert(ext.trim_start_matches('.').to_ascii_lowercase(), loader);
        self
    }

    /// Select the loader for a module.
    pub fn loader_for(&self, id: &ModuleId) -> Result<Loader, ParseError> {
        let ext = id.extension().unwrap_or_default().to_ascii_lowercase();
        self.overrides
            .get(&ext)
            .copied()
            .or_else(|| Loader::for_extension(&ext))
            .ok_or(ParseError::UnsupportedLoader {
                extension: format!(".{ext}"),
            })
    }
}

/// Decode UTF-8, reporting the line of the first invalid byte.
fn utf8(bytes: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(bytes).map_err(|e| {
        let valid = &bytes[..e.valid_up_to()];
        let line = valid.iter().filter(|&&b| b == b'\n').count() + 1;
        ParseError::syntax(u32::try_from(line).unwrap_or(u32::MAX), "invalid UTF-8")
    })
}

/// Quote a string as a JavaScript string literal.
pub(crate) fn js_string(s: &str) -> String {
    // JSON string syntax is a subset of JavaScript's, except for U+2028/9
    serde_json::Value::String(s.to_string())
        .to_string()
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

pub(crate) fn mime_for(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain",
        "css" => "text/css",
        "json" => "application/json",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}
