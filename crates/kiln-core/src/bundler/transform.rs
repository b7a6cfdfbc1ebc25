//! Single-file transform.
//!
//! Runs one loader over a source string, validates the result with the
//! import parser and optionally converts ES module syntax into a CommonJS or
//! IIFE body. No other files are read.

use super::emit::{BundleFormat, runtime_prelude};
use super::error::ParseError;
use super::graph::ModuleId;
use super::loader::Loader;
use super::rewrite::{RewriteContext, rewrite_module};
use super::scan::{ImportParser, ImportRecord};
use super::sourcemap::{SourceMap, SourceMapBuilder};
use std::path::Path;

/// Transform options.
#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub loader: Loader,
    /// Convert module syntax for this format; `None` leaves it as is.
    pub format: Option<BundleFormat>,
    pub sourcemap: bool,
    /// Name used in the source map and for data loaders' MIME type.
    pub sourcefile: Option<String>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            loader: Loader::Js,
            format: None,
            sourcemap: false,
            sourcefile: None,
        }
    }
}

/// Result of a transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub code: String,
    pub map: Option<SourceMap>,
    /// Imports found in the loaded code.
    pub imports: Vec<ImportRecord>,
}

/// Leaves specifiers untouched: there is no graph to resolve against.
struct Unresolved;

impl RewriteContext for Unresolved {
    fn module_key(&self, specifier: &str) -> Option<String> {
        Some(specifier.to_string())
    }

    fn dynamic_import(&self, _specifier: &str) -> Option<String> {
        None
    }
}

/// Transform `source` with `parser` validating the loaded code.
///
/// # Errors
/// `ParseError::SyntaxInvalid` when the loader or the parser rejects the
/// input.
pub fn transform_with(
    parser: &dyn ImportParser,
    source: &str,
    options: &TransformOptions,
) -> Result<TransformOutput, ParseError> {
    let sourcefile = options
        .sourcefile
        .clone()
        .unwrap_or_else(|| format!("<stdin>.{}", default_extension(options.loader)));
    let id = ModuleId::from_path(Path::new(&sourcefile));

    let loaded = options.loader.load(&id, source.as_bytes())?;
    let imports = parser.parse(&id, options.loader, &loaded)?;

    let mut lines: Vec<String> = Vec::new();
    // Index in `lines` of the first line of module code
    let body_start;
    match options.format {
        None | Some(BundleFormat::Esm) => {
            body_start = 0;
            lines.extend(loaded.lines().map(str::to_string));
        }
        Some(format) => {
            let rewritten = rewrite_module(&loaded, options.loader.allows_jsx(), &Unresolved)?;
            let iife = format == BundleFormat::Iife;
            if iife {
                lines.push("(function () {".to_string());
            }
            let needs_runtime = rewritten.header.is_some()
                || rewritten.lines.iter().any(|l| l.contains("__kiln."));
            if needs_runtime {
                lines.extend(runtime_prelude(false).lines().map(str::to_string));
            }
            if iife && rewritten.header.is_some() {
                lines.push("var module = { exports: {} }, exports = module.exports;".to_string());
            }
            lines.extend(rewritten.header);
            body_start = lines.len();
            lines.extend(rewritten.lines);
            if iife {
                lines.push("})();".to_string());
            }
        }
    }

    let map = options.sourcemap.then(|| {
        let mut builder = SourceMapBuilder::new();
        let idx = builder.add_source(&sourcefile, source);
        let source_lines = u32::try_from(source.lines().count()).unwrap_or(u32::MAX);
        let body_lines = loaded.lines().count();
        for i in 0..body_lines {
            let out_line = u32::try_from(body_start + i).unwrap_or(u32::MAX);
            let src_line = u32::try_from(i).unwrap_or(u32::MAX);
            // Data loaders collapse the input onto one line
            builder.add_line_mapping(out_line, idx, src_line.min(source_lines.saturating_sub(1)));
        }
        let file = Path::new(&sourcefile)
            .file_name()
            .map_or_else(|| sourcefile.clone(), |f| f.to_string_lossy().into_owned());
        builder.build(&file)
    });

    let mut code = lines.join("\n");
    if !code.is_empty() {
        code.push('\n');
    }
    Ok(TransformOutput { code, map, imports })
}

fn default_extension(loader: Loader) -> &'static str {
    match loader {
        Loader::Js => "js",
        Loader::Jsx => "jsx",
        Loader::Ts => "ts",
        Loader::Tsx => "tsx",
        Loader::Json => "json",
        Loader::Css => "css",
        Loader::Text
        | Loader::Base64
        | Loader::Binary
        | Loader::DataUrl
        | Loader::File
        | Loader::Empty => "txt",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::scan::{ImportKind, Scanner};

    fn run(source: &str, options: &TransformOptions) -> Result<TransformOutput, ParseError> {
        transform_with(&Scanner, source, options)
    }

    #[test]
    fn test_tsx_passes_through_with_map() {
        let source = "const isNull = (str: string): boolean => str.length > 0;";
        let out = run(
            source,
            &TransformOptions {
                loader: Loader::Tsx,
                sourcemap: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(out.code, format!("{source}\n"));
        let map = out.map.unwrap();
        assert_eq!(map.sources, vec!["<stdin>.tsx"]);
        assert_eq!(map.sources_content, vec![source]);
        assert_eq!(map.mappings, "AAAA");
    }

    #[test]
    fn test_invalid_source_is_rejected() {
        let err = run("function f( {", &TransformOptions::default()).unwrap_err();
        assert!(matches!(err, ParseError::SyntaxInvalid { .. }));

        let err = run(
            "{ \"a\": ",
            &TransformOptions {
                loader: Loader::Json,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::SyntaxInvalid { .. }));
    }

    #[test]
    fn test_cjs_format_rewrites_modules() {
        let source = "import { a } from './a';\nexport const b = a + 1;\n";
        let out = run(
            source,
            &TransformOptions {
                format: Some(BundleFormat::Cjs),
                sourcemap: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(out.code.starts_with("var __kiln = (function (host) {"));
        assert!(out.code.contains("__kiln.esm(exports, { b: () => b });\n"));
        assert!(out
            .code
            .contains("const __kiln_m0 = __kiln.interop(require(\"./a\"));\nconst b = __kiln_m0.a + 1;\n"));
        assert_eq!(out.imports.len(), 1);
        assert_eq!(out.imports[0].kind, ImportKind::Static);

        // Body lines are mapped after the runtime and header
        let first_body = out
            .code
            .lines()
            .position(|l| l.starts_with("const __kiln_m0"))
            .unwrap();
        let map = out.map.unwrap();
        let segments: Vec<&str> = map.mappings.split(';').collect();
        assert_eq!(segments.len(), first_body + 2);
        assert!(!segments[first_body].is_empty());
        assert!(segments[first_body - 1].is_empty());
    }

    #[test]
    fn test_iife_wraps_script() {
        let out = run(
            "console.log(1);\n",
            &TransformOptions {
                format: Some(BundleFormat::Iife),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(out.code, "(function () {\nconsole.log(1);\n})();\n");
    }

    #[test]
    fn test_data_loader() {
        let out = run(
            "hello",
            &TransformOptions {
                loader: Loader::Text,
                format: Some(BundleFormat::Cjs),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(out.code.contains("exports.default = \"hello\";"));
    }
}
