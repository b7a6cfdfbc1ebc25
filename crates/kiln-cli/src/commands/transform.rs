//! `kiln transform` command implementation.
//!
//! Runs one file (or stdin) through a loader and the import scanner without
//! resolving anything.

use kiln_core::bundler::{
    BundleFormat, ImportRecord, Loader, SourceMap, TransformOptions, transform,
};
use kiln_util::fs::atomic_write;
use miette::{IntoDiagnostic, Result, miette};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Current schema version of the `--json` output.
pub const TRANSFORM_SCHEMA_VERSION: u32 = 1;

/// Transform command action.
#[derive(Debug, Clone)]
pub struct TransformAction {
    pub cwd: PathBuf,
    /// Input file; stdin when `None`.
    pub input: Option<PathBuf>,
    pub loader: Option<Loader>,
    pub format: Option<BundleFormat>,
    pub sourcemap: bool,
    pub sourcefile: Option<String>,
    pub outfile: Option<PathBuf>,
}

impl TransformAction {
    /// Transform options: an explicit loader wins, then the input extension.
    fn options(&self) -> TransformOptions {
        let loader = self.loader.unwrap_or_else(|| {
            self.input
                .as_deref()
                .and_then(Path::extension)
                .and_then(|ext| Loader::for_extension(&ext.to_string_lossy()))
                .unwrap_or(Loader::Js)
        });
        let sourcefile = self.sourcefile.clone().or_else(|| {
            self.input
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned())
        });
        TransformOptions {
            loader,
            format: self.format,
            sourcemap: self.sourcemap,
            sourcefile,
        }
    }
}

#[derive(Serialize)]
struct TransformResultJson<'a> {
    schema_version: u32,
    ok: bool,
    loader: &'static str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    map: Option<&'a SourceMap>,
    imports: Vec<ImportJson<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outfile: Option<String>,
}

#[derive(Serialize)]
struct ImportJson<'a> {
    specifier: &'a str,
    kind: &'static str,
    line: u32,
}

impl<'a> From<&'a ImportRecord> for ImportJson<'a> {
    fn from(record: &'a ImportRecord) -> Self {
        Self {
            specifier: &record.specifier,
            kind: record.kind.as_str(),
            line: record.line,
        }
    }
}

#[derive(Serialize)]
struct TransformErrorResult {
    schema_version: u32,
    ok: bool,
    error: TransformErrorJson,
}

#[derive(Serialize)]
struct TransformErrorJson {
    code: String,
    message: String,
}

/// Run the transform command.
pub fn run(action: TransformAction, json: bool) -> Result<()> {
    let source = read_input(&action)?;
    let options = action.options();

    let output = match transform(&source, &options) {
        Ok(output) => output,
        Err(e) => {
            if json {
                let result = TransformErrorResult {
                    schema_version: TRANSFORM_SCHEMA_VERSION,
                    ok: false,
                    error: TransformErrorJson {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    },
                };
                println!("{}", serde_json::to_string(&result).into_diagnostic()?);
                std::process::exit(1);
            }
            return Err(miette!("{}: {e}", e.code()));
        }
    };

    let outfile = action.outfile.as_ref().map(|p| action.cwd.join(p));
    if let Some(path) = &outfile {
        write_output(path, &output.code, output.map.as_ref())?;
    }

    if json {
        let result = TransformResultJson {
            schema_version: TRANSFORM_SCHEMA_VERSION,
            ok: true,
            loader: options.loader.name(),
            code: &output.code,
            map: output.map.as_ref(),
            imports: output.imports.iter().map(ImportJson::from).collect(),
            outfile: outfile.map(|p| p.display().to_string()),
        };
        println!("{}", serde_json::to_string(&result).into_diagnostic()?);
    } else if outfile.is_none() {
        print!("{}", output.code);
    }
    Ok(())
}

fn read_input(action: &TransformAction) -> Result<String> {
    match &action.input {
        Some(path) => {
            let path = action.cwd.join(path);
            std::fs::read_to_string(&path)
                .map_err(|e| miette!("failed to read {}: {e}", path.display()))
        }
        None => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .into_diagnostic()?;
            Ok(source)
        }
    }
}

/// Write the code, and its map next to it with a `sourceMappingURL` comment.
fn write_output(path: &Path, code: &str, map: Option<&SourceMap>) -> Result<()> {
    let mut code = code.to_string();
    if let Some(map) = map {
        let map_path = PathBuf::from(format!("{}.map", path.display()));
        let map_name = map_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        code.push_str(&format!("//# sourceMappingURL={map_name}\n"));
        atomic_write(&map_path, map.to_json().as_bytes()).into_diagnostic()?;
    }
    atomic_write(path, code.as_bytes()).into_diagnostic()
}
