//! `kiln build` command implementation.

use kiln_core::bundler::BundleFormat;
use kiln_core::{BuildConfig, BuildResult, CONFIG_FILE, Engine, Error, WriteStatus};
use kiln_util::fs::atomic_write;
use kiln_util::path::display_relative;
use miette::{IntoDiagnostic, Result, miette};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Current schema version of the `--json` output.
pub const BUILD_SCHEMA_VERSION: u32 = 1;

/// Name of the metafile written into the output directory.
pub const METAFILE_NAME: &str = "metafile.json";

/// Build command action.
#[derive(Debug, Clone)]
pub struct BuildAction {
    pub cwd: PathBuf,
    /// Explicit config file; `kiln.json` is used when present otherwise.
    pub config_file: Option<PathBuf>,
    pub entries: Vec<PathBuf>,
    pub outdir: Option<PathBuf>,
    pub format: Option<BundleFormat>,
    pub splitting: bool,
    pub sourcemap: bool,
    pub metafile: bool,
    pub no_write: bool,
    /// `EXT=LOADER` overrides.
    pub loaders: Vec<String>,
    /// Patterns added to the configured externals.
    pub external: Vec<String>,
}

impl BuildAction {
    /// Load the config file (if any) and apply the command-line overrides.
    fn build_config(&self) -> Result<BuildConfig, Error> {
        let mut config = match &self.config_file {
            Some(path) => BuildConfig::load(&self.cwd.join(path))?,
            None => {
                let default = self.cwd.join(CONFIG_FILE);
                if default.is_file() {
                    BuildConfig::load(&default)?
                } else {
                    BuildConfig::default()
                }
            }
        };

        if !self.entries.is_empty() {
            config.entry_points.clone_from(&self.entries);
        }
        if let Some(outdir) = &self.outdir {
            config.outdir.clone_from(outdir);
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        config.splitting |= self.splitting;
        config.sourcemap |= self.sourcemap;
        config.metafile |= self.metafile;
        if self.no_write {
            config.write = false;
        }
        for pair in &self.loaders {
            let (ext, loader) = pair.split_once('=').ok_or_else(|| {
                kiln_core::bundler::BuildError::Config(format!(
                    "invalid --loader '{pair}' (expected EXT=LOADER)"
                ))
            })?;
            config
                .loader
                .insert(ext.trim().to_string(), loader.trim().to_string());
        }
        for pattern in &self.external {
            if !config.external.contains(pattern) {
                config.external.push(pattern.clone());
            }
        }
        Ok(config)
    }
}

/// Build result for JSON output.
#[derive(Serialize)]
struct BuildResultJson {
    schema_version: u32,
    cwd: String,
    ok: bool,
    generation: u64,
    modules: usize,
    outputs: Vec<OutputJson>,
    assets: Vec<AssetJson>,
    /// Module → chunk ids.
    manifest: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metafile: Option<String>,
    duration_ms: u64,
    notes: Vec<String>,
}

#[derive(Serialize)]
struct OutputJson {
    id: String,
    kind: &'static str,
    path: String,
    bytes: usize,
    sourcemap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<String>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<BuildErrorJson>,
}

#[derive(Serialize)]
struct AssetJson {
    path: String,
    source: String,
    bytes: usize,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<BuildErrorJson>,
}

#[derive(Serialize)]
struct BuildErrorJson {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    module: Option<String>,
}

/// Build error result for JSON output.
#[derive(Serialize)]
struct BuildErrorResult {
    schema_version: u32,
    cwd: String,
    ok: bool,
    error: BuildErrorJson,
    notes: Vec<String>,
}

/// Run the build command.
pub fn run(action: BuildAction, json: bool) -> Result<()> {
    let start = Instant::now();

    let outcome = action.build_config().and_then(|config| {
        let engine = Engine::new(&action.cwd, config)?;
        let result = engine.build()?;
        Ok((engine, result))
    });

    let (engine, result) = match outcome {
        Ok(built) => built,
        Err(e) => return report_error(&action.cwd, &e, json),
    };

    let cwd = engine.cwd();
    let mut notes = Vec::new();
    let mut ok = result.is_complete();
    let metafile_path = match write_metafile(&engine, &result) {
        Ok(path) => path,
        Err(e) => {
            ok = false;
            notes.push(format!("failed to write {METAFILE_NAME}: {e}"));
            None
        }
    };
    if !engine.config().write {
        notes.push("--no-write: no files were written".to_string());
    }
    let duration_ms = start.elapsed().as_millis() as u64;

    if json {
        let output = BuildResultJson {
            schema_version: BUILD_SCHEMA_VERSION,
            cwd: cwd.display().to_string(),
            ok,
            generation: result.generation,
            modules: result.modules,
            outputs: result
                .chunks
                .iter()
                .map(|chunk| OutputJson {
                    id: chunk.id.clone(),
                    kind: chunk.kind.as_str(),
                    path: display_relative(&chunk.path, cwd),
                    bytes: chunk.bytes,
                    sourcemap: chunk.has_source_map,
                    entry: chunk.entry.clone(),
                    status: chunk.status.as_str(),
                    error: write_error(&chunk.status),
                })
                .collect(),
            assets: result
                .assets
                .iter()
                .map(|asset| AssetJson {
                    path: display_relative(&asset.path, cwd),
                    source: asset.source.clone(),
                    bytes: asset.bytes,
                    status: asset.status.as_str(),
                    error: write_error(&asset.status),
                })
                .collect(),
            manifest: result.manifest.clone(),
            metafile: metafile_path.map(|p| display_relative(&p, cwd)),
            duration_ms,
            notes,
        };
        println!("{}", serde_json::to_string(&output).into_diagnostic()?);
    } else {
        print_human_output(cwd, &result, metafile_path.as_deref(), &notes, duration_ms);
    }

    if ok {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn write_error(status: &WriteStatus) -> Option<BuildErrorJson> {
    match status {
        WriteStatus::Failed(e) => Some(BuildErrorJson {
            code: e.code().to_string(),
            message: e.to_string(),
            module: None,
        }),
        _ => None,
    }
}

/// Write the metafile when the build produced one and writing is enabled.
fn write_metafile(engine: &Engine, result: &BuildResult) -> std::io::Result<Option<PathBuf>> {
    let config = engine.config();
    let Some(metafile) = result.metafile.as_ref().filter(|_| config.write) else {
        return Ok(None);
    };
    let path = config.outdir_path(engine.cwd()).join(METAFILE_NAME);
    atomic_write(&path, metafile.to_json().as_bytes())?;
    Ok(Some(path))
}

fn report_error(cwd: &Path, error: &Error, json: bool) -> Result<()> {
    if json {
        let module = match error {
            Error::Build(e) => e.module().map(ToString::to_string),
            _ => None,
        };
        let result = BuildErrorResult {
            schema_version: BUILD_SCHEMA_VERSION,
            cwd: cwd.display().to_string(),
            ok: false,
            error: BuildErrorJson {
                code: error.code().to_string(),
                message: error.to_string(),
                module,
            },
            notes: Vec::new(),
        };
        println!("{}", serde_json::to_string(&result).into_diagnostic()?);
        std::process::exit(1);
    }
    Err(miette!("{}: {error}", error.code()))
}

fn print_human_output(
    cwd: &Path,
    result: &BuildResult,
    metafile: Option<&Path>,
    notes: &[String],
    duration_ms: u64,
) {
    for chunk in &result.chunks {
        let symbol = match chunk.status {
            WriteStatus::Failed(_) => "\u{2717}", // ✗
            _ => "\u{2713}",                      // ✓
        };
        let map = if chunk.has_source_map { " (+map)" } else { "" };
        println!(
            "{symbol} {} {} bytes [{}]{map}",
            display_relative(&chunk.path, cwd),
            chunk.bytes,
            chunk.kind.as_str()
        );
        if let WriteStatus::Failed(e) = &chunk.status {
            eprintln!("  error: {}: {e}", e.code());
        }
    }
    for asset in &result.assets {
        let symbol = match asset.status {
            WriteStatus::Failed(_) => "\u{2717}",
            _ => "\u{2713}",
        };
        println!(
            "{symbol} {} {} bytes [asset]",
            display_relative(&asset.path, cwd),
            asset.bytes
        );
        if let WriteStatus::Failed(e) = &asset.status {
            eprintln!("  error: {}: {e}", e.code());
        }
    }
    if let Some(path) = metafile {
        println!("  metafile: {}", display_relative(path, cwd));
    }
    for note in notes {
        println!("  note: {note}");
    }

    println!();
    println!(
        "{} modules, {} chunks in {duration_ms}ms",
        result.modules,
        result.chunks.len()
    );
}
