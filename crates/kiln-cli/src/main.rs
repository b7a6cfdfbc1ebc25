#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]

mod commands;
mod logging;

use clap::Parser;
use kiln_core::Config;
use kiln_core::bundler::{BundleFormat, Loader};
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about = "A multi-entry JavaScript/TypeScript bundler", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Bundle entry points into an output directory
    Build {
        /// Entry modules (override `entryPoints` from the config file)
        entries: Vec<PathBuf>,

        /// Config file (default: kiln.json in the working directory, if present)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Output directory
        #[arg(long, value_name = "DIR")]
        outdir: Option<PathBuf>,

        /// Output format: esm, cjs or iife
        #[arg(long)]
        format: Option<BundleFormat>,

        /// Put modules shared between entries into shared chunks
        #[arg(long)]
        splitting: bool,

        /// Write a source map next to each chunk
        #[arg(long)]
        sourcemap: bool,

        /// Write metafile.json describing inputs and outputs
        #[arg(long)]
        metafile: bool,

        /// Build without writing any files
        #[arg(long)]
        no_write: bool,

        /// Loader override for an extension, e.g. `.png=dataurl` (repeatable)
        #[arg(long, value_name = "EXT=LOADER")]
        loader: Vec<String>,

        /// Leave a specifier to the runtime, e.g. `react` or `node:*` (repeatable)
        #[arg(long, value_name = "PATTERN")]
        external: Vec<String>,
    },

    /// Transform a single file without bundling
    Transform {
        /// Input file (stdin when omitted)
        input: Option<PathBuf>,

        /// Loader (default: from the input extension, else js)
        #[arg(long)]
        loader: Option<Loader>,

        /// Convert module syntax to this format
        #[arg(long)]
        format: Option<BundleFormat>,

        /// Produce a source map
        #[arg(long)]
        sourcemap: bool,

        /// File name recorded in the source map
        #[arg(long, value_name = "NAME")]
        sourcefile: Option<String>,

        /// Write the output (and its map) here instead of stdout
        #[arg(long, short, value_name = "FILE")]
        outfile: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine working directory
    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let config = Config::new(cwd.clone())
        .with_verbosity(cli.verbose)
        .with_json_logs(cli.json);

    logging::init(config.verbosity, config.json_logs);

    match cli.command {
        Some(Commands::Version) | None => commands::version::run(config.json_logs),
        Some(Commands::Build {
            entries,
            config: config_file,
            outdir,
            format,
            splitting,
            sourcemap,
            metafile,
            no_write,
            loader,
            external,
        }) => {
            let span = tracing::info_span!("build", cmd = "build", cwd = %cwd.display());
            let _guard = span.enter();
            let action = commands::build::BuildAction {
                cwd,
                config_file,
                entries,
                outdir,
                format,
                splitting,
                sourcemap,
                metafile,
                no_write,
                loaders: loader,
                external,
            };
            commands::build::run(action, config.json_logs)
        }
        Some(Commands::Transform {
            input,
            loader,
            format,
            sourcemap,
            sourcefile,
            outfile,
        }) => {
            let action = commands::transform::TransformAction {
                cwd,
                input,
                loader,
                format,
                sourcemap,
                sourcefile,
                outfile,
            };
            commands::transform::run(action, config.json_logs)
        }
    }
}
