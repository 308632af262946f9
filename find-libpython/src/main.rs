//! Locate the libpython associated with a Python interpreter.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::debug;

use pynet_common::config::PYDLL_VAR;
use pynet_common::sysconfig::BuildConfig;

#[cfg(windows)]
const DEFAULT_PYTHON: &str = "python";
#[cfg(not(windows))]
const DEFAULT_PYTHON: &str = "python3";

/// find-libpython command line arguments.
#[derive(Parser, Debug)]
#[command(name = "find-libpython")]
#[command(about = "Locate libpython associated with a Python executable")]
struct Args {
    /// Print debugging information
    #[arg(short, long)]
    verbose: bool,

    /// Print list of all paths found
    #[arg(long, group = "op")]
    list_all: bool,

    /// Print list of candidate names of libpython
    #[arg(long, group = "op")]
    candidate_names: bool,

    /// Print list of candidate paths of libpython
    #[arg(long, group = "op")]
    candidate_paths: bool,

    /// Print as an environment export expression
    #[arg(long, group = "op")]
    export: bool,

    /// Interpreter whose libpython to look for
    #[arg(long, value_name = "PATH", default_value = DEFAULT_PYTHON)]
    python: PathBuf,
}

fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args = Args::parse();

    setup_tracing(args.verbose);

    let config = BuildConfig::from_interpreter(&args.python)?;
    debug!(python = %args.python.display(), version = %config.version, "queried interpreter");

    let search = pynet::libpython::search_interpreter(config);

    if args.list_all {
        search.finding().for_each(|path| println!("{}", path.display()));
    } else if args.candidate_names {
        search.candidate_names().for_each(|name| println!("{}", name));
    } else if args.candidate_paths {
        search
            .candidate_paths()
            .filter(|path| path.is_absolute())
            .for_each(|path| println!("{}", path.display()));
    } else {
        let Some(path) = search.find() else {
            return Ok(ExitCode::FAILURE);
        };
        println!("{}", render(&path, args.export));
    }

    Ok(ExitCode::SUCCESS)
}

fn render(path: &Path, export: bool) -> String {
    if export {
        format!("{}={}", PYDLL_VAR, path.display())
    } else {
        path.display().to_string()
    }
}

fn setup_tracing(verbose: bool) {
    tracing_subscriber::fmt()
        .with_max_level(if verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .with_writer(std::io::stderr)
        .init();
}
