//! pybundler - macOS bundles from Python programs
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Turns one or more Python entry scripts into a self-contained `.app` (or a
//! loadable `.bundle` plugin): every module the scripts import, the native
//! libraries those modules link against and the interpreter runtime end up
//! inside the bundle.
//!
//! # Layout
//!
//! ```text
//! Name.app/Contents/
//! ├── Info.plist
//! ├── PkgInfo
//! ├── MacOS/Name                      # launcher
//! ├── Frameworks/                     # relocated dylibs and the runtime
//! └── Resources/
//!     ├── __boot__.py
//!     ├── main.py
//!     └── lib/python3.X/
//!         ├── site-packages.zip
//!         └── lib-dynload/            # native extensions
//! ```

pub mod cmd;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "pybundler")]
#[command(author, version, about = "pybundler - build macOS application bundles from Python programs")]
pub struct Cli {
    /// More output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build the bundle described by the configuration
    Build {
        /// pybundler.toml or pyproject.toml (default: whichever exists in the current directory)
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Link back to the sources instead of copying them
        #[arg(long, conflicts_with = "semi_standalone")]
        alias: bool,
        /// Use the host Python runtime and standard library
        #[arg(long)]
        semi_standalone: bool,
        /// Output directory
        #[arg(long, env = "PYBUNDLER_DIST_DIR")]
        dist_dir: Option<PathBuf>,
        /// Python interpreter to bundle
        #[arg(long, env = "PYBUNDLER_INTERPRETER")]
        interpreter: Option<PathBuf>,
        /// Launcher executable template
        #[arg(long, env = "PYBUNDLER_LAUNCHER")]
        launcher: Option<PathBuf>,
        /// Print the build summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the module graph and missing-module report without building
    Graph {
        /// pybundler.toml or pyproject.toml
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Python interpreter to inspect
        #[arg(long, env = "PYBUNDLER_INTERPRETER")]
        interpreter: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    /// Check that a built bundle only links against itself and the system
    Audit {
        /// Path to the .app or .bundle
        bundle: PathBuf,
        /// Path prefix outside the bundle that binaries may link against
        #[arg(long = "allow")]
        allow: Vec<PathBuf>,
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}
