pub mod audit;
pub mod build;
pub mod graph;

use anyhow::{Context, Result, bail};
use pybundler_core::BuildError;
use pybundler_schema::BuildConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_FILES: &[&str] = &["pybundler.toml", "pyproject.toml"];

/// Load the given configuration, or the first of [`CONFIG_FILES`] in the
/// current directory.
pub(crate) fn load_config(path: Option<&Path>) -> Result<BuildConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match CONFIG_FILES.iter().map(PathBuf::from).find(|p| p.is_file()) {
            Some(p) => p,
            None => bail!("No pybundler.toml or pyproject.toml in the current directory (use --config)"),
        },
    };
    debug!("Using configuration {}", path.display());
    BuildConfig::load(&path)
        .map_err(BuildError::from)
        .with_context(|| format!("Failed to load {}", path.display()))
}

/// Paths from the command line are relative to the working directory, not
/// to the configuration file.
pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Invalid path {}", path.display()))
}
