//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// An invalid, unreadable or contradictory build configuration.
///
/// These are always raised before the build touches the output directory.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML or does not match the schema.
    #[error("Failed to parse {}: {message}", path.display())]
    Parse {
        /// File that was being parsed.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },

    /// A `pyproject.toml` without a `[tool.pybundler]` table.
    #[error("{} has no [tool.pybundler] table", path.display())]
    MissingSection {
        /// The `pyproject.toml` that was read.
        path: PathBuf,
    },

    /// The options are individually valid but violate a rule.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Invalid`].
    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        Self::Invalid(msg.to_string())
    }
}
