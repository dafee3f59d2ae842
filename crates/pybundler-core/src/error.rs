//! Build errors.
//!
//! Discovery warnings are not errors: they accumulate in the
//! [`MissingReport`](crate::report::MissingReport). Everything here aborts the
//! build and leaves partial output on disk for inspection.

use pybundler_schema::ConfigError;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Required modules are missing: {}", .0.join(", "))]
    Discovery(Vec<String>),

    #[error("Recipe conflict: {0}")]
    RecipeConflict(String),

    #[error("Relocation failed: {0}")]
    Relocation(String),

    #[error("Layout collision: {} is already staged", .0.display())]
    Layout(PathBuf),

    #[error("{tool} exited with status {code}: {stderr}")]
    ExternalTool {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("'{tool}' not found. {hint}")]
    ToolNotFound { tool: String, hint: &'static str },

    #[error("Malformed Mach-O file {}: {reason}", path.display())]
    Macho { path: PathBuf, reason: String },

    #[error("{context} {}: {source}", path.display())]
    Fs {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Property list error: {0}")]
    Plist(#[from] plist::Error),

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl BuildError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl std::fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }

    /// Wrap an I/O error with the path it happened on.
    pub fn fs(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Fs {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Process exit code for this error; external tool failures pass theirs through.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ExternalTool { code, .. } if *code != 0 => *code,
            Self::Config(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Attach a path to I/O failures, the way `anyhow::Context` would.
pub(crate) trait IoContext<T> {
    fn at(self, context: &'static str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, context: &'static str, path: &Path) -> Result<T> {
        self.map_err(|e| BuildError::fs(context, path, e))
    }
}
