//! Shared types for pybundler: the build configuration and the enums the
//! pipeline and the command line agree on.

pub mod arch;
pub mod config;
pub mod error;
pub mod types;

// Re-exports
pub use arch::Arch;
pub use config::{BuildConfig, PlistSource, ResourceGroup, ResourceSpec};
pub use error::ConfigError;
pub use types::*;
