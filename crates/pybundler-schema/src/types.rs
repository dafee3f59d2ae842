//! Small enums shared between the configuration and the build pipeline.

use serde::{Deserialize, Serialize};

/// What kind of bundle is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleKind {
    /// A launchable `.app` application.
    App,
    /// A loadable bundle (`.bundle`, `.plugin`, `.pbplugin`) hosted by another process.
    Plugin,
}

impl BundleKind {
    /// Default file extension of the bundle directory, including the dot.
    pub fn default_extension(self) -> &'static str {
        match self {
            Self::App => ".app",
            Self::Plugin => ".bundle",
        }
    }

    /// Value of `CFBundlePackageType`.
    pub fn package_type(self) -> &'static str {
        match self {
            Self::App => "APPL",
            Self::Plugin => "BNDL",
        }
    }
}

/// Extensions accepted for plugin bundles.
pub const PLUGIN_EXTENSIONS: &[&str] = &[".bundle", ".plugin", ".pbplugin"];

/// How much of the interpreter and the user's modules end up inside the bundle.
///
/// A bundle is built in exactly one mode; the modes only differ in what gets
/// copied versus referenced by path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// Embed the interpreter runtime, the standard library and every module.
    #[default]
    Standalone,
    /// Use the host's interpreter runtime and standard library; ship everything else.
    SemiStandalone,
    /// Copy nothing; point the bundle back at the developer's source tree.
    Alias,
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Standalone => "standalone",
            Self::SemiStandalone => "semi-standalone",
            Self::Alias => "alias",
        })
    }
}

/// Serialization of the generated `Info.plist`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlistFormat {
    /// Human-readable XML property list.
    #[default]
    Xml,
    /// Binary property list (`bplist00`).
    Binary,
}
