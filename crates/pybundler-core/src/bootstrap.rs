//! `__boot__.py` generation.
//!
//! The launcher executes `Contents/Resources/__boot__.py` after setting
//! `RESOURCEPATH` (the `Resources` directory) and `ARGVZERO` (the path it was
//! invoked as). The file is a concatenation of fixed fragments and a few
//! generated snippets; string values are emitted as JSON literals, which are
//! valid Python literals as well.

use pybundler_schema::{BuildConfig, BuildMode, BundleKind};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, IoContext, Result};

const USE_FAULTHANDLER: &str = include_str!("bootstrap/use_faulthandler.py");
const USE_PYTHONPATH: &str = include_str!("bootstrap/use_pythonpath.py");
const DISABLE_LINECACHE: &str = include_str!("bootstrap/disable_linecache.py");
const SEMI_STANDALONE_PATH: &str = include_str!("bootstrap/semi_standalone_path.py");
const SITE_PACKAGES: &str = include_str!("bootstrap/site_packages.py");
const EXTENSION_FINDER: &str = include_str!("bootstrap/extension_finder.py");
const EMULATE_SHELL_ENVIRONMENT: &str = include_str!("bootstrap/emulate_shell_environment.py");
const ARGV_EMULATION: &str = include_str!("bootstrap/argv_emulation.py");
const BOOT_APP: &str = include_str!("bootstrap/boot_app.py");
const BOOT_PLUGIN: &str = include_str!("bootstrap/boot_plugin.py");
const BOOT_ALIASAPP: &str = include_str!("bootstrap/boot_aliasapp.py");
const BOOT_ALIASPLUGIN: &str = include_str!("bootstrap/boot_aliasplugin.py");

/// One invocable entry point: the launcher name and the script it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub launcher: String,
    /// File name below `Resources/`, or an absolute path in alias builds.
    pub script: String,
}

#[derive(Debug, Clone)]
pub struct Bootstrap<'a> {
    pub kind: BundleKind,
    pub mode: BuildMode,
    pub site_packages: bool,
    pub use_pythonpath: bool,
    pub use_faulthandler: bool,
    pub emulate_shell_environment: bool,
    pub argv_emulation: bool,
    pub argv_inject: &'a [String],
    pub chdir: bool,
    /// Recipe prescripts, emitted in key order.
    pub prescripts: &'a BTreeMap<String, String>,
    /// Directories prepended to `sys.path` in alias builds.
    pub alias_paths: Vec<PathBuf>,
    pub default_script: String,
    pub entries: Vec<EntryPoint>,
}

/// Launcher names and scripts for a configuration, default entry first.
pub fn entry_points(config: &BuildConfig) -> Vec<EntryPoint> {
    config
        .scripts()
        .iter()
        .chain(&config.extra_scripts)
        .filter_map(|script| {
            let launcher = script.file_stem()?.to_string_lossy().into_owned();
            let script = if config.mode() == BuildMode::Alias {
                absolute(&config.resolve(script)).display().to_string()
            } else {
                script.file_name()?.to_string_lossy().into_owned()
            };
            Some(EntryPoint { launcher, script })
        })
        .collect()
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl<'a> Bootstrap<'a> {
    pub fn from_config(
        config: &'a BuildConfig,
        prescripts: &'a BTreeMap<String, String>,
        alias_paths: Vec<PathBuf>,
    ) -> Self {
        let entries = entry_points(config);
        Self {
            kind: config.kind(),
            mode: config.mode(),
            site_packages: config.site_packages,
            use_pythonpath: config.use_pythonpath,
            use_faulthandler: config.use_faulthandler,
            emulate_shell_environment: config.emulate_shell_environment,
            argv_emulation: config.argv_emulation,
            argv_inject: &config.argv_inject,
            chdir: config.chdir(),
            prescripts,
            alias_paths,
            default_script: entries.first().map(|e| e.script.clone()).unwrap_or_default(),
            entries,
        }
    }

    /// The complete `__boot__.py` source.
    pub fn render(&self) -> Result<String> {
        let alias = self.mode == BuildMode::Alias;
        let mut parts: Vec<String> = Vec::new();

        if self.use_faulthandler {
            parts.push(USE_FAULTHANDLER.to_string());
        }
        if !alias {
            parts.push(DISABLE_LINECACHE.to_string());
        }
        if self.mode == BuildMode::SemiStandalone {
            parts.push(SEMI_STANDALONE_PATH.to_string());
        }
        if self.site_packages || alias {
            parts.push(SITE_PACKAGES.to_string());
        }
        if self.use_pythonpath {
            parts.push(USE_PYTHONPATH.to_string());
        }
        if !alias {
            parts.push(EXTENSION_FINDER.to_string());
        }
        if self.emulate_shell_environment {
            parts.push(EMULATE_SHELL_ENVIRONMENT.to_string());
        }
        if self.argv_emulation && self.kind == BundleKind::App {
            parts.push(ARGV_EMULATION.to_string());
        }
        if !self.argv_inject.is_empty() {
            parts.push(format!(
                "def _argv_inject(argv):\n    import sys\n\n    sys.argv[1:1] = argv\n\n\n_argv_inject({})\n",
                literal(&self.argv_inject)?
            ));
        }
        if self.chdir {
            parts.push(
                "def _chdir_resource():\n    import os\n\n    os.chdir(os.environ[\"RESOURCEPATH\"])\n\n\n_chdir_resource()\n"
                    .to_string(),
            );
        }
        parts.extend(self.prescripts.values().cloned());
        if alias && !self.alias_paths.is_empty() {
            let paths: Vec<String> = self
                .alias_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            parts.push(format!(
                "def _path_inject(paths):\n    import sys\n\n    sys.path[:0] = paths\n\n\n_path_inject({})\n",
                literal(&paths)?
            ));
        }
        parts.push(
            match (self.kind, alias) {
                (BundleKind::App, false) => BOOT_APP,
                (BundleKind::Plugin, false) => BOOT_PLUGIN,
                (BundleKind::App, true) => BOOT_ALIASAPP,
                (BundleKind::Plugin, true) => BOOT_ALIASPLUGIN,
            }
            .to_string(),
        );

        let map: BTreeMap<&str, &str> = self
            .entries
            .iter()
            .map(|e| (e.launcher.as_str(), e.script.as_str()))
            .collect();
        let mut tail = String::new();
        let _ = writeln!(tail, "DEFAULT_SCRIPT = {}", literal(&self.default_script)?);
        let _ = writeln!(tail, "SCRIPT_MAP = {}", literal(&map)?);
        let _ = writeln!(tail, "_run()");
        parts.push(tail);

        let mut out = String::new();
        for part in parts {
            out.push_str(part.trim_end());
            out.push_str("\n\n\n");
        }
        out.truncate(out.trim_end().len());
        out.push('\n');
        Ok(out)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let source = self.render()?;
        fs::write(path, source).at("Failed to write", path)
    }
}

fn literal<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| BuildError::context("Failed to encode bootstrap literal", e))
}
