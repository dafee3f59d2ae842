//! Build configuration.
//!
//! A build is described either by a standalone `pybundler.toml` (keys at the
//! top level) or by the `[tool.pybundler]` table of a `pyproject.toml`:
//!
//! ```toml
//! [tool.pybundler]
//! app = ["hello.py"]
//! includes = ["json"]
//! packages = ["certifi"]
//! resources = ["data/logo.png", { destination = "templates", sources = ["tpl/a.html"] }]
//! plist = { CFBundleShortVersionString = "1.0" }
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use crate::arch::Arch;
use crate::error::ConfigError;
use crate::types::{BuildMode, BundleKind, PLUGIN_EXTENSIONS, PlistFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Deployment target used when neither the configuration nor the interpreter names one.
pub const DEFAULT_DEPLOYMENT_TARGET: &str = "11.0";

/// Name of the standalone configuration file.
pub const CONFIG_FILE: &str = "pybundler.toml";

/// A resource entry: either a single path copied into `Contents/Resources/`,
/// or a group of sources copied into a subdirectory of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceSpec {
    /// File or directory copied under its own name.
    Path(PathBuf),
    /// Sources copied into `destination` (relative to `Contents/Resources/`).
    Group(ResourceGroup),
}

/// Sources copied into one destination directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceGroup {
    /// Directory relative to `Contents/Resources/`; empty means the root.
    pub destination: PathBuf,
    /// Files, directories or glob patterns.
    pub sources: Vec<PathBuf>,
}

/// Extra `Info.plist` content: inline keys or a property list file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlistSource {
    /// Path to an XML or binary property list whose top-level dictionary is merged.
    File(PathBuf),
    /// Keys written directly in the configuration.
    Inline(toml::Table),
}

/// Everything needed to build one bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Bundle name; defaults to the stem of the first entry script.
    pub name: Option<String>,
    /// Entry scripts of an application bundle.
    pub app: Vec<PathBuf>,
    /// Entry scripts of a plugin bundle.
    pub plugin: Vec<PathBuf>,
    /// Bundle directory extension, including the dot.
    pub extension: Option<String>,

    /// Module names forced into the bundle.
    pub includes: Vec<String>,
    /// Module names (and their descendants) kept out of the bundle.
    pub excludes: Vec<String>,
    /// Packages copied verbatim instead of being compiled into the archive.
    pub packages: Vec<String>,
    /// Imports that may fail at runtime without being reported.
    pub expected_missing: Vec<String>,

    /// Frameworks or dylibs copied into `Contents/Frameworks/`.
    pub frameworks: Vec<PathBuf>,
    /// Basenames of libraries that must never be copied, even if not system libraries.
    pub dylib_excludes: Vec<String>,
    /// Files copied into `Contents/Resources/`.
    pub resources: Vec<ResourceSpec>,
    /// Files copied into subdirectories of `Contents/Resources/`.
    pub data_files: Vec<ResourceGroup>,

    /// Keys merged into `Info.plist`.
    pub plist: Option<PlistSource>,
    /// Serialization of `Info.plist`.
    pub plist_format: PlistFormat,

    /// Use the host interpreter runtime instead of embedding one.
    pub semi_standalone: bool,
    /// Reference the source tree instead of copying it.
    pub alias: bool,
    /// Translate "open document" Apple Events into `sys.argv` entries (apps only).
    pub argv_emulation: bool,
    /// Arguments appended to `sys.argv` before the entry script runs.
    pub argv_inject: Vec<String>,
    /// Import the login shell environment at startup.
    pub emulate_shell_environment: bool,
    /// Add the host's site-packages directories to `sys.path` at startup.
    pub site_packages: bool,
    /// Change to `Contents/Resources/` before running; defaults to on for apps.
    pub chdir: Option<bool>,
    /// Additional scripts shipped as invocable entry points.
    pub extra_scripts: Vec<PathBuf>,
    /// Append the runtime `PYTHONPATH` to `sys.path` at startup.
    pub use_pythonpath: bool,
    /// Enable `faulthandler` at startup (and bundle it).
    pub use_faulthandler: bool,

    /// Strip debug and local symbols from bundled binaries.
    pub strip: bool,
    /// Report `from P import x` names that are neither submodules nor globals.
    pub report_missing_from_imports: bool,
    /// Report missing imports guarded by `try`, branches, loops or functions.
    pub report_missing_conditional_imports: bool,

    /// `CFBundleIdentifier`.
    pub bundle_identifier: Option<String>,
    /// `CFBundleShortVersionString` and `CFBundleVersion`.
    pub version: Option<String>,
    /// `.icns` file or `.iconset` directory used as the bundle icon.
    pub iconfile: Option<PathBuf>,
    /// Architectures every bundled binary must carry.
    pub arch: Option<Arch>,
    /// `LSMinimumSystemVersion`.
    pub deployment_target: Option<String>,
    /// Byte-code optimization level (0, 1 or 2).
    pub optimize: u8,
    /// Compile modules to byte code; when off the archive stores sources.
    pub byte_compile: bool,

    /// Launcher template copied to `Contents/MacOS/<name>`.
    pub launcher: Option<PathBuf>,
    /// Interpreter used to discover and compile modules.
    pub interpreter: Option<PathBuf>,
    /// Directory the bundle is written to.
    pub dist_dir: PathBuf,

    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            name: None,
            app: Vec::new(),
            plugin: Vec::new(),
            extension: None,
            includes: Vec::new(),
            excludes: Vec::new(),
            packages: Vec::new(),
            expected_missing: Vec::new(),
            frameworks: Vec::new(),
            dylib_excludes: Vec::new(),
            resources: Vec::new(),
            data_files: Vec::new(),
            plist: None,
            plist_format: PlistFormat::default(),
            semi_standalone: false,
            alias: false,
            argv_emulation: false,
            argv_inject: Vec::new(),
            emulate_shell_environment: false,
            site_packages: false,
            chdir: None,
            extra_scripts: Vec::new(),
            use_pythonpath: false,
            use_faulthandler: false,
            strip: true,
            report_missing_from_imports: false,
            report_missing_conditional_imports: true,
            bundle_identifier: None,
            version: None,
            iconfile: None,
            arch: None,
            deployment_target: None,
            optimize: 0,
            byte_compile: true,
            launcher: None,
            interpreter: None,
            dist_dir: PathBuf::from("dist"),
            base_dir: PathBuf::from("."),
        }
    }
}

impl BuildConfig {
    /// Load and validate a configuration file.
    ///
    /// A file named `pyproject.toml` is read through its `[tool.pybundler]`
    /// table; any other file is taken as a bare configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if the
    /// options fail [`validate`](Self::validate).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = if path.file_name().is_some_and(|n| n == "pyproject.toml") {
            Self::parse_pyproject(&content, path)?
        } else {
            Self::parse(&content, path)?
        };

        config.base_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a bare configuration document without validating it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or unknown keys.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.message().to_string(),
        })
    }

    /// Parse the `[tool.pybundler]` table of a `pyproject.toml` document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSection`] when the table is absent and
    /// [`ConfigError::Parse`] when it does not match the schema.
    pub fn parse_pyproject(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let parse_err = |message: String| ConfigError::Parse {
            path: origin.to_path_buf(),
            message,
        };

        let doc: toml::Table = toml::from_str(content).map_err(|e| parse_err(e.message().to_string()))?;
        let section = doc
            .get("tool")
            .and_then(|t| t.get("pybundler"))
            .cloned()
            .ok_or_else(|| ConfigError::MissingSection {
                path: origin.to_path_buf(),
            })?;

        Self::deserialize(section).map_err(|e| parse_err(e.message().to_string()))
    }

    /// Check the rules that individual keys cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.app.is_empty(), self.plugin.is_empty()) {
            (false, false) => {
                return Err(ConfigError::invalid("`app` and `plugin` are mutually exclusive"));
            }
            (true, true) => {
                return Err(ConfigError::invalid(
                    "exactly one of `app` or `plugin` must list entry scripts",
                ));
            }
            _ => {}
        }

        if self.alias && self.semi_standalone {
            return Err(ConfigError::invalid(
                "`alias` and `semi_standalone` are mutually exclusive",
            ));
        }

        if self.argv_emulation && self.kind() == BundleKind::Plugin {
            return Err(ConfigError::invalid("`argv_emulation` is only supported for apps"));
        }

        if let Some(ext) = &self.extension {
            let ok = match self.kind() {
                BundleKind::App => ext == ".app",
                BundleKind::Plugin => PLUGIN_EXTENSIONS.contains(&ext.as_str()),
            };
            if !ok {
                return Err(ConfigError::invalid(format!(
                    "extension {ext:?} is not valid for a {} bundle",
                    match self.kind() {
                        BundleKind::App => "app",
                        BundleKind::Plugin => "plugin",
                    }
                )));
            }
        }

        if let Some(name) = &self.name {
            if name.is_empty() || name.contains('/') || name.starts_with('.') {
                return Err(ConfigError::invalid(format!("invalid bundle name {name:?}")));
            }
        }

        if self.optimize > 2 {
            return Err(ConfigError::invalid(format!(
                "`optimize` must be 0, 1 or 2, not {}",
                self.optimize
            )));
        }

        if let Some(target) = &self.deployment_target {
            let re = Regex::new(r"^[0-9]+(\.[0-9]+)?$").map_err(ConfigError::invalid)?;
            if !re.is_match(target) {
                return Err(ConfigError::invalid(format!(
                    "`deployment_target` {target:?} is not a macOS version like \"11.0\""
                )));
            }
        }

        let dotted = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
            .map_err(ConfigError::invalid)?;
        for (key, names) in [
            ("includes", &self.includes),
            ("excludes", &self.excludes),
            ("packages", &self.packages),
            ("expected_missing", &self.expected_missing),
        ] {
            if let Some(bad) = names.iter().find(|n| !dotted.is_match(n)) {
                return Err(ConfigError::invalid(format!(
                    "`{key}` entry {bad:?} is not a module name"
                )));
            }
        }

        let excluded: BTreeSet<&str> = self.excludes.iter().map(String::as_str).collect();
        if let Some(name) = self
            .includes
            .iter()
            .chain(&self.packages)
            .find(|n| excluded.contains(n.as_str()))
        {
            return Err(ConfigError::invalid(format!(
                "{name:?} is both required and excluded"
            )));
        }

        let mut stems = BTreeSet::new();
        for script in self.scripts().iter().chain(&self.extra_scripts) {
            let Some(stem) = script.file_stem().and_then(|s| s.to_str()) else {
                return Err(ConfigError::invalid(format!(
                    "script path {} has no file name",
                    script.display()
                )));
            };
            if !stems.insert(stem.to_string()) {
                return Err(ConfigError::invalid(format!(
                    "two entry scripts share the name {stem:?}"
                )));
            }
        }

        for group in self.data_files.iter().chain(self.resources.iter().filter_map(|r| match r {
            ResourceSpec::Group(g) => Some(g),
            ResourceSpec::Path(_) => None,
        })) {
            if group.destination.is_absolute()
                || group
                    .destination
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(ConfigError::invalid(format!(
                    "resource destination {} must stay inside the bundle",
                    group.destination.display()
                )));
            }
        }

        Ok(())
    }

    /// Whether this builds an app or a plugin.
    pub fn kind(&self) -> BundleKind {
        if self.plugin.is_empty() {
            BundleKind::App
        } else {
            BundleKind::Plugin
        }
    }

    /// The build mode selected by the mode flags.
    pub fn mode(&self) -> BuildMode {
        if self.alias {
            BuildMode::Alias
        } else if self.semi_standalone {
            BuildMode::SemiStandalone
        } else {
            BuildMode::Standalone
        }
    }

    /// Entry scripts in declaration order; the first is the default entry.
    pub fn scripts(&self) -> &[PathBuf] {
        match self.kind() {
            BundleKind::App => &self.app,
            BundleKind::Plugin => &self.plugin,
        }
    }

    /// Bundle name without extension.
    pub fn bundle_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.scripts()
            .first()
            .and_then(|s| s.file_stem())
            .map_or_else(|| "Bundle".to_string(), |s| s.to_string_lossy().into_owned())
    }

    /// Bundle directory extension, including the dot.
    pub fn bundle_extension(&self) -> &str {
        self.extension
            .as_deref()
            .unwrap_or_else(|| self.kind().default_extension())
    }

    /// `CFBundleIdentifier`, derived from the name when not configured.
    pub fn bundle_identifier(&self) -> String {
        self.bundle_identifier.clone().unwrap_or_else(|| {
            let name: String = self
                .bundle_name()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
                .collect();
            format!("org.pythonmac.unspecified.{name}")
        })
    }

    /// `LSMinimumSystemVersion`.
    pub fn deployment_target(&self) -> &str {
        self.deployment_target
            .as_deref()
            .unwrap_or(DEFAULT_DEPLOYMENT_TARGET)
    }

    /// Whether the bootstrap changes into `Contents/Resources/`.
    pub fn chdir(&self) -> bool {
        self.chdir.unwrap_or(self.kind() == BundleKind::App)
    }

    /// Resolve a configured path against [`base_dir`](Self::base_dir).
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Full path of the bundle that a build will produce.
    pub fn bundle_path(&self) -> PathBuf {
        self.resolve(&self.dist_dir)
            .join(format!("{}{}", self.bundle_name(), self.bundle_extension()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> BuildConfig {
        BuildConfig::parse(src, Path::new("pybundler.toml")).unwrap()
    }

    #[test]
    fn test_minimal_app() {
        let cfg = parse(r#"app = ["hello.py"]"#);
        cfg.validate().unwrap();
        assert_eq!(cfg.kind(), BundleKind::App);
        assert_eq!(cfg.mode(), BuildMode::Standalone);
        assert_eq!(cfg.bundle_name(), "hello");
        assert_eq!(cfg.bundle_extension(), ".app");
        assert!(cfg.byte_compile);
        assert!(cfg.strip);
        assert!(!cfg.report_missing_from_imports);
        assert!(cfg.report_missing_conditional_imports);
        assert!(cfg.chdir());
        assert_eq!(cfg.deployment_target(), DEFAULT_DEPLOYMENT_TARGET);
    }

    #[test]
    fn test_app_and_plugin_conflict() {
        let cfg = parse("app = [\"a.py\"]\nplugin = [\"b.py\"]");
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let empty = parse("includes = [\"json\"]");
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = BuildConfig::parse("app = [\"a.py\"]\nfrobnicate = true", Path::new("x.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_plugin_extension_rules() {
        let cfg = parse("plugin = [\"p.py\"]\nextension = \".plugin\"");
        cfg.validate().unwrap();
        assert_eq!(cfg.kind(), BundleKind::Plugin);
        assert!(!cfg.chdir());

        let cfg = parse("plugin = [\"p.py\"]\nextension = \".app\"");
        assert!(cfg.validate().is_err());

        let cfg = parse("plugin = [\"p.py\"]\nargv_emulation = true");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_mode_flags() {
        let cfg = parse("app = [\"a.py\"]\nalias = true\nsemi_standalone = true");
        assert!(cfg.validate().is_err());

        let cfg = parse("app = [\"a.py\"]\nsemi_standalone = true");
        assert_eq!(cfg.mode(), BuildMode::SemiStandalone);
    }

    #[test]
    fn test_deployment_target_format() {
        let cfg = parse("app = [\"a.py\"]\ndeployment_target = \"10.15\"");
        cfg.validate().unwrap();
        let cfg = parse("app = [\"a.py\"]\ndeployment_target = \"ten\"");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_include_and_exclude_conflict() {
        let cfg = parse("app = [\"a.py\"]\nincludes = [\"json\"]\nexcludes = [\"json\"]");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_script_stems() {
        let cfg = parse("app = [\"a/run.py\"]\nextra_scripts = [\"b/run.py\"]");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_resource_forms() {
        let cfg = parse(
            r#"
app = ["a.py"]
resources = ["logo.png", { destination = "tpl", sources = ["a.html", "b.html"] }]
data_files = [{ destination = "../escape", sources = ["x"] }]
"#,
        );
        assert_eq!(cfg.resources[0], ResourceSpec::Path(PathBuf::from("logo.png")));
        assert!(matches!(&cfg.resources[1], ResourceSpec::Group(g) if g.sources.len() == 2));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_plist_forms() {
        let cfg = parse("app = [\"a.py\"]\nplist = \"Info.plist\"");
        assert_eq!(cfg.plist, Some(PlistSource::File(PathBuf::from("Info.plist"))));

        let cfg = parse("app = [\"a.py\"]\n[plist]\nLSUIElement = true");
        assert!(matches!(cfg.plist, Some(PlistSource::Inline(ref t)) if t.contains_key("LSUIElement")));
    }

    #[test]
    fn test_load_pyproject() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyproject.toml");
        std::fs::write(
            &path,
            "[project]\nname = \"demo\"\n\n[tool.pybundler]\napp = [\"main.py\"]\nname = \"Demo\"\n",
        )
        .unwrap();

        let cfg = BuildConfig::load(&path).unwrap();
        assert_eq!(cfg.bundle_name(), "Demo");
        assert_eq!(cfg.base_dir, dir.path());
        assert_eq!(cfg.resolve(Path::new("main.py")), dir.path().join("main.py"));
        assert_eq!(cfg.bundle_path(), dir.path().join("dist/Demo.app"));
        assert_eq!(cfg.bundle_identifier(), "org.pythonmac.unspecified.Demo");
    }

    #[test]
    fn test_pyproject_without_section() {
        let err = BuildConfig::parse_pyproject("[project]\nname = \"x\"\n", Path::new("pyproject.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection { .. }));
    }
}
