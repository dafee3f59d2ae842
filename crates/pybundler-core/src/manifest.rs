//! `Info.plist` and `PkgInfo`.
//!
//! The generated property list starts from a fixed set of keys every bundle
//! needs, then merges the user's keys over it. Two keys are authoritative and
//! always reflect the bundle that was actually built: `CFBundleExecutable`
//! and `CFBundlePackageType`.

use plist::{Dictionary, Value};
use pybundler_schema::{BuildConfig, BuildMode, BundleKind, PlistFormat, PlistSource};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::error::{BuildError, IoContext, Result};

/// Keys the user cannot override.
pub const AUTHORITATIVE_KEYS: &[&str] = &["CFBundleExecutable", "CFBundlePackageType"];

/// Where the launcher looks for a framework build of Python on the host.
const FRAMEWORK_LOCATIONS: &[&str] = &[
    "~/Library/Frameworks/Python.framework/Versions/{v}/Python",
    "/Library/Frameworks/Python.framework/Versions/{v}/Python",
    "/Network/Library/Frameworks/Python.framework/Versions/{v}/Python",
];

/// Facts about the build that end up in the manifest.
#[derive(Debug, Clone)]
pub struct ManifestInput<'a> {
    pub config: &'a BuildConfig,
    /// `CFBundleExecutable`: the launcher name.
    pub executable: &'a str,
    pub python_version: (u32, u32),
    pub python_executable: &'a Path,
    /// `PyRuntimeLocations`, most preferred first.
    pub runtime_locations: Vec<String>,
    /// `PyResourcePackages`, relative to `Contents/Resources`.
    pub resource_packages: Vec<String>,
    /// File name of the staged icon, if any.
    pub icon: Option<String>,
}

/// Candidate locations of the interpreter runtime for the launcher.
///
/// `embedded` is the runtime's path relative to `Contents/Frameworks` in a
/// standalone build; `host` is the build machine's runtime library.
pub fn runtime_locations(
    mode: BuildMode,
    version: (u32, u32),
    embedded: Option<&Path>,
    host: Option<&Path>,
) -> Vec<String> {
    let mut out = Vec::new();
    if mode == BuildMode::Standalone {
        if let Some(rel) = embedded {
            out.push(format!("@executable_path/../Frameworks/{}", rel.display()));
            return out;
        }
    }
    if let Some(host) = host {
        out.push(host.display().to_string());
    }
    let v = format!("{}.{}", version.0, version.1);
    for loc in FRAMEWORK_LOCATIONS {
        let loc = loc.replace("{v}", &v);
        if !out.contains(&loc) {
            out.push(loc);
        }
    }
    out
}

/// Build the property list dictionary.
pub fn compose(input: &ManifestInput<'_>) -> Result<Dictionary> {
    let config = input.config;
    let kind = config.kind();
    let name = config.bundle_name();
    let (major, minor) = input.python_version;
    let version = config.version.clone().unwrap_or_else(|| "0.0".to_string());

    let mut keys: BTreeMap<String, Value> = BTreeMap::new();
    let mut set = |k: &str, v: Value| {
        keys.insert(k.to_string(), v);
    };
    set("CFBundleDevelopmentRegion", "English".into());
    set("CFBundleDisplayName", name.clone().into());
    set("CFBundleExecutable", input.executable.into());
    set("CFBundleIdentifier", config.bundle_identifier().into());
    set("CFBundleInfoDictionaryVersion", "6.0".into());
    set("CFBundleName", name.clone().into());
    set("CFBundlePackageType", kind.package_type().into());
    set("CFBundleShortVersionString", version.clone().into());
    set("CFBundleSignature", "????".into());
    set("CFBundleVersion", version.into());
    set("LSMinimumSystemVersion", config.deployment_target().into());
    set("LSHasLocalizedDisplayName", false.into());
    set("NSHighResolutionCapable", true.into());
    set(
        "NSPrincipalClass",
        match kind {
            BundleKind::App => "NSApplication".to_string(),
            BundleKind::Plugin => name.split_whitespace().collect(),
        }
        .into(),
    );
    set("PyMainFileNames", strings(["__boot__"]));
    set("PyResourcePackages", strings(&input.resource_packages));
    set("PyRuntimeLocations", strings(&input.runtime_locations));
    if let Some(icon) = &input.icon {
        set("CFBundleIconFile", icon.clone().into());
    }
    if config.argv_emulation && kind == BundleKind::App {
        let mut doc = Dictionary::new();
        doc.insert(
            "CFBundleTypeOSTypes".into(),
            strings(["****", "fold", "disk"]),
        );
        doc.insert("CFBundleTypeRole".into(), "Viewer".into());
        set("CFBundleDocumentTypes", Value::Array(vec![Value::Dictionary(doc)]));
    }

    let mut info = Dictionary::new();
    info.insert(
        "PythonShortVersion".into(),
        format!("{major}.{minor}").into(),
    );
    info.insert(
        "PythonExecutable".into(),
        input.python_executable.display().to_string().into(),
    );
    info.insert("mode".into(), config.mode().to_string().into());
    set("PythonInfoDict", Value::Dictionary(info));

    // Read by the launcher before the interpreter starts.
    let mut options = Dictionary::new();
    for (key, value) in [
        ("use_pythonpath", config.use_pythonpath),
        ("use_faulthandler", config.use_faulthandler),
        ("site_packages", config.site_packages),
        ("alias", config.alias),
        ("argv_emulation", config.argv_emulation),
        ("emulate_shell_environment", config.emulate_shell_environment),
        ("no_chdir", !config.chdir()),
    ] {
        options.insert(key.into(), value.into());
    }
    options.insert("optimize".into(), Value::Integer(u64::from(config.optimize).into()));
    set("PyOptions", Value::Dictionary(options));

    if let Some(source) = &config.plist {
        for (key, value) in user_keys(source, config)? {
            if AUTHORITATIVE_KEYS.contains(&key.as_str()) {
                warn!("Ignoring {key} from the configured plist; it is set by the build");
                continue;
            }
            keys.insert(key, value);
        }
    }

    let mut dict = Dictionary::new();
    for (k, v) in keys {
        dict.insert(k, v);
    }
    Ok(dict)
}

/// Keys supplied by the configuration, inline or from a plist file.
fn user_keys(source: &PlistSource, config: &BuildConfig) -> Result<BTreeMap<String, Value>> {
    match source {
        PlistSource::Inline(table) => Ok(table
            .iter()
            .map(|(k, v)| (k.clone(), toml_to_plist(v)))
            .collect()),
        PlistSource::File(path) => {
            let path = config.resolve(path);
            let value = Value::from_file(&path)?;
            let dict = value.into_dictionary().ok_or_else(|| {
                BuildError::context(
                    "Invalid plist",
                    format!("{} is not a dictionary", path.display()),
                )
            })?;
            Ok(dict.into_iter().collect())
        }
    }
}

fn strings<I, S>(items: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Value::Array(
        items
            .into_iter()
            .map(|s| Value::String(s.as_ref().to_string()))
            .collect(),
    )
}

/// Convert a TOML value into its property list counterpart.
pub fn toml_to_plist(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::Integer((*i).into()),
        toml::Value::Float(f) => Value::Real(*f),
        toml::Value::Boolean(b) => Value::Boolean(*b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::Array(items.iter().map(toml_to_plist).collect()),
        toml::Value::Table(table) => {
            let mut dict = Dictionary::new();
            for (k, v) in table {
                dict.insert(k.clone(), toml_to_plist(v));
            }
            Value::Dictionary(dict)
        }
    }
}

/// Write `Contents/Info.plist`.
pub fn write_info_plist(path: &Path, dict: Dictionary, format: PlistFormat) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at("Failed to create", parent)?;
    }
    let value = Value::Dictionary(dict);
    match format {
        PlistFormat::Xml => value.to_file_xml(path)?,
        PlistFormat::Binary => value.to_file_binary(path)?,
    }
    Ok(())
}

/// Write `Contents/PkgInfo`: package type followed by the `????` creator code.
pub fn write_pkg_info(path: &Path, kind: BundleKind) -> Result<()> {
    let content = format!("{}????", kind.package_type());
    fs::write(path, content).at("Failed to write", path)
}
