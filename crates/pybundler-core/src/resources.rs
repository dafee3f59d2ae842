//! Resource staging into `Contents/Resources/`.
//!
//! Sources that Xcode normally compiles (interface files, Core Data models,
//! icon sets) are converted with the matching developer tool on the way in;
//! everything else is copied as is.

use pybundler_schema::{BuildConfig, ResourceGroup, ResourceSpec};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{BuildError, IoContext, Result};
use crate::fsutil;
use crate::layout::{BundleLayout, StagingSet};

const XCODE_HINT: &str = "Install Xcode or the command line tools: xcode-select --install";

/// Source formats compiled on the way into the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    /// `.xib` / `.nib` -> `.nib`
    Ibtool,
    /// `.xcdatamodel` -> `.mom`, `.xcdatamodeld` -> `.momd`
    Momc,
    /// `.xcmappingmodel` -> `.cdm`
    Mapc,
    /// `.iconset` -> `.icns`
    Iconutil,
}

impl Converter {
    pub fn for_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "xib" | "nib" => Some(Self::Ibtool),
            "xcdatamodel" | "xcdatamodeld" => Some(Self::Momc),
            "xcmappingmodel" => Some(Self::Mapc),
            "iconset" => Some(Self::Iconutil),
            _ => None,
        }
    }

    /// Extension of the converted output for `source`.
    pub fn output_extension(self, source: &Path) -> &'static str {
        match self {
            Self::Ibtool => "nib",
            Self::Momc if source.extension().is_some_and(|e| e == "xcdatamodeld") => "momd",
            Self::Momc => "mom",
            Self::Mapc => "cdm",
            Self::Iconutil => "icns",
        }
    }

    fn tool(self) -> &'static str {
        match self {
            Self::Ibtool => "ibtool",
            Self::Momc => "momc",
            Self::Mapc => "mapc",
            Self::Iconutil => "iconutil",
        }
    }

    fn command(self, source: &Path, dest: &Path) -> Command {
        let mut cmd = Command::new(self.tool());
        match self {
            Self::Ibtool => {
                cmd.arg("--compile").arg(dest).arg(source);
            }
            Self::Momc | Self::Mapc => {
                cmd.arg(source).arg(dest);
            }
            Self::Iconutil => {
                cmd.args(["-c", "icns", "-o"]).arg(dest).arg(source);
            }
        }
        cmd
    }

    pub fn run(self, source: &Path, dest: &Path) -> Result<()> {
        debug!("{} {} -> {}", self.tool(), source.display(), dest.display());
        let output = match self.command(source, dest).output() {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BuildError::ToolNotFound {
                    tool: self.tool().to_string(),
                    hint: XCODE_HINT,
                });
            }
            Err(e) => return Err(BuildError::fs("Failed to spawn", Path::new(self.tool()), e)),
        };
        if !output.status.success() {
            return Err(BuildError::ExternalTool {
                tool: format!("{} ({})", self.tool(), source.display()),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Expand one configured source: globs match zero or more paths, anything
/// else must exist.
pub fn expand_source(config: &BuildConfig, source: &Path) -> Result<Vec<PathBuf>> {
    let resolved = config.resolve(source);
    let text = resolved.to_string_lossy();
    if !text.contains(['*', '?', '[']) {
        if resolved.symlink_metadata().is_err() {
            return Err(BuildError::fs(
                "Resource not found",
                &resolved,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        return Ok(vec![resolved]);
    }
    let paths = glob::glob(&text).map_err(|e| BuildError::context("Invalid resource pattern", e))?;
    let mut out: Vec<PathBuf> = paths.filter_map(std::result::Result::ok).collect();
    out.sort();
    if out.is_empty() {
        return Err(BuildError::context(
            "Resource pattern matched nothing",
            source.display(),
        ));
    }
    Ok(out)
}

/// Copy or convert one source into directory `dest_dir`, under its own name.
pub fn stage(source: &Path, dest_dir: &Path, staged: &mut StagingSet) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| BuildError::context("Resource has no file name", source.display()))?;
    stage_as(source, &dest_dir.join(name), staged)
}

/// Copy or convert `source` to `dest` (the extension is adjusted for converted files).
pub fn stage_as(source: &Path, dest: &Path, staged: &mut StagingSet) -> Result<PathBuf> {
    let converter = Converter::for_path(source);
    let dest = match converter {
        Some(c) => dest.with_extension(c.output_extension(source)),
        None => dest.to_path_buf(),
    };
    staged.claim(&dest)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).at("Failed to create", parent)?;
    }
    match converter {
        Some(c) => c.run(source, &dest)?,
        None if source.is_dir() => {
            fsutil::copy_tree(source, &dest, |_| true)?;
        }
        None => {
            fs::copy(source, &dest).at("Failed to copy", source)?;
        }
    }
    Ok(dest)
}

fn stage_group(
    config: &BuildConfig,
    group: &ResourceGroup,
    resources: &Path,
    staged: &mut StagingSet,
) -> Result<usize> {
    let dest_dir = resources.join(&group.destination);
    let mut count = 0;
    for source in &group.sources {
        for path in expand_source(config, source)? {
            stage(&path, &dest_dir, staged)?;
            count += 1;
        }
    }
    Ok(count)
}

/// Stage the configured resources, data files and recipe resources.
///
/// Recipe resources map a destination below `Resources/` to a source path.
pub fn stage_resources(
    config: &BuildConfig,
    layout: &BundleLayout,
    recipe_resources: &BTreeMap<PathBuf, PathBuf>,
    staged: &mut StagingSet,
) -> Result<usize> {
    let resources = layout.resources();
    let mut count = 0;
    for spec in &config.resources {
        match spec {
            ResourceSpec::Path(source) => {
                for path in expand_source(config, source)? {
                    stage(&path, &resources, staged)?;
                    count += 1;
                }
            }
            ResourceSpec::Group(group) => count += stage_group(config, group, &resources, staged)?,
        }
    }
    for group in &config.data_files {
        count += stage_group(config, group, &resources, staged)?;
    }
    for (dest, source) in recipe_resources {
        stage_as(source, &resources.join(dest), staged)?;
        count += 1;
    }
    Ok(count)
}

/// Stage the bundle icon as `Resources/<Name>.icns`; returns the file name.
pub fn stage_icon(
    config: &BuildConfig,
    layout: &BundleLayout,
    staged: &mut StagingSet,
) -> Result<Option<String>> {
    let Some(icon) = &config.iconfile else {
        return Ok(None);
    };
    let source = config.resolve(icon);
    let file_name = format!("{}.icns", layout.name());
    let dest = layout.resources().join(&file_name);
    if source.is_dir() && Converter::for_path(&source) != Some(Converter::Iconutil) {
        return Err(BuildError::context(
            "Icon must be an .icns file or an .iconset directory",
            source.display(),
        ));
    }
    stage_as(&source, &dest, staged)?;
    Ok(Some(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup(src: &str) -> (tempfile::TempDir, BuildConfig, BundleLayout) {
        let dir = tempdir().unwrap();
        let mut config = BuildConfig::parse(src, Path::new("pybundler.toml")).unwrap();
        config.base_dir = dir.path().to_path_buf();
        let layout = BundleLayout::new(dir.path().join("dist/Hello.app"), "Hello", (3, 12));
        (dir, config, layout)
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_converter_selection() {
        assert_eq!(Converter::for_path(Path::new("Main.xib")), Some(Converter::Ibtool));
        assert_eq!(Converter::for_path(Path::new("App.iconset")), Some(Converter::Iconutil));
        assert_eq!(Converter::for_path(Path::new("logo.png")), None);
        let model = Path::new("Model.xcdatamodeld");
        assert_eq!(Converter::for_path(model).unwrap().output_extension(model), "momd");
    }

    #[test]
    fn test_paths_groups_and_globs() {
        let (dir, config, layout) = setup(
            r#"
app = ["hello.py"]
resources = ["logo.png", "data", { destination = "tpl", sources = ["templates/*.html"] }]
data_files = [{ destination = "", sources = ["README.txt"] }]
"#,
        );
        write(dir.path(), "logo.png", "png");
        write(dir.path(), "data/a.json", "{}");
        write(dir.path(), "data/.git/HEAD", "ref");
        write(dir.path(), "templates/a.html", "a");
        write(dir.path(), "templates/b.html", "b");
        write(dir.path(), "README.txt", "readme");

        let mut staged = StagingSet::new();
        let count = stage_resources(&config, &layout, &BTreeMap::new(), &mut staged).unwrap();
        assert_eq!(count, 5);
        let res = layout.resources();
        assert!(res.join("logo.png").is_file());
        assert!(res.join("data/a.json").is_file());
        assert!(!res.join("data/.git").exists());
        assert!(res.join("tpl/a.html").is_file());
        assert!(res.join("tpl/b.html").is_file());
        assert!(res.join("README.txt").is_file());
    }

    #[test]
    fn test_missing_and_colliding_resources() {
        let (_dir, config, layout) = setup("app = [\"hello.py\"]\nresources = [\"nope.png\"]");
        let mut staged = StagingSet::new();
        assert!(stage_resources(&config, &layout, &BTreeMap::new(), &mut staged).is_err());

        let (dir, config, layout) = setup(
            "app = [\"hello.py\"]\nresources = [\"a/x.txt\", \"b/x.txt\"]",
        );
        write(dir.path(), "a/x.txt", "1");
        write(dir.path(), "b/x.txt", "2");
        let mut staged = StagingSet::new();
        let err = stage_resources(&config, &layout, &BTreeMap::new(), &mut staged).unwrap_err();
        assert!(matches!(err, BuildError::Layout(_)));
    }

    #[test]
    fn test_recipe_resources_and_icon() {
        let (dir, config, layout) = setup("app = [\"hello.py\"]\niconfile = \"art/app.icns\"");
        write(dir.path(), "art/app.icns", "icns");
        write(dir.path(), "site/mpl-data/matplotlibrc", "rc");

        let mut recipe = BTreeMap::new();
        recipe.insert(PathBuf::from("mpl-data"), dir.path().join("site/mpl-data"));
        let mut staged = StagingSet::new();
        stage_resources(&config, &layout, &recipe, &mut staged).unwrap();
        assert!(layout.resources().join("mpl-data/matplotlibrc").is_file());

        let icon = stage_icon(&config, &layout, &mut staged).unwrap();
        assert_eq!(icon.as_deref(), Some("Hello.icns"));
        assert!(layout.resources().join("Hello.icns").is_file());
    }
}
