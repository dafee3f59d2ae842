//! Bundle emission.
//!
//! Turns a finished module graph and recipe verdict into a bundle on disk:
//!
//! 1. partition the graph into archived modules, unpacked modules, whole
//!    packages and native extensions;
//! 2. plan binary relocation (before anything is written, so a missing
//!    library fails the build early);
//! 3. clear the previous bundle and stage launchers, scripts, modules,
//!    extensions and resources;
//! 4. copy and edit libraries according to the plan;
//! 5. write `Info.plist`, `PkgInfo` and `__boot__.py`.

use pybundler_schema::{BuildConfig, BuildMode};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::archive::ArchiveBuilder;
use crate::bootstrap::{Bootstrap, entry_points};
use crate::compile::{ByteCompiler, CompileJob};
use crate::error::{BuildError, IoContext, Result};
use crate::fsutil::{self, copy_executable, copy_tree, hard_link_or_copy};
use crate::graph::{ModuleGraph, ModuleNode, NodeKind, parent_name};
use crate::interpreter::Interpreter;
use crate::layout::{BundleLayout, StagingSet};
use crate::macho::MachoFile;
use crate::manifest::{self, ManifestInput};
use crate::recipes::Verdict;
use crate::relinker::MachoEditor;
use crate::relocator::{RelocationPlan, Relocator, RelocatorOptions, Role};
use crate::reporter::Reporter;
use crate::resources;

/// Where each shipped module goes.
#[derive(Debug, Default)]
pub struct Partition<'g> {
    /// Compiled into `site-packages.zip`.
    pub archived: Vec<&'g ModuleNode>,
    /// Compiled into `lib/pythonM.N/` as loose files, because a package
    /// below them is shipped as a directory.
    pub unpacked: Vec<&'g ModuleNode>,
    /// Topmost nodes of whole packages, copied verbatim.
    pub whole: Vec<&'g ModuleNode>,
    /// Native extensions outside whole packages, copied to `lib-dynload`.
    pub extensions: Vec<&'g ModuleNode>,
}

/// Split the graph by destination. Alias builds ship nothing; semi-standalone
/// builds leave the standard library on the host.
pub fn partition<'g>(graph: &'g ModuleGraph, interpreter: &Interpreter, mode: BuildMode) -> Partition<'g> {
    let mut out = Partition::default();
    if mode == BuildMode::Alias {
        return out;
    }

    let is_whole = |name: &str| graph.get(name).is_some_and(|n| n.whole_package);
    let mut shipped = Vec::new();
    for node in graph.nodes() {
        let on_disk = node.kind.has_file() || node.kind == NodeKind::NamespacePackage;
        if node.script || !on_disk {
            continue;
        }
        if mode == BuildMode::SemiStandalone && location(node).is_some_and(|p| interpreter.is_stdlib_path(p)) {
            continue;
        }
        if node.whole_package {
            if !node.parent().is_some_and(is_whole) {
                out.whole.push(node);
            }
            continue;
        }
        shipped.push(node);
    }

    // Packages containing a whole package must be real directories too.
    let mut unpacked: BTreeSet<&str> = BTreeSet::new();
    for root in out.whole.iter().copied() {
        let mut parent = root.parent();
        while let Some(name) = parent {
            unpacked.insert(name);
            parent = parent_name(name);
        }
    }
    for node in shipped {
        if node.kind == NodeKind::NativeExtension {
            out.extensions.push(node);
        } else if unpacked.contains(node.name.as_str())
            || std::iter::successors(node.parent(), |n| parent_name(*n))
                .any(|a| unpacked.contains(a))
        {
            out.unpacked.push(node);
        } else {
            out.archived.push(node);
        }
    }
    out
}

fn location(node: &ModuleNode) -> Option<&Path> {
    node.filename
        .as_deref()
        .or_else(|| node.package_path.first().map(PathBuf::as_path))
}

/// `a.b` -> `a/b`, `a` (package) -> `a/__init__`
fn archive_stem(node: &ModuleNode) -> String {
    let base = node.name.replace('.', "/");
    if node.kind == NodeKind::SourcePackage {
        format!("{base}/__init__")
    } else {
        base
    }
}

/// Package data files as `(archive path, source)`.
fn data_members(node: &ModuleNode) -> Vec<(String, PathBuf)> {
    let base = node.name.replace('.', "/");
    node.data_files
        .iter()
        .filter_map(|file| {
            let dir = node.package_path.iter().find(|d| file.starts_with(d))?;
            let rel = file.strip_prefix(dir).ok()?;
            Some((format!("{base}/{}", rel.to_string_lossy()), file.clone()))
        })
        .collect()
}

/// Destination of a whole-package root below `lib/pythonM.N/`.
fn whole_destinations(node: &ModuleNode, pylib: &Path) -> Vec<(PathBuf, PathBuf)> {
    let rel = PathBuf::from(node.name.replace('.', "/"));
    if node.kind.is_package() {
        node.package_path
            .iter()
            .map(|dir| (dir.clone(), pylib.join(&rel)))
            .collect()
    } else {
        node.filename
            .iter()
            .filter_map(|file| {
                let name = file.file_name()?;
                let dest = rel.parent().map_or_else(|| pylib.to_path_buf(), |p| pylib.join(p));
                Some((file.clone(), dest.join(name)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmitSummary {
    pub bundle: PathBuf,
    pub archived: usize,
    pub unpacked: usize,
    pub whole_packages: usize,
    pub extensions: usize,
    pub resources: usize,
    /// Binaries whose headers were edited.
    pub relocated: usize,
    pub relocation: RelocationPlan,
}

/// Everything the emitter needs.
pub struct Emitter<'a> {
    pub config: &'a BuildConfig,
    pub layout: &'a BundleLayout,
    pub launcher: &'a Path,
    pub interpreter: &'a Interpreter,
    pub graph: &'a ModuleGraph,
    pub verdict: &'a Verdict,
    pub compiler: &'a dyn ByteCompiler,
    pub editor: &'a dyn MachoEditor,
    pub reporter: &'a dyn Reporter,
}

impl Emitter<'_> {
    pub fn emit(&self) -> Result<EmitSummary> {
        let mode = self.config.mode();
        let layout = self.layout;
        let parts = partition(self.graph, self.interpreter, mode);

        let plan = if mode == BuildMode::Alias {
            RelocationPlan::default()
        } else {
            self.reporter.section("Planning relocation");
            self.plan_relocation(&parts)?
        };

        self.reporter.section(&format!("Writing {}", layout.root().display()));
        if layout.root().symlink_metadata().is_ok() {
            fs::remove_dir_all(layout.root()).at("Failed to remove", layout.root())?;
        }
        for dir in [layout.macos(), layout.resources()] {
            fs::create_dir_all(&dir).at("Failed to create", &dir)?;
        }

        let mut staged = StagingSet::new();
        self.stage_launchers(&mut staged)?;
        if mode != BuildMode::Alias {
            self.stage_scripts(&mut staged)?;
        }

        let mut summary = EmitSummary {
            bundle: layout.root().to_path_buf(),
            ..EmitSummary::default()
        };
        if mode != BuildMode::Alias {
            self.stage_modules(&parts, &mut staged, &mut summary)?;
        }

        summary.resources =
            resources::stage_resources(self.config, layout, &self.verdict.resources, &mut staged)?;
        let icon = resources::stage_icon(self.config, layout, &mut staged)?;

        if !plan.is_empty() {
            self.reporter.section("Relocating binaries");
            summary.relocated = plan.apply(self.editor)?;
            for warning in &plan.warnings {
                self.reporter.warning(warning);
            }
        }

        self.write_manifest(&plan, icon, &mut staged)?;
        self.write_bootstrap(&mut staged)?;

        info!(
            "{}: {} archived, {} unpacked, {} whole package(s), {} extension(s)",
            layout.name(),
            summary.archived,
            summary.unpacked,
            summary.whole_packages,
            summary.extensions
        );
        summary.relocation = plan;
        Ok(summary)
    }

    fn plan_relocation(&self, parts: &Partition<'_>) -> Result<RelocationPlan> {
        let layout = self.layout;
        let mode = self.config.mode();
        let mut relocator = Relocator::new(
            layout,
            RelocatorOptions {
                mode,
                runtime: self.interpreter.runtime_library.clone(),
                executable_dir: self
                    .interpreter
                    .executable
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default(),
                dylib_excludes: self.config.dylib_excludes.clone(),
                strip: self.config.strip,
            },
        );

        relocator.add_staged(self.launcher, layout.executable(), Role::Launcher)?;
        for node in &parts.extensions {
            if let Some(file) = &node.filename {
                relocator.add_staged(file, layout.extension_path(&node.name), Role::Extension)?;
            }
        }
        for node in &parts.whole {
            for (source, dest) in whole_destinations(node, &layout.pylib()) {
                for (file, target) in macho_files(&source, &dest)? {
                    relocator.add_staged(&file, target, Role::Extension)?;
                }
            }
        }
        for path in self.verdict.frameworks.values() {
            relocator.add_library(path)?;
        }
        for path in &self.config.frameworks {
            relocator.add_library(&self.config.resolve(path))?;
        }
        if mode == BuildMode::Standalone {
            if let Some(runtime) = &self.interpreter.runtime_library {
                relocator.add_runtime(runtime)?;
            }
        }

        let plan = relocator.plan()?;
        if let Some(arch) = self.config.arch {
            for binary in plan.binaries.iter().filter(|b| !b.archs.is_empty()) {
                if let Some(missing) = arch.slices().iter().find(|s| !binary.archs.contains(**s)) {
                    return Err(BuildError::Relocation(format!(
                        "{} has no {missing} slice (arch = {arch})",
                        binary.source.display()
                    )));
                }
            }
        }
        debug!("Relocation plan: {} binaries", plan.binaries.len());
        Ok(plan)
    }

    fn stage_launchers(&self, staged: &mut StagingSet) -> Result<()> {
        let executable = self.layout.executable();
        staged.claim(&executable)?;
        copy_executable(self.launcher, &executable)?;
        for entry in entry_points(self.config).iter().skip(1) {
            let link = self.layout.macos().join(&entry.launcher);
            staged.claim(&link)?;
            hard_link_or_copy(&executable, &link)?;
        }
        Ok(())
    }

    fn stage_scripts(&self, staged: &mut StagingSet) -> Result<()> {
        for script in self.config.scripts().iter().chain(&self.config.extra_scripts) {
            let source = self.config.resolve(script);
            resources::stage(&source, &self.layout.resources(), staged)?;
        }
        Ok(())
    }

    fn stage_modules(
        &self,
        parts: &Partition<'_>,
        staged: &mut StagingSet,
        summary: &mut EmitSummary,
    ) -> Result<()> {
        let pylib = self.layout.pylib();
        self.reporter.section("Compiling modules");

        let compiled: Vec<&ModuleNode> = parts
            .archived
            .iter()
            .chain(&parts.unpacked)
            .copied()
            .filter(|n| matches!(n.kind, NodeKind::SourceModule | NodeKind::SourcePackage))
            .collect();
        let jobs: Vec<CompileJob> = compiled
            .iter()
            .filter_map(|n| {
                Some(CompileJob {
                    source: n.filename.clone()?,
                    archive_stem: archive_stem(n),
                })
            })
            .collect();
        let outputs = self.compiler.compile(&jobs)?;

        let unpacked: BTreeSet<&str> = parts.unpacked.iter().map(|n| n.name.as_str()).collect();
        let mut archive = ArchiveBuilder::new();
        for (node, module) in compiled.iter().zip(outputs) {
            if unpacked.contains(node.name.as_str()) {
                let dest = pylib.join(&module.archive_path);
                staged.claim(&dest)?;
                write_file(&dest, &module.data)?;
            } else {
                archive.add(module.archive_path, module.data)?;
            }
        }
        for node in &parts.archived {
            for (member, source) in data_members(node) {
                let data = fs::read(&source).at("Failed to read", &source)?;
                archive.add(member, data)?;
            }
        }
        for node in &parts.unpacked {
            for (member, source) in data_members(node) {
                let dest = pylib.join(member);
                staged.claim(&dest)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).at("Failed to create", parent)?;
                }
                fs::copy(&source, &dest).at("Failed to copy", &source)?;
            }
        }
        summary.archived = archive.len();
        summary.unpacked = parts.unpacked.len();
        let zip = self.layout.site_packages_zip();
        staged.claim(&zip)?;
        archive.write(&zip)?;

        for node in &parts.whole {
            for (source, dest) in whole_destinations(node, &pylib) {
                if !staged.contains(&dest) {
                    staged.claim(&dest)?;
                }
                if source.is_dir() {
                    copy_tree(&source, &dest, |rel| {
                        !rel.extension().is_some_and(|e| e == "pyc")
                    })?;
                } else {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).at("Failed to create", parent)?;
                    }
                    fs::copy(&source, &dest).at("Failed to copy", &source)?;
                }
            }
            summary.whole_packages += 1;
        }

        for node in &parts.extensions {
            let Some(file) = &node.filename else {
                continue;
            };
            let dest = self.layout.extension_path(&node.name);
            staged.claim(&dest)?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).at("Failed to create", parent)?;
            }
            fs::copy(file, &dest).at("Failed to copy", file)?;
            summary.extensions += 1;
        }
        Ok(())
    }

    fn write_manifest(
        &self,
        plan: &RelocationPlan,
        icon: Option<String>,
        staged: &mut StagingSet,
    ) -> Result<()> {
        let layout = self.layout;
        let frameworks = layout.frameworks();
        let embedded = plan
            .runtime
            .as_deref()
            .and_then(|p| p.strip_prefix(&frameworks).ok());
        let input = ManifestInput {
            config: self.config,
            executable: layout.name(),
            python_version: self.interpreter.version,
            python_executable: &self.interpreter.executable,
            runtime_locations: manifest::runtime_locations(
                self.config.mode(),
                self.interpreter.version,
                embedded,
                self.interpreter.runtime_library.as_deref(),
            ),
            resource_packages: layout.resource_packages(),
            icon,
        };
        let dict = manifest::compose(&input)?;

        let info_plist = layout.info_plist();
        staged.claim(&info_plist)?;
        manifest::write_info_plist(&info_plist, dict, self.config.plist_format)?;
        let pkg_info = layout.pkg_info();
        staged.claim(&pkg_info)?;
        manifest::write_pkg_info(&pkg_info, self.config.kind())
    }

    fn write_bootstrap(&self, staged: &mut StagingSet) -> Result<()> {
        let alias_paths = if self.config.mode() == BuildMode::Alias {
            alias_paths(self.config)
        } else {
            Vec::new()
        };
        let bootstrap = Bootstrap::from_config(self.config, &self.verdict.prescripts, alias_paths);
        let path = self.layout.bootstrap();
        staged.claim(&path)?;
        bootstrap.write(&path)
    }
}

/// Directories of the entry scripts, for `sys.path` in alias builds.
fn alias_paths(config: &BuildConfig) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for script in config.scripts().iter().chain(&config.extra_scripts) {
        let resolved = config.resolve(script);
        let resolved = fs::canonicalize(&resolved).unwrap_or(resolved);
        if let Some(dir) = resolved.parent() {
            if !out.iter().any(|d| d == dir) {
                out.push(dir.to_path_buf());
            }
        }
    }
    out
}

/// Mach-O files below `source`, paired with their destination below `dest`.
fn macho_files(source: &Path, dest: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    if source.is_file() {
        return Ok(match MachoFile::open(source)? {
            Some(_) => vec![(source.to_path_buf(), dest.to_path_buf())],
            None => Vec::new(),
        });
    }
    let mut out = Vec::new();
    let files = walkdir::WalkDir::new(source)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !fsutil::is_scm_or_backup(&e.file_name().to_string_lossy()))
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file());
    for entry in files {
        let Ok(rel) = entry.path().strip_prefix(source) else {
            continue;
        };
        if MachoFile::open(entry.path())?.is_some() {
            out.push((entry.path().to_path_buf(), dest.join(rel)));
        }
    }
    Ok(out)
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).at("Failed to create", parent)?;
    }
    fs::write(path, data).at("Failed to write", path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::SourceCompiler;
    use crate::finder::{FinderOptions, ModuleFinder};
    use crate::recipes::tests::Site;
    use crate::relinker::RecordingEditor;
    use crate::reporter::NullReporter;

    fn site() -> Site {
        Site::new(&[
            ("src/main.py", "import json\nimport helper\nimport big.inner\n"),
            ("src/helper.py", "X = 1\n"),
            ("lib/python3.12/json/__init__.py", "from . import decoder\n"),
            ("lib/python3.12/json/decoder.py", ""),
            ("lib/python3.12/site-packages/big/__init__.py", ""),
            ("lib/python3.12/site-packages/big/inner/__init__.py", ""),
            ("lib/python3.12/site-packages/big/inner/data.txt", "d"),
            ("lib/python3.12/site-packages/big/other.py", ""),
            ("launcher", "#!/bin/sh\n"),
        ])
    }

    fn finder<'a>(site: &'a Site, packages: &[&str]) -> ModuleFinder<'a> {
        let options = FinderOptions {
            packages: packages.iter().map(|s| (*s).to_string()).collect(),
            ..FinderOptions::default()
        };
        ModuleFinder::discover(&site.interp, &[site.path("src/main.py")], &options).unwrap()
    }

    fn names(nodes: &[&ModuleNode]) -> Vec<String> {
        let mut v: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        v.sort();
        v
    }

    #[test]
    fn test_partition_unpacks_parents_of_whole_packages() {
        let site = site();
        let finder = finder(&site, &["big.inner"]);
        let parts = partition(finder.graph(), &site.interp, BuildMode::Standalone);
        assert_eq!(names(&parts.whole), ["big.inner"]);
        assert_eq!(names(&parts.unpacked), ["big"]);
        assert_eq!(names(&parts.archived), ["helper", "json", "json.decoder"]);
    }

    #[test]
    fn test_partition_semi_standalone_and_alias() {
        let site = site();
        let finder = finder(&site, &[]);
        let semi = partition(finder.graph(), &site.interp, BuildMode::SemiStandalone);
        assert_eq!(names(&semi.archived), ["big", "big.inner", "helper"]);
        let alias = partition(finder.graph(), &site.interp, BuildMode::Alias);
        assert!(alias.archived.is_empty() && alias.whole.is_empty());
    }

    #[test]
    fn test_emit_standalone_bundle() {
        let site = site();
        let finder = finder(&site, &["big.inner"]);
        let mut config = BuildConfig::parse("app = [\"src/main.py\"]", Path::new("x.toml")).unwrap();
        config.base_dir = site.root.path().to_path_buf();
        let layout = BundleLayout::new(site.path("dist/main.app"), "main", (3, 12));
        let verdict = Verdict::new();
        let editor = RecordingEditor::new();

        let emitter = Emitter {
            config: &config,
            layout: &layout,
            launcher: &site.path("launcher"),
            interpreter: &site.interp,
            graph: finder.graph(),
            verdict: &verdict,
            compiler: &SourceCompiler,
            editor: &editor,
            reporter: &NullReporter,
        };
        let summary = emitter.emit().unwrap();
        assert_eq!(summary.whole_packages, 1);

        let pylib = layout.pylib();
        assert!(layout.executable().is_file());
        assert!(layout.resources().join("main.py").is_file());
        assert!(pylib.join("big/__init__.py").is_file());
        assert!(pylib.join("big/inner/data.txt").is_file());
        assert!(layout.info_plist().is_file());
        assert_eq!(fs::read_to_string(layout.pkg_info()).unwrap(), "APPL????");
        assert!(fs::read_to_string(layout.bootstrap()).unwrap().contains("DEFAULT_SCRIPT = \"main.py\""));

        let zip = fs::File::open(layout.site_packages_zip()).unwrap();
        let zip = zip::ZipArchive::new(zip).unwrap();
        let members: Vec<&str> = zip.file_names().collect();
        assert!(members.contains(&"json/__init__.py"));
        assert!(members.contains(&"helper.py"));
        assert!(!members.iter().any(|m| m.starts_with("big/")));

        // Rebuilding with the same inputs produces the same archive.
        let first = fs::read(layout.site_packages_zip()).unwrap();
        emitter.emit().unwrap();
        assert_eq!(fs::read(layout.site_packages_zip()).unwrap(), first);
        assert!(editor.applied().is_empty());
    }
}
