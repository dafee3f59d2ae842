//! Binary relocation.
//!
//! Starting from the launcher, the native extensions and any explicitly
//! requested libraries, the relocator follows every Mach-O dependency,
//! decides where each non-system library lives inside the bundle and which
//! header edits make the copies find each other:
//!
//! - a library's own install name becomes `@rpath/<path below Frameworks>`;
//! - every reference to a bundled library is rewritten to that name;
//! - each binary that references bundled libraries gets an
//!   `@loader_path/<relative path to Contents/Frameworks>` rpath;
//! - rpaths inherited from the build machine are dropped.
//!
//! Planning is pure; [`RelocationPlan::apply`] copies files and edits them.

use glob::Pattern;
use pybundler_schema::BuildMode;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{BuildError, IoContext, Result};
use crate::fsutil::{self, file_digest, relative_path};
use crate::layout::BundleLayout;
use crate::macho::{LoadKind, MachoFile, format_version};
use crate::relinker::{Edit, MachoEditor};

const SYSTEM_PREFIXES: &[&str] = &["/usr/lib/", "/System/Library/"];

/// Framework members that never ship.
const FRAMEWORK_SKIP: &[&str] = &["Headers", "PrivateHeaders", "include", "bin", "share", "Modules"];

pub fn is_system_path(name: &str) -> bool {
    SYSTEM_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// `Contents/MacOS/<Name>`, staged by the emitter.
    Launcher,
    /// A native extension in `lib-dynload`, staged by the emitter.
    Extension,
    /// A plain dylib copied to `Contents/Frameworks/<basename>`.
    Library,
    /// The binary of a framework copied as a directory.
    FrameworkBinary,
}

impl Role {
    fn copied_by_relocator(self) -> bool {
        matches!(self, Self::Library | Self::FrameworkBinary)
    }
}

/// One dependency as it will look after the edits.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedReference {
    pub original: String,
    pub rewritten: String,
    pub kind: LoadKind,
    /// Destination of the referenced library when it is bundled.
    pub target: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedBinary {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub role: Role,
    pub archs: BTreeSet<String>,
    pub compat_version: Option<u32>,
    pub references: Vec<PlannedReference>,
    /// Rpaths after the edits.
    pub rpaths: Vec<String>,
    pub edits: Vec<Edit>,
    #[serde(skip)]
    macho: Option<MachoFile>,
    /// Concrete directories `@rpath` searches from the loaders of this binary.
    #[serde(skip)]
    inherited_rpaths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameworkCopy {
    pub source: PathBuf,
    /// Name of the `Versions/*` entry that is kept.
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelocationPlan {
    pub binaries: Vec<PlannedBinary>,
    /// Framework directories to copy, keyed by destination.
    pub frameworks: BTreeMap<PathBuf, FrameworkCopy>,
    /// Where the interpreter runtime ends up, when it is embedded.
    pub runtime: Option<PathBuf>,
    /// References left pointing outside the bundle because of `dylib_excludes`.
    pub excluded: BTreeSet<String>,
    /// Strip debug and local symbols from copied binaries.
    pub strip: bool,
    pub warnings: Vec<String>,
    #[serde(skip)]
    frameworks_dir: PathBuf,
    #[serde(skip)]
    executable_dir: PathBuf,
}

/// Inputs that do not change during a walk.
#[derive(Debug, Clone)]
pub struct RelocatorOptions {
    pub mode: BuildMode,
    /// The host interpreter's shared runtime, if it has one.
    pub runtime: Option<PathBuf>,
    /// Directory `@executable_path` refers to for binaries outside the bundle.
    pub executable_dir: PathBuf,
    pub dylib_excludes: Vec<String>,
    pub strip: bool,
}

/// Where a framework binary's enclosing directory is copied from and to.
#[derive(Debug, Clone)]
struct FrameworkSlot {
    source_root: PathBuf,
    dest_root: PathBuf,
    version: Option<String>,
}

/// A library looking for its place in `Contents/Frameworks/`.
#[derive(Debug)]
struct Candidate {
    source: PathBuf,
    dest: PathBuf,
    framework: Option<FrameworkSlot>,
    macho: Option<MachoFile>,
}

#[derive(Debug)]
pub struct Relocator<'a> {
    layout: &'a BundleLayout,
    options: RelocatorOptions,
    excludes: Vec<Pattern>,
    plan: RelocationPlan,
    by_source: BTreeMap<PathBuf, usize>,
    by_dest: BTreeMap<PathBuf, usize>,
    queue: VecDeque<usize>,
}

impl<'a> Relocator<'a> {
    pub fn new(layout: &'a BundleLayout, options: RelocatorOptions) -> Self {
        let excludes = options
            .dylib_excludes
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pat) => Some(pat),
                Err(e) => {
                    warn!("Ignoring invalid dylib exclude '{p}': {e}");
                    None
                }
            })
            .collect();
        let plan = RelocationPlan {
            strip: options.strip,
            frameworks_dir: layout.frameworks(),
            executable_dir: layout.macos(),
            ..RelocationPlan::default()
        };
        Self {
            layout,
            options,
            excludes,
            plan,
            by_source: BTreeMap::new(),
            by_dest: BTreeMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// A binary the emitter stages at `dest` itself (launcher, extension).
    /// Files that are not Mach-O are ignored.
    pub fn add_staged(&mut self, source: &Path, dest: PathBuf, role: Role) -> Result<()> {
        let Some(macho) = MachoFile::open(source)? else {
            debug!("{} is not Mach-O; nothing to relocate", source.display());
            return Ok(());
        };
        let source = fs::canonicalize(source).at("Failed to resolve", source)?;
        self.push(source, dest, role, Some(macho), Vec::new());
        Ok(())
    }

    /// A library or framework that must be copied into `Contents/Frameworks/`.
    pub fn add_library(&mut self, path: &Path) -> Result<usize> {
        let binary = framework_binary(path).unwrap_or_else(|| path.to_path_buf());
        let source = fs::canonicalize(&binary).at("Failed to resolve", &binary)?;
        self.library(source, Vec::new())
    }

    /// Embed the interpreter runtime (standalone builds).
    pub fn add_runtime(&mut self, path: &Path) -> Result<()> {
        let idx = self.add_library(path)?;
        self.plan.runtime = Some(self.plan.binaries[idx].dest.clone());
        Ok(())
    }

    /// Walk the dependency graph and produce the plan.
    pub fn plan(mut self) -> Result<RelocationPlan> {
        while let Some(idx) = self.queue.pop_front() {
            self.process(idx)?;
        }
        self.plan.binaries.sort_by(|a, b| a.dest.cmp(&b.dest));
        self.plan.verify()?;
        Ok(self.plan)
    }

    fn push(
        &mut self,
        source: PathBuf,
        dest: PathBuf,
        role: Role,
        macho: Option<MachoFile>,
        inherited_rpaths: Vec<PathBuf>,
    ) -> usize {
        let idx = self.plan.binaries.len();
        self.plan.binaries.push(PlannedBinary {
            source: source.clone(),
            dest: dest.clone(),
            role,
            archs: macho.as_ref().map(MachoFile::archs).unwrap_or_default(),
            compat_version: macho.as_ref().and_then(MachoFile::compat_version),
            references: Vec::new(),
            rpaths: Vec::new(),
            edits: Vec::new(),
            macho,
            inherited_rpaths,
        });
        self.by_source.insert(source, idx);
        self.by_dest.insert(dest, idx);
        self.queue.push_back(idx);
        idx
    }

    /// Place a library by canonical source path, handling collisions.
    fn library(&mut self, source: PathBuf, inherited: Vec<PathBuf>) -> Result<usize> {
        if let Some(&idx) = self.by_source.get(&source) {
            return Ok(idx);
        }
        let (dest, role, framework) = self.destination(&source);
        let candidate = Candidate {
            macho: MachoFile::open(&source)?,
            source,
            dest,
            framework,
        };

        if let Some(existing) = self.rival(&candidate) {
            return self.collide(existing, candidate);
        }

        if let Some(slot) = &candidate.framework {
            self.plan.frameworks.insert(
                slot.dest_root.clone(),
                FrameworkCopy {
                    source: slot.source_root.clone(),
                    version: slot.version.clone(),
                },
            );
        }
        Ok(self.push(candidate.source, candidate.dest, role, candidate.macho, inherited))
    }

    /// An already placed binary that `candidate` would displace: one at the
    /// same destination, or the binary of another framework with the same
    /// name.
    fn rival(&self, candidate: &Candidate) -> Option<usize> {
        if let Some(&idx) = self.by_dest.get(&candidate.dest) {
            return Some(idx);
        }
        let slot = candidate.framework.as_ref()?;
        let copy = self.plan.frameworks.get(&slot.dest_root)?;
        if copy.source == slot.source_root {
            return None;
        }
        let stem = slot.source_root.file_stem();
        let inside: Vec<usize> = self
            .plan
            .binaries
            .iter()
            .enumerate()
            .filter(|(_, b)| b.role == Role::FrameworkBinary && b.dest.starts_with(&slot.dest_root))
            .map(|(i, _)| i)
            .collect();
        inside
            .iter()
            .copied()
            .find(|&i| self.plan.binaries[i].dest.file_name() == stem)
            .or_else(|| inside.first().copied())
    }

    /// Two different files want the same place; the higher compatibility
    /// version wins.
    fn collide(&mut self, existing: usize, candidate: Candidate) -> Result<usize> {
        let current = &self.plan.binaries[existing];
        let old_version = current.compat_version.unwrap_or(0);
        let new_version = candidate
            .macho
            .as_ref()
            .and_then(MachoFile::compat_version)
            .unwrap_or(0);
        let dest = current.dest.display().to_string();

        if old_version == new_version {
            if file_digest(&current.source)? != file_digest(&candidate.source)? {
                return Err(BuildError::Relocation(format!(
                    "{} and {} both claim {dest} with the same version but different contents",
                    current.source.display(),
                    candidate.source.display()
                )));
            }
            self.by_source.insert(candidate.source, existing);
            return Ok(existing);
        }

        let message = format!(
            "{dest}: {} ({}) and {} ({}) collide; keeping version {}",
            current.source.display(),
            format_version(old_version),
            candidate.source.display(),
            format_version(new_version),
            format_version(old_version.max(new_version))
        );
        warn!("{message}");
        self.plan.warnings.push(message);

        if new_version > old_version {
            let Candidate {
                source,
                dest,
                framework,
                macho,
            } = candidate;
            let binary = &mut self.plan.binaries[existing];
            binary.archs = macho.as_ref().map(MachoFile::archs).unwrap_or_default();
            binary.compat_version = macho.as_ref().and_then(MachoFile::compat_version);
            binary.source.clone_from(&source);
            binary.macho = macho;
            let old_dest = std::mem::replace(&mut binary.dest, dest.clone());

            if let Some(slot) = framework {
                self.plan.frameworks.insert(
                    slot.dest_root,
                    FrameworkCopy {
                        source: slot.source_root,
                        version: slot.version,
                    },
                );
            }
            if old_dest != dest {
                self.by_dest.remove(&old_dest);
                self.by_dest.insert(dest, existing);
                // Loaders planned against the old location get planned again.
                let stale: Vec<usize> = self
                    .plan
                    .binaries
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| b.references.iter().any(|r| r.target.as_ref() == Some(&old_dest)))
                    .map(|(i, _)| i)
                    .collect();
                self.queue.extend(stale);
            }
            self.queue.push_back(existing);
            self.by_source.insert(source, existing);
            return Ok(existing);
        }
        self.by_source.insert(candidate.source, existing);
        Ok(existing)
    }

    /// Destination of a library, plus the framework directory it belongs to.
    fn destination(&self, source: &Path) -> (PathBuf, Role, Option<FrameworkSlot>) {
        let frameworks = self.layout.frameworks();
        if let Some(root) = framework_root(source) {
            let rel = source.strip_prefix(&root).unwrap_or(source);
            let name = root.file_name().map(PathBuf::from).unwrap_or_default();
            let version = match rel.components().collect::<Vec<_>>().as_slice() {
                [Component::Normal(v), Component::Normal(ver), ..] if *v == "Versions" => {
                    Some(ver.to_string_lossy().into_owned())
                }
                _ => None,
            };
            let dest_root = frameworks.join(&name);
            let dest = dest_root.join(rel);
            let slot = FrameworkSlot {
                source_root: root.clone(),
                dest_root,
                version,
            };
            return (dest, Role::FrameworkBinary, Some(slot));
        }
        let name = source.file_name().map(PathBuf::from).unwrap_or_default();
        (frameworks.join(name), Role::Library, None)
    }

    fn is_host_runtime(&self, path: &Path) -> bool {
        if self.options.mode == BuildMode::Standalone {
            return false;
        }
        let Some(runtime) = &self.options.runtime else {
            return false;
        };
        let runtime = fs::canonicalize(runtime).unwrap_or_else(|_| runtime.clone());
        match framework_root(&runtime) {
            Some(root) => path.starts_with(root),
            None => path == runtime,
        }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.excludes
            .iter()
            .any(|p| p.matches_path(path) || p.matches(&name))
    }

    fn process(&mut self, idx: usize) -> Result<()> {
        let (source, dest, role, inherited) = {
            let b = &self.plan.binaries[idx];
            (b.source.clone(), b.dest.clone(), b.role, b.inherited_rpaths.clone())
        };
        let Some(macho) = self.plan.binaries[idx].macho.clone() else {
            return Ok(());
        };
        let loader_dir = source.parent().map(Path::to_path_buf).unwrap_or_default();
        let own_rpaths: Vec<PathBuf> = macho
            .rpaths()
            .into_iter()
            .filter_map(|r| self.expand(r, &loader_dir))
            .collect();
        let mut search: Vec<PathBuf> = own_rpaths;
        search.extend(inherited);

        let frameworks = self.layout.frameworks();
        let mut edits = Vec::new();
        let mut references = Vec::new();

        if role.copied_by_relocator() {
            let id = rpath_name(&frameworks, &dest);
            if macho.install_name().is_some_and(|current| current != id) {
                edits.push(Edit::SetId(id));
            }
        }

        let mut bundles_any = false;
        for dep in macho.dependencies() {
            let mut reference = PlannedReference {
                original: dep.name.clone(),
                rewritten: dep.name.clone(),
                kind: dep.kind,
                target: None,
            };
            if is_system_path(&dep.name) {
                references.push(reference);
                continue;
            }
            let Some(found) = self.resolve(&dep.name, &loader_dir, &search) else {
                if dep.kind == LoadKind::Weak {
                    let message = format!("{}: weak dependency {} not found", source.display(), dep.name);
                    warn!("{message}");
                    self.plan.warnings.push(message);
                    references.push(reference);
                    continue;
                }
                return Err(BuildError::Relocation(format!(
                    "{} depends on {}, which cannot be found",
                    source.display(),
                    dep.name
                )));
            };
            let found = fs::canonicalize(&found).at("Failed to resolve", &found)?;
            if is_system_path(&found.to_string_lossy()) || self.is_host_runtime(&found) {
                references.push(reference);
                continue;
            }
            if self.is_excluded(&found) {
                let message = format!("{}: {} left in place (excluded)", source.display(), dep.name);
                debug!("{message}");
                self.plan.warnings.push(message);
                self.plan.excluded.insert(dep.name.clone());
                references.push(reference);
                continue;
            }

            let dep_idx = self.library(found, search.clone())?;
            let target = &self.plan.binaries[dep_idx];
            if let Some(lacking) = macho
                .archs()
                .iter()
                .find(|a| target.macho.is_some() && !target.archs.contains(*a))
            {
                return Err(BuildError::Relocation(format!(
                    "{} lacks architecture {lacking} required by {}",
                    target.source.display(),
                    source.display()
                )));
            }

            let new_name = rpath_name(&frameworks, &target.dest);
            if new_name != dep.name {
                edits.push(Edit::Change {
                    old: dep.name.clone(),
                    new: new_name.clone(),
                });
            }
            reference.rewritten = new_name;
            reference.target = Some(target.dest.clone());
            references.push(reference);
            bundles_any = true;
        }

        let rpath = bundles_any.then(|| {
            let rel = dest
                .parent()
                .map(|d| relative_path(d, &frameworks))
                .unwrap_or_default();
            if rel.as_os_str().is_empty() {
                "@loader_path".to_string()
            } else {
                format!("@loader_path/{}", rel.display())
            }
        });
        let existing = macho.rpaths();
        for r in &existing {
            if rpath.as_deref() != Some(*r) {
                edits.push(Edit::DeleteRpath((*r).to_string()));
            }
        }
        let mut rpaths = Vec::new();
        if let Some(rpath) = rpath {
            if !existing.contains(&rpath.as_str()) {
                edits.push(Edit::AddRpath(rpath.clone()));
            }
            rpaths.push(rpath);
        }

        let binary = &mut self.plan.binaries[idx];
        binary.edits = edits;
        binary.references = references;
        binary.rpaths = rpaths;
        Ok(())
    }

    /// Turn an rpath entry of a binary outside the bundle into a directory.
    fn expand(&self, rpath: &str, loader_dir: &Path) -> Option<PathBuf> {
        if let Some(rest) = rpath.strip_prefix("@loader_path") {
            Some(normalize(&loader_dir.join(rest.trim_start_matches('/'))))
        } else if let Some(rest) = rpath.strip_prefix("@executable_path") {
            Some(normalize(&self.options.executable_dir.join(rest.trim_start_matches('/'))))
        } else if rpath.starts_with('/') {
            Some(PathBuf::from(rpath))
        } else {
            None
        }
    }

    fn resolve(&self, name: &str, loader_dir: &Path, rpaths: &[PathBuf]) -> Option<PathBuf> {
        if let Some(rest) = name.strip_prefix("@rpath/") {
            return rpaths.iter().map(|r| r.join(rest)).find(|p| p.exists());
        }
        let candidate = if name.starts_with('@') {
            self.expand(name, loader_dir)?
        } else if name.starts_with('/') {
            PathBuf::from(name)
        } else {
            loader_dir.join(name)
        };
        candidate.exists().then_some(candidate)
    }
}

/// `@rpath/<dest relative to Frameworks>`
fn rpath_name(frameworks: &Path, dest: &Path) -> String {
    let rel = dest.strip_prefix(frameworks).unwrap_or(dest);
    format!("@rpath/{}", rel.display())
}

/// The `Foo.framework` directory containing `path`, if any.
fn framework_root(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|a| a.extension().is_some_and(|e| e == "framework"))
        .map(Path::to_path_buf)
}

/// `Foo.framework` -> `Foo.framework/Foo` (through the `Versions/Current` symlinks).
fn framework_binary(path: &Path) -> Option<PathBuf> {
    if path.extension()? != "framework" || !path.is_dir() {
        return None;
    }
    let stem = path.file_stem()?;
    Some(path.join(stem))
}

/// Lexically resolve `.` and `..`.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Whether a path inside a framework directory is shipped.
fn keep_framework_entry(rel: &Path, version: Option<&str>) -> bool {
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if let ([first, second, ..], Some(version)) = (parts.as_slice(), version) {
        if first == "Versions" && second != "Current" && second != version {
            return false;
        }
    }
    for (i, part) in parts.iter().enumerate() {
        if FRAMEWORK_SKIP.contains(&part.as_str())
            || part.ends_with(".dSYM")
            || part.ends_with(".app")
            || fsutil::is_scm_or_backup(part)
        {
            return false;
        }
        if part.starts_with("python") && i > 0 && parts[i - 1] == "lib" {
            return false;
        }
    }
    true
}

impl RelocationPlan {
    pub fn is_empty(&self) -> bool {
        self.binaries.is_empty()
    }

    /// Every bundled binary's non-system references resolve inside the bundle.
    pub fn verify(&self) -> Result<()> {
        let dests: BTreeSet<&Path> = self.binaries.iter().map(|b| b.dest.as_path()).collect();
        for binary in self.binaries.iter().filter(|b| b.macho.is_some()) {
            let loader_dir = binary.dest.parent().unwrap_or(&binary.dest);
            for reference in &binary.references {
                let name = &reference.rewritten;
                if is_system_path(name) || reference.target.is_none() {
                    continue;
                }
                let candidates: Vec<PathBuf> = if let Some(rest) = name.strip_prefix("@rpath/") {
                    binary
                        .rpaths
                        .iter()
                        .filter_map(|r| {
                            let dir = r
                                .strip_prefix("@loader_path")
                                .map(|p| loader_dir.join(p.trim_start_matches('/')))
                                .or_else(|| {
                                    r.strip_prefix("@executable_path")
                                        .map(|p| self.executable_dir.join(p.trim_start_matches('/')))
                                })?;
                            Some(normalize(&dir.join(rest)))
                        })
                        .collect()
                } else if let Some(rest) = name.strip_prefix("@loader_path/") {
                    vec![normalize(&loader_dir.join(rest))]
                } else {
                    Vec::new()
                };
                if !candidates.iter().any(|c| dests.contains(c.as_path())) {
                    return Err(BuildError::Relocation(format!(
                        "{} still references {name} outside the bundle",
                        binary.dest.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Copy libraries and frameworks into the bundle and edit every binary.
    ///
    /// Returns the number of binaries whose load commands changed.
    pub fn apply(&self, editor: &dyn MachoEditor) -> Result<usize> {
        for (dest, copy) in &self.frameworks {
            let version = copy.version.as_deref();
            fsutil::copy_tree(&copy.source, dest, |rel| keep_framework_entry(rel, version))?;
        }
        fs::create_dir_all(&self.frameworks_dir).at("Failed to create", &self.frameworks_dir)?;

        let mut edited = 0;
        for binary in &self.binaries {
            if binary.role == Role::Library {
                fs::copy(&binary.source, &binary.dest).at("Failed to copy", &binary.dest)?;
            }
            if binary.role.copied_by_relocator() {
                make_writable(&binary.dest)?;
            }
            let strip = self.strip && binary.role != Role::Launcher && binary.macho.is_some();
            if strip {
                editor.strip(&binary.dest)?;
            }
            if !binary.edits.is_empty() {
                editor.apply(&binary.dest, &binary.edits)?;
                edited += 1;
            }
            if strip || !binary.edits.is_empty() {
                editor.resign(&binary.dest)?;
            }
        }
        Ok(edited)
    }
}

fn make_writable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path).at("Failed to stat", path)?;
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() | 0o200);
    fs::set_permissions(path, perms).at("Failed to chmod", path)
}
