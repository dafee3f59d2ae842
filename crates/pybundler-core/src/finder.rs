//! Module discovery.
//!
//! Starting from the entry scripts and explicit includes, the finder resolves
//! every import it can see against the search path, the same way the
//! interpreter's path-based finder would, and records the result in a
//! [`ModuleGraph`].
//!
//! Resolution order for a name inside one search-path directory: a package
//! directory with `__init__.py`, then an extension module for each suffix,
//! then `<name>.py`. Directories without `__init__.py` are namespace portions;
//! they are collected across all entries and only used when no regular module
//! or package is found anywhere.
//!
//! Conditional imports are followed as eagerly as unconditional ones; only
//! the report treats them differently.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::graph::{ImportKind, ModuleGraph, ModuleNode, NodeKind, Reference, parent_name};
use crate::interpreter::Interpreter;
use crate::scanner::{self, ImportStatement, ScanResult};

/// Names that resolve to another module at runtime.
const ALIASES: &[(&str, &str)] = &[("os.path", "posixpath")];

/// File extensions that are never package data.
const CODE_EXTENSIONS: &[&str] = &["py", "pyi", "pyc", "pyo", "so", "dylib"];

#[derive(Debug, Clone, Default)]
pub struct FinderOptions {
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub packages: Vec<String>,
}

#[derive(Debug)]
enum Found {
    Package { dir: PathBuf, init: PathBuf },
    Extension(PathBuf),
    Module(PathBuf),
    Namespace(Vec<PathBuf>),
}

#[derive(Debug)]
pub struct ModuleFinder<'a> {
    interpreter: &'a Interpreter,
    search_path: Vec<PathBuf>,
    excludes: Vec<String>,
    whole_packages: BTreeSet<String>,
    graph: ModuleGraph,
    pending: HashMap<String, ScanResult>,
    queue: VecDeque<String>,
}

impl<'a> ModuleFinder<'a> {
    /// A finder searching `script_dirs` first, then the interpreter's path.
    pub fn new(interpreter: &'a Interpreter, script_dirs: &[PathBuf], options: &FinderOptions) -> Self {
        Self {
            interpreter,
            search_path: interpreter.search_path(script_dirs),
            excludes: options.excludes.clone(),
            whole_packages: options.packages.iter().cloned().collect(),
            graph: ModuleGraph::new(),
            pending: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Seed the finder with scripts, includes and packages and run it to completion.
    pub fn discover(
        interpreter: &'a Interpreter,
        scripts: &[PathBuf],
        options: &FinderOptions,
    ) -> Result<Self> {
        let script_dirs: Vec<PathBuf> = scripts
            .iter()
            .filter_map(|s| s.parent().map(Path::to_path_buf))
            .collect();
        let mut finder = Self::new(interpreter, &script_dirs, options);
        for script in scripts {
            finder.add_script(script)?;
        }
        for name in &options.includes {
            finder.include(name);
        }
        for name in &options.packages {
            finder.include_package(name);
        }
        finder.run()?;
        Ok(finder)
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    pub fn into_graph(self) -> ModuleGraph {
        self.graph
    }

    pub fn interpreter(&self) -> &Interpreter {
        self.interpreter
    }

    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Graph key of an entry script.
    pub fn script_key(path: &Path) -> String {
        let stem = path.file_stem().map_or_else(String::new, |s| s.to_string_lossy().into_owned());
        format!("__main__:{stem}")
    }

    /// Add an entry script as a root and scan it.
    pub fn add_script(&mut self, path: &Path) -> Result<()> {
        let key = Self::script_key(path);
        let scan = scanner::scan_file(path)?;
        let mut node = ModuleNode::new(&key, NodeKind::SourceModule).with_file(path);
        node.root = true;
        node.script = true;
        node.uses_dunder_file = scan.uses_dunder_file;
        node.globals.clone_from(&scan.globals);
        if self.graph.insert(node) {
            self.pending.insert(key.clone(), scan);
            self.queue.push_back(key);
        }
        Ok(())
    }

    /// Force `name` (and its parents) into the graph as a root.
    pub fn include(&mut self, name: &str) {
        self.ensure_chain(name);
        if let Some(node) = self.graph.get_mut(name) {
            node.root = true;
        }
    }

    /// Include `name` as a whole package: copied verbatim, never scanned.
    pub fn include_package(&mut self, name: &str) {
        self.whole_packages.insert(name.to_string());
        let previously_known = self.graph.contains(name);
        self.include(name);

        let mut to_mark = vec![name.to_string()];
        to_mark.extend(self.graph.descendants(name).map(|n| n.name.clone()));
        for n in to_mark {
            if let Some(node) = self.graph.get_mut(&n) {
                if node.kind.has_file() || node.kind == NodeKind::NamespacePackage {
                    node.whole_package = true;
                }
            }
        }
        if previously_known {
            debug!("{name} was already discovered; now shipped as a whole package");
        }
    }

    /// Process the work queue until every reachable module is in the graph.
    pub fn run(&mut self) -> Result<()> {
        while let Some(name) = self.queue.pop_front() {
            let Some(scan) = self.pending.remove(&name) else {
                continue;
            };
            trace!("Scanning {name}: {} import(s)", scan.imports.len());
            for stmt in &scan.imports {
                self.process_import(&name, stmt);
            }
        }
        Ok(())
    }

    fn process_import(&mut self, importer: &str, stmt: &ImportStatement) {
        let Some(base) = self.absolute_name(importer, stmt) else {
            warn!(
                "{importer}:{}: relative import beyond top-level package ignored",
                stmt.line
            );
            return;
        };
        let cond = stmt.conditional;
        let kind = |k: ImportKind| if cond { ImportKind::Conditional } else { k };

        match &stmt.names {
            None => {
                // `import a.b.c` binds `a` and imports every prefix.
                let mut prefix = String::new();
                for part in base.split('.') {
                    if !prefix.is_empty() {
                        prefix.push('.');
                    }
                    prefix.push_str(part);
                    self.ensure_chain(&prefix);
                    self.graph.add_edge(importer, &prefix, Reference::new(kind(ImportKind::Top)));
                }
            }
            Some(names) => {
                if base.is_empty() {
                    return;
                }
                self.ensure_chain(&base);
                self.graph
                    .add_edge(importer, &base, Reference::new(kind(ImportKind::From)));

                let Some(target) = self.graph.get(&base) else {
                    return;
                };
                let target_kind = target.kind;
                let globals = target.globals.clone();

                for item in names {
                    if item == "*" {
                        if let Some(node) = self.graph.get_mut(importer) {
                            node.uses_star = true;
                        }
                        if target_kind.is_package() {
                            for sub in self.submodules_on_disk(&base) {
                                self.ensure_chain(&sub);
                                self.graph
                                    .add_edge(importer, &sub, Reference::new(kind(ImportKind::Star)));
                            }
                        }
                        continue;
                    }

                    let full = format!("{base}.{item}");
                    if target_kind.is_package() {
                        if self.graph.contains(&full) || self.locate_submodule(&base, item).is_some() {
                            self.ensure_chain(&full);
                            self.graph
                                .add_edge(importer, &full, Reference::fromlist(kind(ImportKind::From)));
                        } else if !globals.contains(item) {
                            // Neither a submodule nor a known attribute.
                            self.ensure_chain(&full);
                            self.graph
                                .add_edge(importer, &full, Reference::fromlist(kind(ImportKind::From)));
                        }
                    } else if ALIASES.iter().any(|(a, _)| *a == full) {
                        self.ensure_chain(&full);
                        self.graph
                            .add_edge(importer, &full, Reference::fromlist(kind(ImportKind::From)));
                    }
                }
            }
        }
    }

    /// Resolve the module part of a (possibly relative) import to an absolute name.
    fn absolute_name(&self, importer: &str, stmt: &ImportStatement) -> Option<String> {
        if stmt.level == 0 {
            return Some(stmt.module.clone());
        }
        let node = self.graph.get(importer)?;
        if node.script {
            return None;
        }
        let mut package = if node.kind.is_package() {
            node.name.as_str()
        } else {
            parent_name(&node.name)?
        };
        for _ in 1..stmt.level {
            package = parent_name(package)?;
        }
        Some(if stmt.module.is_empty() {
            package.to_string()
        } else {
            format!("{package}.{}", stmt.module)
        })
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.excludes
            .iter()
            .any(|ex| name == ex || name.strip_prefix(ex.as_str()).is_some_and(|r| r.starts_with('.')))
    }

    fn in_whole_package(&self, name: &str) -> bool {
        self.whole_packages
            .iter()
            .any(|p| name == p || name.strip_prefix(p.as_str()).is_some_and(|r| r.starts_with('.')))
    }

    /// Make sure `name` and all its parent packages are nodes.
    fn ensure_chain(&mut self, name: &str) {
        if self.graph.contains(name) {
            return;
        }
        if let Some(parent) = parent_name(name) {
            let parent = parent.to_string();
            self.ensure_chain(&parent);
        }
        self.create_node(name);
    }

    fn create_node(&mut self, name: &str) {
        let parent = parent_name(name).map(str::to_string);

        let node = if self.is_excluded(name) {
            ModuleNode::new(name, NodeKind::Excluded)
        } else if let Some((_, target)) = ALIASES.iter().find(|(a, _)| *a == name) {
            let mut node = ModuleNode::new(name, NodeKind::Alias);
            node.alias_of = Some((*target).to_string());
            node
        } else if let Some(parent) = &parent {
            let parent_node = self.graph.get(parent);
            match parent_node.map(|p| (p.kind, p.package_path.clone())) {
                Some((kind, path)) if kind.is_package() => {
                    let last = name.rsplit('.').next().unwrap_or(name);
                    self.node_from_search(name, &path, last)
                }
                Some((NodeKind::Excluded, _)) => ModuleNode::new(name, NodeKind::Excluded),
                _ => ModuleNode::new(name, NodeKind::Missing),
            }
        } else if self.interpreter.builtin_modules.contains(name) {
            ModuleNode::new(name, NodeKind::Builtin)
        } else if self.interpreter.frozen_modules.contains(name) {
            ModuleNode::new(name, NodeKind::Frozen)
        } else {
            let path = self.search_path.clone();
            self.node_from_search(name, &path, name)
        };

        let kind = node.kind;
        let alias_target = node.alias_of.clone();
        let mut node = node;
        node.whole_package = self.in_whole_package(name) && (kind.has_file() || kind == NodeKind::NamespacePackage);

        if matches!(kind, NodeKind::SourceModule | NodeKind::SourcePackage) && !node.whole_package {
            if let Some(file) = node.filename.clone() {
                match scanner::scan_file(&file) {
                    Ok(scan) => {
                        node.uses_dunder_file = scan.uses_dunder_file;
                        node.globals.clone_from(&scan.globals);
                        self.pending.insert(name.to_string(), scan);
                        self.queue.push_back(name.to_string());
                    }
                    Err(e) => warn!("Could not scan {name}: {e}"),
                }
            }
        }

        debug!("{name}: {kind:?}");
        self.graph.insert(node);

        if let Some(parent) = parent {
            self.graph.add_edge(name, &parent, Reference::new(ImportKind::Top));
        }
        if let Some(target) = alias_target {
            self.ensure_chain(&target);
            self.graph.add_edge(name, &target, Reference::new(ImportKind::Top));
        }
    }

    fn node_from_search(&self, name: &str, dirs: &[PathBuf], last: &str) -> ModuleNode {
        match self.find_in(dirs, last) {
            Some(Found::Package { dir, init }) => {
                let mut node = ModuleNode::new(name, NodeKind::SourcePackage).with_file(init);
                node.data_files = self.package_data(&dir);
                node.package_path = vec![dir];
                node
            }
            Some(Found::Extension(path)) => ModuleNode::new(name, NodeKind::NativeExtension).with_file(path),
            Some(Found::Module(path)) => ModuleNode::new(name, NodeKind::SourceModule).with_file(path),
            Some(Found::Namespace(dirs)) => {
                let mut node = ModuleNode::new(name, NodeKind::NamespacePackage);
                node.data_files = dirs.iter().flat_map(|d| self.package_data(d)).collect();
                node.package_path = dirs;
                node
            }
            None => ModuleNode::new(name, NodeKind::Missing),
        }
    }

    fn find_in(&self, dirs: &[PathBuf], last: &str) -> Option<Found> {
        let mut portions = Vec::new();
        for dir in dirs {
            let pkg = dir.join(last);
            let pkg_is_dir = pkg.is_dir();
            if pkg_is_dir {
                let init = pkg.join("__init__.py");
                if init.is_file() {
                    return Some(Found::Package { dir: pkg, init });
                }
            }
            for suffix in &self.interpreter.extension_suffixes {
                let ext = dir.join(format!("{last}{suffix}"));
                if ext.is_file() {
                    return Some(Found::Extension(ext));
                }
            }
            let module = dir.join(format!("{last}.py"));
            if module.is_file() {
                return Some(Found::Module(module));
            }
            if pkg_is_dir {
                portions.push(pkg);
            }
        }
        (!portions.is_empty()).then_some(Found::Namespace(portions))
    }

    fn locate_submodule(&self, package: &str, last: &str) -> Option<Found> {
        let dirs = &self.graph.get(package)?.package_path;
        self.find_in(dirs, last)
    }

    /// Names of every module and package directly inside `package` on disk.
    fn submodules_on_disk(&self, package: &str) -> Vec<String> {
        let Some(node) = self.graph.get(package) else {
            return Vec::new();
        };
        let mut found = BTreeSet::new();
        for dir in &node.package_path {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.filter_map(std::result::Result::ok) {
                let path = entry.path();
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if path.is_dir() {
                    if path.join("__init__.py").is_file() && is_identifier(&file_name) {
                        found.insert(file_name);
                    }
                    continue;
                }
                let stem = if let Some(stem) = file_name.strip_suffix(".py") {
                    Some(stem.to_string())
                } else {
                    self.interpreter
                        .extension_suffixes
                        .iter()
                        .find_map(|s| file_name.strip_suffix(s.as_str()).map(str::to_string))
                };
                if let Some(stem) = stem {
                    if stem != "__init__" && is_identifier(&stem) {
                        found.insert(stem);
                    }
                }
            }
        }
        found.into_iter().map(|s| format!("{package}.{s}")).collect()
    }

    /// Non-code files below a package directory, stopping at subpackages.
    fn package_data(&self, dir: &Path) -> Vec<PathBuf> {
        let suffixes = &self.interpreter.extension_suffixes;
        let mut files = Vec::new();
        let mut walker = walkdir::WalkDir::new(dir).sort_by_file_name().into_iter();
        while let Some(Ok(entry)) = walker.next() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy();
            if entry.depth() > 0 && crate::fsutil::is_scm_or_backup(&name) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
            if entry.file_type().is_dir() {
                if entry.depth() > 0 && path.join("__init__.py").is_file() {
                    walker.skip_current_dir();
                }
                continue;
            }
            let is_code = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| CODE_EXTENSIONS.contains(&e))
                || suffixes.iter().any(|s| name.ends_with(s.as_str()));
            if !is_code {
                files.push(path.to_path_buf());
            }
        }
        files
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}
