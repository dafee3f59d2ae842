//! The module graph: an adjacency map keyed by dotted module name.
//!
//! The graph owns every node. Edges are stored twice (`references` on the
//! importer, `referers` on the target) and are only ever added through
//! [`ModuleGraph::add_edge`], which keeps both sides in sync.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    SourceModule,
    SourcePackage,
    NamespacePackage,
    NativeExtension,
    Builtin,
    Frozen,
    Missing,
    Excluded,
    Alias,
}

impl NodeKind {
    pub fn is_package(self) -> bool {
        matches!(self, Self::SourcePackage | Self::NamespacePackage)
    }

    /// Nodes that have a file on disk the emitter must ship.
    pub fn has_file(self) -> bool {
        matches!(
            self,
            Self::SourceModule | Self::SourcePackage | Self::NativeExtension
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportKind {
    /// `import a.b`, or the implicit import of a submodule's parent package.
    Top,
    /// `from a import b`
    From,
    /// Submodules pulled in by `from pkg import *`.
    Star,
    /// Any import nested in a try block, a branch, a loop or a function body.
    Conditional,
}

/// One edge from an importer to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reference {
    pub kind: ImportKind,
    /// The target was only named in a `from P import name` list, so it may
    /// well be an attribute of `P` rather than a module.
    pub fromlist: bool,
}

impl Reference {
    pub fn new(kind: ImportKind) -> Self {
        Self {
            kind,
            fromlist: false,
        }
    }

    pub fn fromlist(kind: ImportKind) -> Self {
        Self {
            kind,
            fromlist: true,
        }
    }

    pub fn is_conditional(self) -> bool {
        self.kind == ImportKind::Conditional
    }

    /// Combine two imports of the same target by the same importer; an
    /// unconditional, real-module import wins.
    fn merge(self, other: Self) -> Self {
        let kind = match (self.kind, other.kind) {
            (ImportKind::Conditional, k) | (k, ImportKind::Conditional) => k,
            (a, b) => a.min(b),
        };
        Self {
            kind,
            fromlist: self.fromlist && other.fromlist,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleNode {
    pub name: String,
    pub kind: NodeKind,
    pub filename: Option<PathBuf>,
    /// `__path__`: one directory for regular packages, several for namespace packages.
    pub package_path: Vec<PathBuf>,
    pub referers: BTreeSet<String>,
    pub references: BTreeMap<String, Reference>,
    /// Non-Python files inside a package directory that travel with it.
    pub data_files: Vec<PathBuf>,
    /// Entry script, explicit include or recipe-declared.
    pub root: bool,
    /// Entry script rather than an importable module.
    pub script: bool,
    /// Part of a `packages` entry: copied verbatim, never scanned.
    pub whole_package: bool,
    pub uses_star: bool,
    pub uses_dunder_file: bool,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub globals: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_of: Option<String>,
}

impl ModuleNode {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            filename: None,
            package_path: Vec::new(),
            referers: BTreeSet::new(),
            references: BTreeMap::new(),
            data_files: Vec::new(),
            root: false,
            script: false,
            whole_package: false,
            uses_star: false,
            uses_dunder_file: false,
            globals: BTreeSet::new(),
            alias_of: None,
        }
    }

    pub fn with_file(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Dotted name of the containing package, if any.
    pub fn parent(&self) -> Option<&str> {
        parent_name(&self.name)
    }
}

/// `a.b.c` -> `a.b`
pub fn parent_name(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(p, _)| p)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleGraph {
    nodes: BTreeMap<String, ModuleNode>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleNode> {
        self.nodes.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ModuleNode> {
        self.nodes.get_mut(name)
    }

    /// Insert a node; an existing node with the same name is kept.
    /// Returns whether the node was new.
    pub fn insert(&mut self, node: ModuleNode) -> bool {
        if self.nodes.contains_key(&node.name) {
            return false;
        }
        self.nodes.insert(node.name.clone(), node);
        true
    }

    /// Record that `from` imports `to`. Both nodes must exist; self-edges
    /// are ignored. Returns whether both ends were present.
    pub fn add_edge(&mut self, from: &str, to: &str, reference: Reference) -> bool {
        if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
            return false;
        }
        if from == to {
            return true;
        }
        if let Some(src) = self.nodes.get_mut(from) {
            src.references
                .entry(to.to_string())
                .and_modify(|r| *r = r.merge(reference))
                .or_insert(reference);
        }
        if let Some(dst) = self.nodes.get_mut(to) {
            dst.referers.insert(from.to_string());
        }
        true
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ModuleNode> {
        self.nodes.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn by_kind(&self, kind: NodeKind) -> impl Iterator<Item = &ModuleNode> {
        self.nodes.values().filter(move |n| n.kind == kind)
    }

    /// The edge from `from` to `to`, if any.
    pub fn reference(&self, from: &str, to: &str) -> Option<Reference> {
        self.nodes.get(from)?.references.get(to).copied()
    }

    /// Every node whose name is strictly below `package`.
    pub fn descendants<'a>(&'a self, package: &'a str) -> impl Iterator<Item = &'a ModuleNode> {
        let prefix = format!("{package}.");
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v)
    }

    /// Number of nodes flagged as part of a whole package.
    pub fn whole_package_count(&self) -> usize {
        self.nodes.values().filter(|n| n.whole_package).count()
    }

    /// Check the structural invariants: every node is a root or has a
    /// referer, and every edge points at an existing node from both sides.
    pub fn check_invariants(&self) -> Result<(), String> {
        for node in self.nodes.values() {
            if !node.root && node.referers.is_empty() {
                return Err(format!("{} is neither a root nor referenced", node.name));
            }
            for target in node.references.keys() {
                let Some(dst) = self.nodes.get(target) else {
                    return Err(format!("{} references unknown {target}", node.name));
                };
                if !dst.referers.contains(&node.name) {
                    return Err(format!("{target} does not list {} as referer", node.name));
                }
            }
            for referer in &node.referers {
                let known = self
                    .nodes
                    .get(referer)
                    .is_some_and(|r| r.references.contains_key(&node.name));
                if !known {
                    return Err(format!("{} lists stale referer {referer}", node.name));
                }
            }
        }
        Ok(())
    }
}
