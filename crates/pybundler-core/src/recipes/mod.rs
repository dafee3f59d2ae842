//! Recipe engine.
//!
//! A recipe looks at the module graph and, when it recognizes something,
//! returns a [`Verdict`]: extra modules and packages to pull in, prescripts
//! for the bootstrap, resources, frameworks and names that are expected to
//! be missing. Recipes never mutate the graph themselves; the engine feeds
//! their additions back through the finder and repeats until nothing grows.

mod generic;
mod packages;
mod stdlib;

use pybundler_schema::BuildMode;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{BuildError, Result};
use crate::finder::ModuleFinder;
use crate::graph::{ModuleGraph, ModuleNode, NodeKind};
use crate::interpreter::Interpreter;

pub use generic::{DunderFile, Dylibs};
pub use packages::{Lxml, Matplotlib, Opencv, Pil, Platformdirs, Pygments, Pyzmq, Sphinx};
pub use stdlib::{Ctypes, Multiprocessing, Stdlib, Tkinter};

/// Rounds after which the engine gives up on reaching a fixed point.
const MAX_ROUNDS: usize = 32;

/// What a recipe sees.
#[derive(Debug, Clone, Copy)]
pub struct RecipeContext<'a> {
    pub graph: &'a ModuleGraph,
    pub interpreter: &'a Interpreter,
    pub mode: BuildMode,
}

impl<'a> RecipeContext<'a> {
    /// The node for `name` if it was found on disk.
    pub fn found(&self, name: &str) -> Option<&'a ModuleNode> {
        self.graph
            .get(name)
            .filter(|n| n.kind.has_file() || n.kind == NodeKind::NamespacePackage)
    }

    /// First directory of a package found on disk.
    pub fn package_dir(&self, name: &str) -> Option<&'a Path> {
        self.found(name)?.package_path.first().map(PathBuf::as_path)
    }

    /// Whether `node` lives outside the standard library.
    pub fn is_third_party(&self, node: &ModuleNode) -> bool {
        node.filename
            .as_deref()
            .or_else(|| node.package_path.first().map(PathBuf::as_path))
            .is_some_and(|p| !self.interpreter.is_stdlib_path(p))
    }
}

pub trait Recipe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect the graph; `None` means the recipe does not apply.
    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict>;
}

/// The aggregated outcome of one or more recipes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub packages: BTreeSet<String>,
    pub includes: BTreeSet<String>,
    /// Bootstrap fragments by name; emitted in name order.
    pub prescripts: BTreeMap<String, String>,
    pub expected_missing: BTreeSet<String>,
    /// Extra binaries for `Contents/Frameworks/`, keyed by file name.
    pub frameworks: BTreeMap<String, PathBuf>,
    /// Destination below `Contents/Resources/` to source path.
    pub resources: BTreeMap<PathBuf, PathBuf>,
}

impl Verdict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, name: impl Into<String>) -> Self {
        self.includes.insert(name.into());
        self
    }

    pub fn package(mut self, name: impl Into<String>) -> Self {
        self.packages.insert(name.into());
        self
    }

    pub fn prescript(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.prescripts.insert(name.into(), source.into());
        self
    }

    pub fn expect_missing(mut self, name: impl Into<String>) -> Self {
        self.expected_missing.insert(name.into());
        self
    }

    pub fn framework(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let key = path
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().into_owned());
        self.frameworks.insert(key, path);
        self
    }

    pub fn resource(mut self, destination: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        self.resources.insert(destination.into(), source.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Union `other` into `self`, rejecting contradictions.
    pub fn merge(&mut self, other: Verdict, origin: &str) -> Result<()> {
        for (name, source) in other.prescripts {
            match self.prescripts.get(&name) {
                Some(existing) if *existing != source => {
                    return Err(BuildError::RecipeConflict(format!(
                        "prescript '{name}' declared twice with different source ({origin})"
                    )));
                }
                Some(_) => {}
                None => {
                    self.prescripts.insert(name, source);
                }
            }
        }
        for (basename, path) in other.frameworks {
            match self.frameworks.get(&basename) {
                Some(existing) if *existing != path => {
                    return Err(BuildError::RecipeConflict(format!(
                        "framework '{basename}' requested from {} and {} ({origin})",
                        existing.display(),
                        path.display()
                    )));
                }
                Some(_) => {}
                None => {
                    self.frameworks.insert(basename, path);
                }
            }
        }
        for (dest, source) in other.resources {
            match self.resources.get(&dest) {
                Some(existing) if *existing != source => {
                    return Err(BuildError::RecipeConflict(format!(
                        "resource destination {} has two sources: {} and {} ({origin})",
                        dest.display(),
                        existing.display(),
                        source.display()
                    )));
                }
                Some(_) => {}
                None => {
                    self.resources.insert(dest, source);
                }
            }
        }
        self.packages.extend(other.packages);
        self.includes.extend(other.includes);
        self.expected_missing.extend(other.expected_missing);

        if let Some(name) = self
            .includes
            .iter()
            .chain(&self.packages)
            .find(|n| self.expected_missing.contains(*n))
        {
            return Err(BuildError::RecipeConflict(format!(
                "'{name}' is both required and expected to be missing ({origin})"
            )));
        }
        Ok(())
    }
}

/// Runs a fixed set of recipes to a fixed point.
pub struct RecipeEngine {
    recipes: Vec<Box<dyn Recipe>>,
}

impl std::fmt::Debug for RecipeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.recipes.iter().map(|r| r.name()))
            .finish()
    }
}

impl RecipeEngine {
    pub fn new(recipes: Vec<Box<dyn Recipe>>) -> Self {
        Self { recipes }
    }

    /// Every built-in recipe.
    pub fn builtin() -> Self {
        Self::new(vec![
            Box::new(Stdlib),
            Box::new(Ctypes),
            Box::new(Multiprocessing),
            Box::new(Tkinter),
            Box::new(DunderFile),
            Box::new(Dylibs),
            Box::new(Pyzmq),
            Box::new(Matplotlib),
            Box::new(Pygments),
            Box::new(Platformdirs),
            Box::new(Opencv),
            Box::new(Lxml),
            Box::new(Sphinx),
            Box::new(Pil),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.recipes.iter().map(|r| r.name()).collect()
    }

    /// Evaluate every recipe against the same snapshot, apply the additions
    /// through the finder and repeat until the graph stops growing.
    pub fn run(&self, finder: &mut ModuleFinder<'_>, mode: BuildMode) -> Result<Verdict> {
        let mut total = Verdict::new();

        for round in 1..=MAX_ROUNDS {
            let before = (finder.graph().len(), finder.graph().whole_package_count());

            let mut verdict = Verdict::new();
            {
                let ctx = RecipeContext {
                    graph: finder.graph(),
                    interpreter: finder.interpreter(),
                    mode,
                };
                for recipe in &self.recipes {
                    if let Some(v) = recipe.check(&ctx) {
                        debug!("Recipe {} applies (round {round})", recipe.name());
                        verdict.merge(v, recipe.name())?;
                    }
                }
            }

            for name in &verdict.includes {
                finder.include(name);
            }
            for name in &verdict.packages {
                finder.include_package(name);
            }
            finder.run()?;
            total.merge(verdict, "recipes")?;

            let after = (finder.graph().len(), finder.graph().whole_package_count());
            if after == before {
                debug!("Recipes settled after {round} round(s)");
                return Ok(total);
            }
        }
        Err(BuildError::RecipeConflict(format!(
            "recipes did not settle after {MAX_ROUNDS} rounds"
        )))
    }
}
