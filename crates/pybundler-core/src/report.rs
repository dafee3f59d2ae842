//! Missing-module report.
//!
//! Built from the final graph once recipes have run, so that names recipes
//! declare as expected-missing never show up. Only unconditional misses
//! outside a from-list are fatal; everything else is a warning.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::graph::{ModuleGraph, NodeKind};

/// Referer set reported for a root that could not be found.
const ROOT_REFERER: &str = "<include>";

#[derive(Debug, Clone, Default, Serialize)]
pub struct MissingReport {
    /// Plain `import x` outside any conditional block.
    pub unconditional: BTreeMap<String, BTreeSet<String>>,
    /// `from P import x` where `x` is neither a submodule nor a known global.
    pub fromlist: BTreeMap<String, BTreeSet<String>>,
    /// Imports guarded by `try`, a branch, a loop or a function body.
    pub conditional: BTreeMap<String, BTreeSet<String>>,
    /// Excluded modules that something still imports.
    pub excluded: BTreeMap<String, BTreeSet<String>>,
}

/// Which warning categories are reported at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    pub from_imports: bool,
    pub conditional: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            from_imports: false,
            conditional: true,
        }
    }
}

fn is_expected(name: &str, expected: &BTreeSet<String>) -> bool {
    expected.iter().any(|e| {
        name == e
            || name
                .strip_prefix(e.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

fn is_descendant(name: &str, of: &str) -> bool {
    name.strip_prefix(of).is_some_and(|rest| rest.starts_with('.'))
}

impl MissingReport {
    /// Classify every missing and excluded node in `graph`.
    pub fn build(graph: &ModuleGraph, expected_missing: &BTreeSet<String>) -> Self {
        let mut report = Self::default();

        for node in graph.nodes() {
            if is_expected(&node.name, expected_missing) {
                continue;
            }
            match node.kind {
                NodeKind::Missing => {}
                NodeKind::Excluded => {
                    // Submodules point at their parent; those edges are not imports.
                    let referers: BTreeSet<String> = node
                        .referers
                        .iter()
                        .filter(|r| !is_descendant(r, &node.name))
                        .filter(|r| graph.get(r).is_some_and(|n| n.kind != NodeKind::Excluded))
                        .cloned()
                        .collect();
                    if !referers.is_empty() {
                        report.excluded.insert(node.name.clone(), referers);
                    }
                    continue;
                }
                _ => continue,
            }

            let mut hard = BTreeSet::new();
            let mut fromlist = BTreeSet::new();
            let mut conditional = BTreeSet::new();
            if node.root {
                hard.insert(ROOT_REFERER.to_string());
            }
            for referer in &node.referers {
                if is_descendant(referer, &node.name) {
                    continue;
                }
                let Some(edge) = graph.reference(referer, &node.name) else {
                    continue;
                };
                if edge.is_conditional() {
                    conditional.insert(referer.clone());
                } else if edge.fromlist {
                    fromlist.insert(referer.clone());
                } else {
                    hard.insert(referer.clone());
                }
            }

            let name = node.name.clone();
            if !hard.is_empty() {
                report.unconditional.insert(name, hard);
            } else if !fromlist.is_empty() {
                report.fromlist.insert(name, fromlist);
            } else if !conditional.is_empty() {
                report.conditional.insert(name, conditional);
            }
        }
        report
    }

    /// Drop the warning categories `options` turns off. Fatal entries stay.
    #[must_use]
    pub fn restricted(mut self, options: ReportOptions) -> Self {
        if !options.from_imports {
            self.fromlist.clear();
        }
        if !options.conditional {
            self.conditional.clear();
        }
        self
    }

    /// Names that abort the build.
    pub fn fatal(&self) -> Vec<String> {
        self.unconditional.keys().cloned().collect()
    }

    pub fn warning_count(&self) -> usize {
        self.fromlist.len() + self.conditional.len() + self.excluded.len()
    }

    pub fn is_clean(&self) -> bool {
        self.unconditional.is_empty() && self.warning_count() == 0
    }

    /// Human-readable report, one section per category.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let sections = [
            ("Missing modules", &self.unconditional),
            ("Missing from-list names (possibly attributes)", &self.fromlist),
            ("Missing conditional imports", &self.conditional),
            ("Excluded but imported", &self.excluded),
        ];
        for (title, entries) in sections {
            if entries.is_empty() {
                continue;
            }
            let _ = writeln!(out, "{title}:");
            for (name, referers) in entries {
                let by: Vec<&str> = referers.iter().map(String::as_str).collect();
                let _ = writeln!(out, "  {name}  (imported by {})", by.join(", "));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ImportKind, ModuleNode, Reference};

    fn graph() -> ModuleGraph {
        let mut g = ModuleGraph::new();
        let mut main = ModuleNode::new("__main__:app", NodeKind::SourceModule);
        main.root = true;
        main.script = true;
        g.insert(main);
        g.insert(ModuleNode::new("pkg", NodeKind::SourcePackage));
        for name in ["hard", "maybe", "pkg.attr", "winreg", "gone", "gone.sub"] {
            g.insert(ModuleNode::new(name, NodeKind::Missing));
        }
        g.insert(ModuleNode::new("tkinter", NodeKind::Excluded));

        let m = "__main__:app";
        g.add_edge(m, "hard", Reference::new(ImportKind::Top));
        g.add_edge(m, "maybe", Reference::new(ImportKind::Conditional));
        g.add_edge(m, "pkg", Reference::new(ImportKind::From));
        g.add_edge(m, "pkg.attr", Reference::fromlist(ImportKind::From));
        g.add_edge("pkg.attr", "pkg", Reference::new(ImportKind::Top));
        g.add_edge(m, "winreg", Reference::new(ImportKind::Top));
        g.add_edge(m, "gone", Reference::new(ImportKind::Conditional));
        g.add_edge(m, "gone.sub", Reference::new(ImportKind::Conditional));
        g.add_edge("gone.sub", "gone", Reference::new(ImportKind::Top));
        g.add_edge(m, "tkinter", Reference::new(ImportKind::Top));
        g
    }

    #[test]
    fn test_classification() {
        let expected = BTreeSet::from(["winreg".to_string()]);
        let report = MissingReport::build(&graph(), &expected);

        assert_eq!(report.fatal(), vec!["hard".to_string()]);
        assert!(report.fromlist.contains_key("pkg.attr"));
        assert!(report.conditional.contains_key("maybe"));
        // The implicit child-to-parent edge does not make `gone` unconditional.
        assert!(report.conditional.contains_key("gone"));
        assert!(report.excluded.contains_key("tkinter"));
        assert_eq!(report.warning_count(), 5);
    }

    #[test]
    fn test_restricted_categories() {
        let report = MissingReport::build(&graph(), &BTreeSet::new());

        let quiet = report.clone().restricted(ReportOptions::default());
        assert!(quiet.fromlist.is_empty());
        assert!(quiet.conditional.contains_key("maybe"));
        assert_eq!(quiet.fatal(), ["hard".to_string(), "winreg".to_string()]);

        let hard_only = report.clone().restricted(ReportOptions {
            from_imports: false,
            conditional: false,
        });
        assert!(hard_only.conditional.is_empty());
        assert!(hard_only.excluded.contains_key("tkinter"));
        assert_eq!(hard_only.fatal(), report.fatal());

        let everything = report.restricted(ReportOptions {
            from_imports: true,
            conditional: true,
        });
        assert!(everything.fromlist.contains_key("pkg.attr"));
    }

    #[test]
    fn test_expected_missing_covers_descendants() {
        let expected = BTreeSet::from(["hard".to_string(), "gone".to_string()]);
        let report = MissingReport::build(&graph(), &expected);
        assert!(report.fatal().is_empty());
        assert!(!report.conditional.contains_key("gone.sub"));
        assert!(report.unconditional.contains_key("winreg"));
    }

    #[test]
    fn test_missing_root_is_fatal_and_rendered() {
        let mut g = ModuleGraph::new();
        let mut node = ModuleNode::new("nowhere", NodeKind::Missing);
        node.root = true;
        g.insert(node);
        let report = MissingReport::build(&g, &BTreeSet::new());
        assert_eq!(report.fatal(), vec!["nowhere".to_string()]);
        assert!(report.render().contains("nowhere  (imported by <include>)"));
    }
}
