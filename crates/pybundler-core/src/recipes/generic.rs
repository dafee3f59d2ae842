//! Recipes driven by what the code does rather than by package name.

use super::{Recipe, RecipeContext, Verdict};
use crate::graph::NodeKind;

/// Third-party code that reads `__file__` usually expects its data files next
/// to it on disk, which a zip archive cannot provide. The whole top-level
/// package is shipped as a directory instead.
#[derive(Debug)]
pub struct DunderFile;

impl Recipe for DunderFile {
    fn name(&self) -> &'static str {
        "dunder_file"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        let mut verdict = Verdict::new();
        for node in ctx.graph.nodes() {
            if !node.uses_dunder_file || node.script || node.whole_package {
                continue;
            }
            if !ctx.is_third_party(node) {
                continue;
            }
            let top = match node.name.split_once('.') {
                Some((top, _)) => top,
                None if node.kind.is_package() => node.name.as_str(),
                None => continue,
            };
            if ctx.found(top).is_some_and(|n| n.kind.is_package()) {
                verdict = verdict.package(top);
            }
        }
        (!verdict.is_empty()).then_some(verdict)
    }
}

/// Wheels repaired by `delocate` keep their shared libraries in a `.dylibs`
/// directory inside the package; those become bundle frameworks.
#[derive(Debug)]
pub struct Dylibs;

impl Recipe for Dylibs {
    fn name(&self) -> &'static str {
        "dylibs"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        let mut verdict = Verdict::new();
        let packages = ctx
            .graph
            .nodes()
            .filter(|n| !n.name.contains('.') && n.kind == NodeKind::SourcePackage);
        for node in packages {
            for dir in &node.package_path {
                let Ok(entries) = std::fs::read_dir(dir.join(".dylibs")) else {
                    continue;
                };
                let mut libs: Vec<_> = entries
                    .filter_map(std::result::Result::ok)
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect();
                libs.sort();
                for lib in libs {
                    verdict = verdict.framework(lib);
                }
            }
        }
        (!verdict.is_empty()).then_some(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipes::tests::Site;
    use pybundler_schema::BuildMode;

    #[test]
    fn test_dunder_file_promotes_top_level_package() {
        let site = Site::new(&[
            ("src/main.py", "import thirdparty.data\nimport json\n"),
            ("lib/python3.12/site-packages/thirdparty/__init__.py", ""),
            (
                "lib/python3.12/site-packages/thirdparty/data.py",
                "import os\nHERE = os.path.dirname(__file__)\n",
            ),
            ("lib/python3.12/json/__init__.py", "X = __file__\n"),
            ("lib/python3.12/os.py", ""),
        ]);
        let finder = site.finder("src/main.py");
        let ctx = RecipeContext {
            graph: finder.graph(),
            interpreter: finder.interpreter(),
            mode: BuildMode::Standalone,
        };
        let verdict = DunderFile.check(&ctx).unwrap();
        assert_eq!(verdict.packages.iter().collect::<Vec<_>>(), vec!["thirdparty"]);
    }

    #[test]
    fn test_dylibs_become_frameworks() {
        let site = Site::new(&[
            ("src/main.py", "import fastlib\n"),
            ("lib/python3.12/site-packages/fastlib/__init__.py", ""),
            ("lib/python3.12/site-packages/fastlib/.dylibs/libfoo.1.dylib", "x"),
        ]);
        let finder = site.finder("src/main.py");
        let ctx = RecipeContext {
            graph: finder.graph(),
            interpreter: finder.interpreter(),
            mode: BuildMode::Standalone,
        };
        let verdict = Dylibs.check(&ctx).unwrap();
        assert_eq!(
            verdict.frameworks["libfoo.1.dylib"],
            site.path("lib/python3.12/site-packages/fastlib/.dylibs/libfoo.1.dylib")
        );
    }
}
