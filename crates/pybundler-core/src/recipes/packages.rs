//! Recipes for specific third-party packages.

use std::fmt::Write as _;

use super::{Recipe, RecipeContext, Verdict};

/// `pyzmq` loads its bundled libzmq relative to the package directory.
#[derive(Debug)]
pub struct Pyzmq;

impl Recipe for Pyzmq {
    fn name(&self) -> &'static str {
        "pyzmq"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        ctx.found("zmq")?;
        Some(Verdict::new().package("zmq"))
    }
}

/// `matplotlib` locates `mpl-data` and its backends through the filesystem.
#[derive(Debug)]
pub struct Matplotlib;

impl Recipe for Matplotlib {
    fn name(&self) -> &'static str {
        "matplotlib"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        let dir = ctx.package_dir("matplotlib")?;
        let mut verdict = Verdict::new().package("matplotlib");
        let data = dir.join("mpl-data");
        if data.is_dir() {
            verdict = verdict.resource("mpl-data", data);
        }
        Some(verdict)
    }
}

/// Lexers, formatters and styles are looked up by name at runtime.
#[derive(Debug)]
pub struct Pygments;

impl Recipe for Pygments {
    fn name(&self) -> &'static str {
        "pygments"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        let dir = ctx.package_dir("pygments")?;
        let mut verdict = Verdict::new();
        let walker = walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != "__pycache__");
        for entry in walker.filter_map(std::result::Result::ok) {
            let Ok(rel) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let Some(stem) = rel.to_str().and_then(|s| s.strip_suffix(".py")) else {
                continue;
            };
            let dotted = stem.replace('/', ".");
            let name = match dotted.strip_suffix("__init__") {
                Some("") => continue,
                Some(pkg) => format!("pygments.{}", pkg.trim_end_matches('.')),
                None => format!("pygments.{dotted}"),
            };
            verdict = verdict.include(name);
        }
        (!verdict.is_empty()).then_some(verdict)
    }
}

/// The platform module is chosen dynamically; only the macOS one matters.
#[derive(Debug)]
pub struct Platformdirs;

impl Recipe for Platformdirs {
    fn name(&self) -> &'static str {
        "platformdirs"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        ctx.found("platformdirs")?;
        Some(Verdict::new().include("platformdirs.macos"))
    }
}

/// The `cv2` extension imports `numpy` from native code.
#[derive(Debug)]
pub struct Opencv;

impl Recipe for Opencv {
    fn name(&self) -> &'static str {
        "opencv"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        ctx.found("cv2")?;
        Some(Verdict::new().include("numpy"))
    }
}

const LXML_IMPORTS: &[(&str, &[&str])] = &[
    ("lxml.etree", &["lxml._elementpath", "re", "gzip", "io"]),
    ("lxml.objectify", &["copyreg"]),
];

/// `lxml`'s extension modules import these from native code.
#[derive(Debug)]
pub struct Lxml;

impl Recipe for Lxml {
    fn name(&self) -> &'static str {
        "lxml"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        let mut verdict = Verdict::new();
        for (module, imports) in LXML_IMPORTS {
            if ctx.found(module).is_some() {
                for name in *imports {
                    verdict = verdict.include(*name);
                }
            }
        }
        (!verdict.is_empty()).then_some(verdict)
    }
}

const SPHINX_EXTENSIONS: &[&str] = &[
    "applehelp",
    "devhelp",
    "htmlhelp",
    "jsmath",
    "qthelp",
    "serializinghtml",
];

/// Sphinx loads its builtin `sphinxcontrib` extensions by name.
#[derive(Debug)]
pub struct Sphinx;

impl Recipe for Sphinx {
    fn name(&self) -> &'static str {
        "sphinx"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        ctx.found("sphinx")?;
        let mut verdict = Verdict::new();
        for ext in SPHINX_EXTENSIONS {
            let installed = ctx.interpreter.site_dirs().iter().any(|site| {
                let base = site.join("sphinxcontrib");
                base.join(ext).is_dir() || base.join(format!("{ext}.py")).is_file()
            });
            if installed {
                verdict = verdict.include(format!("sphinxcontrib.{ext}"));
            }
        }
        (!verdict.is_empty()).then_some(verdict)
    }
}

/// Pillow registers its image plugins by importing them dynamically from
/// `Image.init()`; the prescript replaces that with a fixed list.
#[derive(Debug)]
pub struct Pil;

impl Pil {
    fn prescript(plugins: &[String]) -> String {
        let mut list = String::new();
        for plugin in plugins {
            let _ = write!(list, "{plugin:?}, ");
        }
        format!(
            r#"def _boot_pil(plugins):
    import sys
    from PIL import Image

    def init():
        if Image._initialized >= 2:
            return
        for plugin in plugins:
            try:
                __import__("PIL." + plugin, globals(), locals(), [])
            except ImportError:
                sys.stderr.write("Image: failed to import " + plugin + "\n")
        if Image.OPEN or Image.SAVE:
            Image._initialized = 2

    Image.init = init


_boot_pil([{list}])
"#,
            list = list.trim_end_matches(", ")
        )
    }
}

impl Recipe for Pil {
    fn name(&self) -> &'static str {
        "pil"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        let dir = ctx.package_dir("PIL")?;
        let mut plugins: Vec<String> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(std::result::Result::ok)
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix("ImagePlugin.py")
                    .map(|stem| format!("{stem}ImagePlugin"))
            })
            .collect();
        plugins.sort();

        let mut verdict = Verdict::new().prescript("pil", Self::prescript(&plugins));
        for plugin in &plugins {
            verdict = verdict.include(format!("PIL.{plugin}"));
        }
        Some(verdict)
    }
}
