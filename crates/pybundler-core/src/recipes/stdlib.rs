//! Recipes for the standard library itself.

use pybundler_schema::BuildMode;
use std::path::PathBuf;

use super::{Recipe, RecipeContext, Verdict};

/// Platform modules the standard library imports behind platform checks,
/// keyed by the module that imports them.
const WINDOWS_ONLY: &[(&str, &[&str])] = &[
    ("importlib", &["_frozen_importlib_external"]),
    ("mimetypes", &["winreg"]),
    ("os", &["nt"]),
    ("subprocess", &["_winapi"]),
    ("uuid", &["netbios", "win32wnet"]),
    ("asyncio", &["_overlapped", "_winapi"]),
    ("shutil", &["nt"]),
];

const SETUP_CTYPES: &str = include_str!("../bootstrap/setup_ctypes.py");

/// Ships `encodings` whole (the interpreter imports it before any path hook
/// exists) and silences Windows-only imports.
#[derive(Debug)]
pub struct Stdlib;

impl Recipe for Stdlib {
    fn name(&self) -> &'static str {
        "stdlib"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        let mut verdict = Verdict::new();
        for (module, missing) in WINDOWS_ONLY {
            if ctx.found(module).is_some() {
                for name in *missing {
                    verdict = verdict.expect_missing(*name);
                }
            }
        }
        let has_encodings = ctx
            .interpreter
            .stdlib
            .join("encodings")
            .join("__init__.py")
            .is_file();
        if ctx.mode == BuildMode::Standalone && has_encodings {
            verdict = verdict.package("encodings");
        }
        (!verdict.is_empty()).then_some(verdict)
    }
}

/// Lets `ctypes.util.find_library` see `Contents/Frameworks/`.
#[derive(Debug)]
pub struct Ctypes;

impl Recipe for Ctypes {
    fn name(&self) -> &'static str {
        "ctypes"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        ctx.found("ctypes")?;
        let mut verdict = Verdict::new().prescript("ctypes", SETUP_CTYPES);
        if ctx.interpreter.version >= (3, 13) {
            verdict = verdict.package("ctypes");
        }
        Some(verdict)
    }
}

/// `multiprocessing` builds a special command line when `sys.frozen` is set;
/// the bundle launcher does not need it.
#[derive(Debug)]
pub struct Multiprocessing;

const MULTIPROCESSING_PRESCRIPT: &str = r#"def _boot_multiprocessing():
    import sys
    import multiprocessing.spawn

    original = multiprocessing.spawn.get_command_line

    def get_command_line(**kwargs):
        frozen = sys.frozen
        del sys.frozen
        try:
            return original(**kwargs)
        finally:
            sys.frozen = frozen

    multiprocessing.spawn.get_command_line = get_command_line


_boot_multiprocessing()
"#;

impl Recipe for Multiprocessing {
    fn name(&self) -> &'static str {
        "multiprocessing"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        ctx.found("multiprocessing")?;
        Some(
            Verdict::new()
                .include("multiprocessing.spawn")
                .prescript("multiprocessing", MULTIPROCESSING_PRESCRIPT),
        )
    }
}

/// Copies the Tcl/Tk script libraries of a non-framework interpreter and
/// points `TCL_LIBRARY`/`TK_LIBRARY` at them.
#[derive(Debug)]
pub struct Tkinter;

impl Tkinter {
    fn script_libraries(ctx: &RecipeContext<'_>) -> Option<(PathBuf, PathBuf)> {
        let lib = ctx.interpreter.prefix.join("lib");
        let mut tcl = None;
        let mut tk = None;
        let mut entries: Vec<_> = std::fs::read_dir(&lib)
            .ok()?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        entries.sort();
        for path in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with("tcl") && name[3..].starts_with(|c: char| c.is_ascii_digit()) {
                tcl = Some(path.clone());
            } else if name.starts_with("tk") && name[2..].starts_with(|c: char| c.is_ascii_digit()) {
                tk = Some(path.clone());
            }
        }
        Some((tcl?, tk?))
    }
}

impl Recipe for Tkinter {
    fn name(&self) -> &'static str {
        "tkinter"
    }

    fn check(&self, ctx: &RecipeContext<'_>) -> Option<Verdict> {
        ctx.found("_tkinter")?;
        if ctx.mode != BuildMode::Standalone {
            return None;
        }
        let (tcl, tk) = Self::script_libraries(ctx)?;
        let tcl_name = tcl.file_name()?.to_string_lossy().into_owned();
        let tk_name = tk.file_name()?.to_string_lossy().into_owned();

        let prescript = format!(
            r#"def _boot_tkinter():
    import os

    resources = os.environ["RESOURCEPATH"]
    os.environ["TCL_LIBRARY"] = os.path.join(resources, "lib", "{tcl_name}")
    os.environ["TK_LIBRARY"] = os.path.join(resources, "lib", "{tk_name}")


_boot_tkinter()
"#
        );
        Some(
            Verdict::new()
                .resource(PathBuf::from("lib").join(&tcl_name), tcl)
                .resource(PathBuf::from("lib").join(&tk_name), tk)
                .prescript("tkinter", prescript),
        )
    }
}
