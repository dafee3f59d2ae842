//! Host interpreter introspection.
//!
//! Everything the finder and emitter need to know about the Python that the
//! bundle is built from is gathered by running it once with a probe script
//! that prints JSON. Tests build an [`Interpreter`] directly instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{BuildError, Result};

const PROBE_SCRIPT: &str = r#"
import json, os, sys, sysconfig
from importlib.machinery import EXTENSION_SUFFIXES
try:
    import _imp
    frozen = sorted(_imp._frozen_module_names())
except (ImportError, AttributeError):
    frozen = []
paths = sysconfig.get_paths()
cfg = sysconfig.get_config_var
runtime = None
if cfg("PYTHONFRAMEWORK"):
    runtime = os.path.join(cfg("PYTHONFRAMEWORKPREFIX"), cfg("LDLIBRARY"))
elif cfg("Py_ENABLE_SHARED"):
    runtime = os.path.join(cfg("LIBDIR"), cfg("LDLIBRARY"))
print(json.dumps({
    "executable": sys.executable,
    "version": list(sys.version_info[:2]),
    "prefix": sys.prefix,
    "stdlib": paths["stdlib"],
    "platstdlib": paths["platstdlib"],
    "purelib": paths["purelib"],
    "platlib": paths["platlib"],
    "lib_dynload": os.path.join(paths["platstdlib"], "lib-dynload"),
    "builtin_modules": sorted(sys.builtin_module_names),
    "frozen_modules": frozen,
    "extension_suffixes": EXTENSION_SUFFIXES,
    "sys_path": [p for p in sys.path[1:] if p],
    "runtime_library": runtime,
    "deployment_target": cfg("MACOSX_DEPLOYMENT_TARGET") or None,
}))
"#;

/// A description of the host Python installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interpreter {
    pub executable: PathBuf,
    pub version: (u32, u32),
    pub prefix: PathBuf,
    pub stdlib: PathBuf,
    pub platstdlib: PathBuf,
    pub purelib: PathBuf,
    pub platlib: PathBuf,
    pub lib_dynload: PathBuf,
    pub builtin_modules: BTreeSet<String>,
    pub frozen_modules: BTreeSet<String>,
    pub extension_suffixes: Vec<String>,
    /// `sys.path` without the script directory.
    pub sys_path: Vec<PathBuf>,
    /// The shared runtime (`Python.framework/Versions/X.Y/Python` or `libpythonX.Y.dylib`).
    pub runtime_library: Option<PathBuf>,
    pub deployment_target: Option<String>,
}

impl Interpreter {
    /// Run `executable` with the probe script and parse its report.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ToolNotFound`] when the interpreter cannot be
    /// spawned, [`BuildError::ExternalTool`] when it exits non-zero and
    /// [`BuildError::Context`] when its output is not the expected JSON.
    pub fn probe(executable: &Path) -> Result<Self> {
        debug!("Probing interpreter {}", executable.display());
        let output = match Command::new(executable).args(["-c", PROBE_SCRIPT]).output() {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BuildError::ToolNotFound {
                    tool: executable.display().to_string(),
                    hint: "Set `interpreter` in the configuration or PYBUNDLER_INTERPRETER.",
                });
            }
            Err(e) => return Err(BuildError::fs("Failed to spawn", executable, e)),
        };

        if !output.status.success() {
            return Err(BuildError::ExternalTool {
                tool: executable.display().to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| BuildError::context("Unexpected interpreter probe output", e))
    }

    /// Locate `python3` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ToolNotFound`] if no interpreter is on `PATH`.
    pub fn find_default() -> Result<PathBuf> {
        which::which("python3").map_err(|_| BuildError::ToolNotFound {
            tool: "python3".to_string(),
            hint: "Install Python 3 or set `interpreter` in the configuration.",
        })
    }

    /// A minimal interpreter description rooted at a fake installation,
    /// with the standard library in `stdlib` and third-party code in `site`.
    pub fn from_layout(version: (u32, u32), stdlib: &Path, site: &Path) -> Self {
        Self {
            executable: PathBuf::from("/usr/bin/false"),
            version,
            prefix: stdlib.parent().unwrap_or(stdlib).to_path_buf(),
            stdlib: stdlib.to_path_buf(),
            platstdlib: stdlib.to_path_buf(),
            purelib: site.to_path_buf(),
            platlib: site.to_path_buf(),
            lib_dynload: stdlib.join("lib-dynload"),
            builtin_modules: ["sys", "builtins", "_imp", "marshal", "posix", "_thread", "_io"]
                .into_iter()
                .map(String::from)
                .collect(),
            frozen_modules: BTreeSet::new(),
            extension_suffixes: vec![
                format!(".cpython-{}{}-darwin.so", version.0, version.1),
                ".abi3.so".to_string(),
                ".so".to_string(),
            ],
            sys_path: vec![stdlib.to_path_buf(), stdlib.join("lib-dynload"), site.to_path_buf()],
            runtime_library: None,
            deployment_target: None,
        }
    }

    /// `pythonM.N`
    pub fn version_dir(&self) -> String {
        format!("python{}.{}", self.version.0, self.version.1)
    }

    /// Module search path: script directories first, then the standard
    /// library, then the remaining `sys.path` entries (site directories).
    pub fn search_path(&self, script_dirs: &[PathBuf]) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        let mut push = |p: &Path| {
            if !out.iter().any(|q| q == p) {
                out.push(p.to_path_buf());
            }
        };
        for dir in script_dirs {
            push(dir);
        }
        push(&self.stdlib);
        push(&self.platstdlib);
        push(&self.lib_dynload);
        for p in &self.sys_path {
            push(p);
        }
        out
    }

    /// Site directories, where third-party packages live.
    pub fn site_dirs(&self) -> Vec<&Path> {
        let mut dirs = vec![self.purelib.as_path()];
        if self.platlib != self.purelib {
            dirs.push(self.platlib.as_path());
        }
        dirs
    }

    /// Whether `path` belongs to the standard library rather than a site directory.
    pub fn is_stdlib_path(&self, path: &Path) -> bool {
        if self.site_dirs().iter().any(|site| path.starts_with(site)) {
            return false;
        }
        path.starts_with(&self.stdlib)
            || path.starts_with(&self.platstdlib)
            || path.starts_with(&self.lib_dynload)
    }
}
