//! Byte compilation of pure-Python modules.
//!
//! The host interpreter is the only thing that can produce `.pyc` files in
//! its own format, so [`HostCompiler`] hands it every module in one
//! subprocess. [`SourceCompiler`] ships sources unchanged.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{BuildError, IoContext, Result};

/// Unchecked-hash pycs do not embed the source mtime, so output is stable.
const COMPILE_SCRIPT: &str = r#"
import json, py_compile, sys
jobs = json.load(open(sys.argv[1], encoding="utf-8"))
optimize = int(sys.argv[2])
for job in jobs:
    py_compile.compile(
        job["source"],
        cfile=job["target"],
        dfile=job["display"],
        doraise=True,
        optimize=optimize,
        invalidation_mode=py_compile.PycInvalidationMode.UNCHECKED_HASH,
    )
"#;

/// A module to put into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub source: PathBuf,
    /// Archive path without extension, e.g. `json/__init__`.
    pub archive_stem: String,
}

/// One archive member produced by a compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    pub archive_path: String,
    pub data: Vec<u8>,
}

pub trait ByteCompiler: Send + Sync {
    fn compile(&self, jobs: &[CompileJob]) -> Result<Vec<CompiledModule>>;
}

/// Compiles with the host interpreter's `py_compile`.
#[derive(Debug, Clone)]
pub struct HostCompiler {
    pub interpreter: PathBuf,
    pub optimize: u8,
}

#[derive(Serialize)]
struct HostJob<'a> {
    source: &'a Path,
    target: PathBuf,
    display: &'a str,
}

impl ByteCompiler for HostCompiler {
    fn compile(&self, jobs: &[CompileJob]) -> Result<Vec<CompiledModule>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let scratch = tempfile::tempdir().map_err(|e| BuildError::context("Failed to create scratch directory", e))?;
        let plan: Vec<HostJob<'_>> = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| HostJob {
                source: &job.source,
                target: scratch.path().join(format!("{i}.pyc")),
                display: &job.archive_stem,
            })
            .collect();
        let list = scratch.path().join("jobs.json");
        let encoded = serde_json::to_vec(&plan).map_err(|e| BuildError::context("Failed to encode compile jobs", e))?;
        fs::write(&list, encoded).at("Failed to write", &list)?;

        debug!("Compiling {} modules with {}", jobs.len(), self.interpreter.display());
        let output = Command::new(&self.interpreter)
            .args(["-c", COMPILE_SCRIPT])
            .arg(&list)
            .arg(self.optimize.to_string())
            .env("SOURCE_DATE_EPOCH", "0")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .output()
            .at("Failed to spawn", &self.interpreter)?;
        if !output.status.success() {
            return Err(BuildError::ExternalTool {
                tool: format!("{} (py_compile)", self.interpreter.display()),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        jobs.iter()
            .zip(&plan)
            .map(|(job, host)| {
                Ok(CompiledModule {
                    archive_path: format!("{}.pyc", job.archive_stem),
                    data: fs::read(&host.target).at("Failed to read", &host.target)?,
                })
            })
            .collect()
    }
}

/// Stores `.py` sources as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceCompiler;

impl ByteCompiler for SourceCompiler {
    fn compile(&self, jobs: &[CompileJob]) -> Result<Vec<CompiledModule>> {
        jobs.iter()
            .map(|job| {
                Ok(CompiledModule {
                    archive_path: format!("{}.py", job.archive_stem),
                    data: fs::read(&job.source).at("Failed to read", &job.source)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_source_compiler_keeps_sources() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("mod.py");
        fs::write(&src, "X = 1\n").unwrap();
        let out = SourceCompiler
            .compile(&[CompileJob {
                source: src,
                archive_stem: "pkg/mod".into(),
            }])
            .unwrap();
        assert_eq!(out[0].archive_path, "pkg/mod.py");
        assert_eq!(out[0].data, b"X = 1\n");
    }

    #[test]
    fn test_host_compiler_failure_is_external_tool_error() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("mod.py");
        fs::write(&src, "X = 1\n").unwrap();
        let compiler = HostCompiler {
            interpreter: PathBuf::from("/usr/bin/false"),
            optimize: 0,
        };
        let err = compiler
            .compile(&[CompileJob {
                source: src,
                archive_stem: "mod".into(),
            }])
            .unwrap_err();
        assert!(matches!(err, BuildError::ExternalTool { code: 1, .. }));
        assert!(compiler.compile(&[]).unwrap().is_empty());
    }
}
