//! Mach-O header edits using install_name_tool
//!
//! Every edit the relocator plans for one file is applied in a single
//! `install_name_tool` invocation, after which the file is re-signed ad hoc
//! because any header change invalidates the existing signature. Stripping
//! (`strip -x -S`) happens before the edits.

use serde::Serialize;
use std::path::Path;
use std::process::Command;
use tracing::debug;

use crate::error::{BuildError, Result};

const XCODE_HINT: &str = "Install the Xcode command line tools: xcode-select --install";

/// One change to a Mach-O header.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Edit {
    /// `-id`: the library's own install name.
    SetId(String),
    /// `-change`: rewrite one dependency reference.
    Change { old: String, new: String },
    /// `-add_rpath`
    AddRpath(String),
    /// `-delete_rpath`
    DeleteRpath(String),
}

impl Edit {
    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Self::SetId(id) => args.extend(["-id".to_string(), id.clone()]),
            Self::Change { old, new } => {
                args.extend(["-change".to_string(), old.clone(), new.clone()]);
            }
            Self::AddRpath(p) => args.extend(["-add_rpath".to_string(), p.clone()]),
            Self::DeleteRpath(p) => args.extend(["-delete_rpath".to_string(), p.clone()]),
        }
    }
}

/// Applies header edits to files on disk.
pub trait MachoEditor: Send + Sync {
    /// Apply `edits` to `path` in one go.
    fn apply(&self, path: &Path, edits: &[Edit]) -> Result<()>;

    /// Remove debug and local symbols.
    fn strip(&self, path: &Path) -> Result<()>;

    /// Replace the code signature after edits.
    fn resign(&self, path: &Path) -> Result<()>;
}

/// The Xcode command line tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallNameTool;

impl InstallNameTool {
    fn run(tool: &'static str, args: &[String], path: &Path) -> Result<()> {
        debug!("{tool} {} {}", args.join(" "), path.display());
        let output = match Command::new(tool).args(args).arg(path).output() {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BuildError::ToolNotFound {
                    tool: tool.to_string(),
                    hint: XCODE_HINT,
                });
            }
            Err(e) => return Err(BuildError::fs("Failed to spawn", Path::new(tool), e)),
        };

        if !output.status.success() {
            return Err(BuildError::ExternalTool {
                tool: format!("{tool} ({})", path.display()),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl MachoEditor for InstallNameTool {
    fn apply(&self, path: &Path, edits: &[Edit]) -> Result<()> {
        if edits.is_empty() {
            return Ok(());
        }
        let mut args = Vec::new();
        for edit in edits {
            edit.push_args(&mut args);
        }
        Self::run("install_name_tool", &args, path)
    }

    fn strip(&self, path: &Path) -> Result<()> {
        Self::run("strip", &["-x".to_string(), "-S".to_string()], path)
    }

    /// Uses `codesign -s - --force` to apply an ad-hoc signature while
    /// preserving existing entitlements, requirements, flags, and runtime
    /// metadata.
    fn resign(&self, path: &Path) -> Result<()> {
        let args = [
            "-s",
            "-",
            "--force",
            "--preserve-metadata=entitlements,requirements,flags,runtime",
        ]
        .map(String::from);
        Self::run("codesign", &args, path)
    }
}

/// Records edits instead of applying them.
#[derive(Debug, Default)]
pub struct RecordingEditor {
    log: std::sync::Mutex<Vec<(std::path::PathBuf, Vec<Edit>)>>,
    stripped: std::sync::Mutex<Vec<std::path::PathBuf>>,
}

impl RecordingEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything applied so far, in order.
    pub fn applied(&self) -> Vec<(std::path::PathBuf, Vec<Edit>)> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Files passed to [`MachoEditor::strip`], in order.
    pub fn stripped(&self) -> Vec<std::path::PathBuf> {
        self.stripped.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl MachoEditor for RecordingEditor {
    fn apply(&self, path: &Path, edits: &[Edit]) -> Result<()> {
        if let Ok(mut log) = self.log.lock() {
            log.push((path.to_path_buf(), edits.to_vec()));
        }
        Ok(())
    }

    fn strip(&self, path: &Path) -> Result<()> {
        if let Ok(mut stripped) = self.stripped.lock() {
            stripped.push(path.to_path_buf());
        }
        Ok(())
    }

    fn resign(&self, _: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edits_flatten_to_arguments() {
        let mut args = Vec::new();
        for edit in [
            Edit::SetId("@rpath/libfoo.dylib".into()),
            Edit::Change {
                old: "/opt/lib/libbar.dylib".into(),
                new: "@rpath/libbar.dylib".into(),
            },
            Edit::AddRpath("@loader_path/../Frameworks".into()),
            Edit::DeleteRpath("/opt/lib".into()),
        ] {
            edit.push_args(&mut args);
        }
        assert_eq!(
            args,
            [
                "-id",
                "@rpath/libfoo.dylib",
                "-change",
                "/opt/lib/libbar.dylib",
                "@rpath/libbar.dylib",
                "-add_rpath",
                "@loader_path/../Frameworks",
                "-delete_rpath",
                "/opt/lib",
            ]
        );
    }

    #[test]
    fn test_recording_editor() {
        let editor = RecordingEditor::new();
        editor
            .apply(Path::new("/b/lib.so"), &[Edit::AddRpath("@loader_path".into())])
            .unwrap();
        editor.strip(Path::new("/b/lib.so")).unwrap();
        assert_eq!(editor.applied().len(), 1);
        assert_eq!(editor.stripped(), [std::path::PathBuf::from("/b/lib.so")]);
    }
}
