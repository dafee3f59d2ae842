#![allow(dead_code)]

use pybundler_core::Interpreter;
use pybundler_core::error::Result;
use pybundler_core::macho::MachoFile;
use pybundler_core::relinker::{Edit, MachoEditor};
use pybundler_schema::BuildConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const ARM64: u32 = 0x0100_000c;
pub const X86_64: u32 = 0x0100_0007;

const LC_ID_DYLIB: u32 = 0xd;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_RPATH: u32 = 0x8000_001c;
const LC_BUILD_VERSION: u32 = 0x32;

fn push_str_cmd(out: &mut Vec<u8>, cmd: u32, fixed: &[u32], s: &str) {
    let header = 8 + fixed.len() * 4;
    let size = (header + s.len() + 1).div_ceil(8) * 8;
    out.extend_from_slice(&cmd.to_le_bytes());
    out.extend_from_slice(&(size as u32).to_le_bytes());
    for v in fixed {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(s.as_bytes());
    out.resize(out.len() + size - header - s.len(), 0);
}

/// A minimal thin 64-bit dylib with the given load commands.
pub fn dylib(cputype: u32, id: Option<&str>, deps: &[&str], rpaths: &[&str]) -> Vec<u8> {
    let mut cmds = Vec::new();
    let mut ncmds = 0u32;
    if let Some(id) = id {
        push_str_cmd(&mut cmds, LC_ID_DYLIB, &[24, 2, 0x0001_0000, 0x0001_0000], id);
        ncmds += 1;
    }
    for dep in deps {
        push_str_cmd(&mut cmds, LC_LOAD_DYLIB, &[24, 2, 0x0001_0000, 0x0001_0000], dep);
        ncmds += 1;
    }
    for rpath in rpaths {
        push_str_cmd(&mut cmds, LC_RPATH, &[12], rpath);
        ncmds += 1;
    }
    cmds.extend_from_slice(&LC_BUILD_VERSION.to_le_bytes());
    cmds.extend_from_slice(&24u32.to_le_bytes());
    for v in [1u32, 0x000b_0000, 0x000e_0000, 0] {
        cmds.extend_from_slice(&v.to_le_bytes());
    }
    ncmds += 1;

    let mut out = Vec::new();
    for v in [0xfeed_facf, cputype, 0, 6, ncmds, cmds.len() as u32, 0, 0] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&cmds);
    out
}

/// Applies edits by regenerating the (thin, synthetic) file. Strips are
/// only recorded, in a log shared between clones.
#[derive(Debug, Default, Clone)]
pub struct RewritingEditor {
    pub stripped: Arc<Mutex<Vec<PathBuf>>>,
}

impl MachoEditor for RewritingEditor {
    fn apply(&self, path: &Path, edits: &[Edit]) -> Result<()> {
        let file = MachoFile::open(path)?.expect("not a Mach-O file");
        let cputype = if file.archs().contains("x86_64") { X86_64 } else { ARM64 };
        let mut id = file.install_name().map(String::from);
        let mut deps: Vec<String> = file.dependencies().iter().map(|d| d.name.clone()).collect();
        let mut rpaths: Vec<String> = file.rpaths().iter().map(|r| (*r).to_string()).collect();
        for edit in edits {
            match edit {
                Edit::SetId(new) => id = Some(new.clone()),
                Edit::Change { old, new } => {
                    for dep in deps.iter_mut().filter(|d| *d == old) {
                        dep.clone_from(new);
                    }
                }
                Edit::AddRpath(p) => rpaths.push(p.clone()),
                Edit::DeleteRpath(p) => rpaths.retain(|r| r != p),
            }
        }
        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
        let rpaths: Vec<&str> = rpaths.iter().map(String::as_str).collect();
        fs::write(path, dylib(cputype, id.as_deref(), &deps, &rpaths))?;
        Ok(())
    }

    fn strip(&self, path: &Path) -> Result<()> {
        self.stripped.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn resign(&self, _: &Path) -> Result<()> {
        Ok(())
    }
}

/// A project directory next to a fake Python installation.
pub struct Project {
    pub dir: TempDir,
    pub interp: Interpreter,
}

impl Project {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let stdlib = dir.path().join("python/lib/python3.12");
        let site = stdlib.join("site-packages");
        fs::create_dir_all(&site).unwrap();
        let mut interp = Interpreter::from_layout((3, 12), &stdlib, &site);
        interp.prefix = dir.path().join("python");
        let project = Self { dir, interp };
        project.write("launcher", "#!/bin/sh\nexec python3 \"$RESOURCEPATH/__boot__.py\"\n");
        project
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        self.write_bytes(rel, content.as_bytes())
    }

    pub fn write_bytes(&self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// A file in the fake installation's `site-packages`.
    pub fn site_file(&self, rel: &str, content: &[u8]) -> PathBuf {
        self.write_bytes(&format!("python/lib/python3.12/site-packages/{rel}"), content)
    }

    /// A file in the fake standard library.
    pub fn stdlib_file(&self, rel: &str, content: &str) -> PathBuf {
        self.write(&format!("python/lib/python3.12/{rel}"), content)
    }

    /// Write `pybundler.toml` (with the launcher preset) and load it.
    pub fn config(&self, body: &str) -> BuildConfig {
        let path = self.write("pybundler.toml", &format!("launcher = \"launcher\"\n{body}"));
        BuildConfig::load(&path).unwrap()
    }

    pub fn zip_members(&self, zip: &Path) -> Vec<String> {
        let file = fs::File::open(zip).unwrap();
        let archive = zip::ZipArchive::new(file).unwrap();
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort();
        names
    }
}
