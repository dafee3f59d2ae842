//! Mach-O header reader.
//!
//! Only the load commands the relocator cares about are decoded: the
//! library's own install name, the libraries it links against, its rpaths
//! and its minimum OS version. Fat files yield one [`MachoSlice`] per
//! architecture. Files are memory-mapped and never modified here; edits go
//! through [`MachoEditor`](crate::relinker::MachoEditor).

use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, IoContext, Result};

const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_CIGAM_64: u32 = 0xcffa_edfe;
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;

/// Java class files share the fat magic; real fat files have few slices.
const MAX_FAT_ARCHS: u32 = 30;

const LC_REQ_DYLD: u32 = 0x8000_0000;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_ID_DYLIB: u32 = 0xd;
const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
const LC_VERSION_MIN_MACOSX: u32 = 0x24;
const LC_BUILD_VERSION: u32 = 0x32;

const CPU_ARCH_ABI64: u32 = 0x0100_0000;
const CPU_TYPE_X86: u32 = 7;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_POWERPC: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadKind {
    Normal,
    Weak,
    Reexport,
    Lazy,
    Upward,
}

/// One `LC_*_DYLIB` reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadDylib {
    pub name: String,
    pub kind: LoadKind,
    pub compat_version: u32,
}

/// One architecture of a (possibly fat) Mach-O file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachoSlice {
    pub arch: String,
    pub install_name: Option<String>,
    pub compat_version: Option<u32>,
    pub dependencies: Vec<LoadDylib>,
    pub rpaths: Vec<String>,
    /// Minimum macOS version, packed as `xxxx.yy.zz` nibbles.
    pub min_os: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachoFile {
    pub path: PathBuf,
    pub slices: Vec<MachoSlice>,
}

impl MachoFile {
    /// Read `path`; `Ok(None)` when the file is not Mach-O at all.
    #[allow(unsafe_code)]
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let file = File::open(path).at("Failed to open", path)?;
        let len = file.metadata().at("Failed to stat", path)?.len();
        if len < 8 {
            return Ok(None);
        }
        // SAFETY: the map is read-only and dropped before this returns. Inputs
        // are build artifacts nothing else writes to while we parse; a file
        // truncated underneath us surfaces as a bounds error from `Reader`.
        let map = unsafe { memmap2::Mmap::map(&file).at("Failed to map", path)? };
        Self::parse(path, &map)
    }

    /// Parse an in-memory image.
    pub fn parse(path: &Path, data: &[u8]) -> Result<Option<Self>> {
        let reader = Reader { path, data };
        let Some(magic) = reader.u32_be(0).ok() else {
            return Ok(None);
        };

        let slices = match magic {
            FAT_MAGIC | FAT_MAGIC_64 => {
                let nfat = reader.u32_be(4)?;
                if nfat == 0 || nfat > MAX_FAT_ARCHS {
                    return Ok(None);
                }
                let wide = magic == FAT_MAGIC_64;
                let entry = if wide { 32 } else { 20 };
                let mut slices = Vec::with_capacity(nfat as usize);
                for i in 0..nfat as usize {
                    let base = 8 + i * entry;
                    let (offset, size) = if wide {
                        (reader.u64_be(base + 8)?, reader.u64_be(base + 16)?)
                    } else {
                        (
                            u64::from(reader.u32_be(base + 8)?),
                            u64::from(reader.u32_be(base + 12)?),
                        )
                    };
                    let start = usize::try_from(offset).map_err(|_| reader.err("slice offset"))?;
                    let end = usize::try_from(offset + size).map_err(|_| reader.err("slice size"))?;
                    let slice = data
                        .get(start..end)
                        .ok_or_else(|| reader.err("fat slice beyond end of file"))?;
                    match parse_thin(path, slice)? {
                        Some(s) => slices.push(s),
                        None => return Err(reader.err("fat slice is not Mach-O")),
                    }
                }
                slices
            }
            MH_MAGIC | MH_MAGIC_64 | MH_CIGAM | MH_CIGAM_64 => match parse_thin(path, data)? {
                Some(s) => vec![s],
                None => return Ok(None),
            },
            _ => return Ok(None),
        };

        Ok(Some(Self {
            path: path.to_path_buf(),
            slices,
        }))
    }

    pub fn archs(&self) -> BTreeSet<String> {
        self.slices.iter().map(|s| s.arch.clone()).collect()
    }

    /// Install name of the first slice that has one.
    pub fn install_name(&self) -> Option<&str> {
        self.slices.iter().find_map(|s| s.install_name.as_deref())
    }

    pub fn compat_version(&self) -> Option<u32> {
        self.slices.iter().filter_map(|s| s.compat_version).max()
    }

    /// Referenced libraries across all slices, first occurrence wins.
    pub fn dependencies(&self) -> Vec<&LoadDylib> {
        let mut seen = BTreeSet::new();
        self.slices
            .iter()
            .flat_map(|s| &s.dependencies)
            .filter(|d| seen.insert(d.name.as_str()))
            .collect()
    }

    pub fn rpaths(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.slices
            .iter()
            .flat_map(|s| &s.rpaths)
            .map(String::as_str)
            .filter(|r| seen.insert(*r))
            .collect()
    }

    /// Highest minimum OS version over all slices.
    pub fn min_os(&self) -> Option<u32> {
        self.slices.iter().filter_map(|s| s.min_os).max()
    }
}

/// `0x000a0f00` -> `10.15`
pub fn format_version(v: u32) -> String {
    let (major, minor, patch) = (v >> 16, (v >> 8) & 0xff, v & 0xff);
    if patch == 0 {
        format!("{major}.{minor}")
    } else {
        format!("{major}.{minor}.{patch}")
    }
}

fn arch_name(cputype: u32) -> String {
    match cputype {
        t if t == CPU_TYPE_ARM | CPU_ARCH_ABI64 => "arm64".to_string(),
        t if t == CPU_TYPE_X86 | CPU_ARCH_ABI64 => "x86_64".to_string(),
        CPU_TYPE_X86 => "i386".to_string(),
        CPU_TYPE_ARM => "arm".to_string(),
        CPU_TYPE_POWERPC => "ppc".to_string(),
        t if t == CPU_TYPE_POWERPC | CPU_ARCH_ABI64 => "ppc64".to_string(),
        other => format!("cpu-{other:#x}"),
    }
}

struct Reader<'a> {
    path: &'a Path,
    data: &'a [u8],
}

impl Reader<'_> {
    fn err(&self, reason: &str) -> BuildError {
        BuildError::Macho {
            path: self.path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    fn bytes<const N: usize>(&self, at: usize) -> Result<[u8; N]> {
        self.data
            .get(at..at + N)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| self.err("truncated header"))
    }

    fn u32_be(&self, at: usize) -> Result<u32> {
        self.bytes(at).map(u32::from_be_bytes)
    }

    fn u64_be(&self, at: usize) -> Result<u64> {
        self.bytes(at).map(u64::from_be_bytes)
    }

    fn u32(&self, at: usize, little: bool) -> Result<u32> {
        self.bytes(at).map(|b| {
            if little {
                u32::from_le_bytes(b)
            } else {
                u32::from_be_bytes(b)
            }
        })
    }

    /// NUL-terminated string at `cmd + offset`, bounded by the command.
    fn lc_str(&self, cmd: usize, cmdsize: usize, offset: usize) -> Result<String> {
        let start = cmd + offset;
        let end = cmd + cmdsize;
        let raw = self
            .data
            .get(start..end)
            .ok_or_else(|| self.err("load command string out of bounds"))?;
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..len]).into_owned())
    }
}

fn parse_thin(path: &Path, data: &[u8]) -> Result<Option<MachoSlice>> {
    let r = Reader { path, data };
    let (little, wide) = match r.u32_be(0)? {
        MH_MAGIC => (false, false),
        MH_MAGIC_64 => (false, true),
        MH_CIGAM => (true, false),
        MH_CIGAM_64 => (true, true),
        _ => return Ok(None),
    };
    let cputype = r.u32(4, little)?;
    let ncmds = r.u32(16, little)? as usize;
    let mut at = if wide { 32 } else { 28 };

    let mut slice = MachoSlice {
        arch: arch_name(cputype),
        install_name: None,
        compat_version: None,
        dependencies: Vec::new(),
        rpaths: Vec::new(),
        min_os: None,
    };

    for _ in 0..ncmds {
        let cmd = r.u32(at, little)?;
        let cmdsize = r.u32(at + 4, little)? as usize;
        if cmdsize < 8 || at + cmdsize > data.len() {
            return Err(r.err("load command size out of bounds"));
        }
        let kind = match cmd {
            LC_LOAD_DYLIB => Some(LoadKind::Normal),
            LC_LOAD_WEAK_DYLIB => Some(LoadKind::Weak),
            LC_REEXPORT_DYLIB => Some(LoadKind::Reexport),
            LC_LAZY_LOAD_DYLIB => Some(LoadKind::Lazy),
            LC_LOAD_UPWARD_DYLIB => Some(LoadKind::Upward),
            _ => None,
        };
        match cmd {
            LC_ID_DYLIB => {
                let offset = r.u32(at + 8, little)? as usize;
                slice.install_name = Some(r.lc_str(at, cmdsize, offset)?);
                slice.compat_version = Some(r.u32(at + 20, little)?);
            }
            LC_RPATH => {
                let offset = r.u32(at + 8, little)? as usize;
                slice.rpaths.push(r.lc_str(at, cmdsize, offset)?);
            }
            LC_BUILD_VERSION => slice.min_os = Some(r.u32(at + 12, little)?),
            LC_VERSION_MIN_MACOSX => slice.min_os = Some(r.u32(at + 8, little)?),
            _ => {
                if let Some(kind) = kind {
                    let offset = r.u32(at + 8, little)? as usize;
                    slice.dependencies.push(LoadDylib {
                        name: r.lc_str(at, cmdsize, offset)?,
                        kind,
                        compat_version: r.u32(at + 20, little)?,
                    });
                }
            }
        }
        at += cmdsize;
    }
    Ok(Some(slice))
}

/// Synthetic Mach-O images for tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;
    pub const X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

    fn push_str_cmd(out: &mut Vec<u8>, cmd: u32, fixed: &[u32], s: &str) {
        let header = 8 + fixed.len() * 4;
        let raw = s.len() + 1;
        let size = (header + raw).div_ceil(8) * 8;
        out.extend_from_slice(&cmd.to_le_bytes());
        out.extend_from_slice(&(size as u32).to_le_bytes());
        for v in fixed {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(s.as_bytes());
        out.resize(out.len() + size - header - s.len(), 0);
    }

    /// A little-endian 64-bit dylib.
    pub fn dylib(cputype: u32, id: Option<&str>, deps: &[&str], rpaths: &[&str]) -> Vec<u8> {
        versioned_dylib(cputype, id, 0x0001_0000, deps, rpaths)
    }

    /// Like [`dylib`], with an explicit compatibility version in `LC_ID_DYLIB`.
    pub fn versioned_dylib(
        cputype: u32,
        id: Option<&str>,
        compat: u32,
        deps: &[&str],
        rpaths: &[&str],
    ) -> Vec<u8> {
        let mut cmds = Vec::new();
        let mut ncmds = 0u32;
        if let Some(id) = id {
            // name offset, timestamp, current version, compat version
            push_str_cmd(&mut cmds, LC_ID_DYLIB, &[24, 2, compat, compat], id);
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
        // LC_BUILD_VERSION: platform macOS, minos 11.0, sdk 14.0, no tools
        cmds.extend_from_slice(&LC_BUILD_VERSION.to_le_bytes());
        cmds.extend_from_slice(&24u32.to_le_bytes());
        for v in [1u32, 0x000b_0000, 0x000e_0000, 0] {
            cmds.extend_from_slice(&v.to_le_bytes());
        }
        ncmds += 1;

        // magic, cputype, subtype, MH_DYLIB, ncmds, sizeofcmds, flags, reserved
        let mut out = Vec::new();
        for v in [MH_MAGIC_64, cputype, 0, 6, ncmds, cmds.len() as u32, 0, 0] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&cmds);
        out
    }

    /// A fat file wrapping the given `(cputype, image)` slices.
    pub fn fat(slices: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&FAT_MAGIC.to_be_bytes());
        out.extend_from_slice(&(slices.len() as u32).to_be_bytes());
        let mut offset = 4096u32;
        let mut bodies = Vec::new();
        for (cputype, image) in slices {
            for v in [*cputype, 0, offset, image.len() as u32, 12] {
                out.extend_from_slice(&v.to_be_bytes());
            }
            bodies.push((offset, image));
            offset += (image.len() as u32).div_ceil(4096) * 4096;
        }
        for (offset, image) in bodies {
            out.resize(offset as usize, 0);
            out.extend_from_slice(image);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_parse_thin_dylib() {
        let image = dylib(
            ARM64,
            Some("/opt/lib/libfoo.1.dylib"),
            &["/usr/lib/libSystem.B.dylib", "@rpath/libbar.dylib"],
            &["/opt/lib"],
        );
        let file = MachoFile::parse(Path::new("libfoo.dylib"), &image).unwrap().unwrap();
        assert_eq!(file.archs(), BTreeSet::from(["arm64".to_string()]));
        assert_eq!(file.install_name(), Some("/opt/lib/libfoo.1.dylib"));
        assert_eq!(file.compat_version(), Some(0x0001_0000));
        let deps: Vec<_> = file.dependencies().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(deps, vec!["/usr/lib/libSystem.B.dylib", "@rpath/libbar.dylib"]);
        assert_eq!(file.rpaths(), vec!["/opt/lib"]);
        assert_eq!(file.min_os().map(format_version).as_deref(), Some("11.0"));
    }

    #[test]
    fn test_parse_fat_file() {
        let arm = dylib(ARM64, Some("@rpath/libz.dylib"), &[], &[]);
        let intel = dylib(X86_64, Some("@rpath/libz.dylib"), &[], &[]);
        let image = fat(&[(ARM64, arm), (X86_64, intel)]);
        let file = MachoFile::parse(Path::new("libz.dylib"), &image).unwrap().unwrap();
        assert_eq!(file.slices.len(), 2);
        assert_eq!(
            file.archs(),
            BTreeSet::from(["arm64".to_string(), "x86_64".to_string()])
        );
    }

    #[test]
    fn test_non_macho_is_none() {
        assert!(MachoFile::parse(Path::new("a.txt"), b"hello world").unwrap().is_none());
        // Java class file: fat magic, huge "arch count"
        let class = [0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00, 0x00, 0x34, 0, 0];
        assert!(MachoFile::parse(Path::new("A.class"), &class).unwrap().is_none());
    }

    #[test]
    fn test_truncated_load_commands_are_errors() {
        let mut image = dylib(ARM64, Some("@rpath/libx.dylib"), &[], &[]);
        image.truncate(40);
        assert!(matches!(
            MachoFile::parse(Path::new("libx.dylib"), &image),
            Err(BuildError::Macho { .. })
        ));
    }

    #[test]
    fn test_open_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("libq.dylib");
        std::fs::write(&lib, dylib(X86_64, Some("@rpath/libq.dylib"), &[], &[])).unwrap();
        assert!(MachoFile::open(&lib).unwrap().is_some());

        let text = dir.path().join("notes.txt");
        std::fs::write(&text, "x").unwrap();
        assert!(MachoFile::open(&text).unwrap().is_none());
        let script = dir.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\nexec python3 \"$@\"\n").unwrap();
        assert!(MachoFile::open(&script).unwrap().is_none());
    }
}
