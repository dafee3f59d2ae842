//! Post-build inspection of the Mach-O files inside a bundle.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::Result;
use crate::layout::BundleLayout;
use crate::macho::{MachoFile, format_version};
use crate::relocator::{is_system_path, normalize};

#[derive(Debug, Clone, Serialize)]
pub struct AuditedBinary {
    /// Path relative to the bundle root.
    pub path: PathBuf,
    pub archs: BTreeSet<String>,
    pub min_os: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub binaries: Vec<AuditedBinary>,
    /// Architectures every binary supports.
    pub common_archs: BTreeSet<String>,
    /// The highest minimum macOS version over all binaries.
    pub min_os: Option<String>,
    /// References that point outside the bundle.
    pub external: Vec<String>,
    /// References that do not resolve at all.
    pub unresolved: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.external.is_empty() && self.unresolved.is_empty()
    }

    /// Architectures some binary supports but not all of them.
    pub fn partial_archs(&self) -> BTreeSet<String> {
        self.binaries
            .iter()
            .flat_map(|b| b.archs.iter().cloned())
            .filter(|a| !self.common_archs.contains(a))
            .collect()
    }
}

/// Scan every regular file below the bundle root.
///
/// `allow_external` lists references that may legitimately stay unbundled:
/// path prefixes (the host runtime in semi-standalone builds) or exact
/// load names (libraries kept out with `dylib_excludes`).
pub fn audit(layout: &BundleLayout, allow_external: &[PathBuf]) -> Result<AuditReport> {
    let root = layout.root();
    let executable_dir = layout.macos();
    let mut report = AuditReport::default();
    let mut max_min_os: Option<u32> = None;
    let mut common: Option<BTreeSet<String>> = None;

    let files = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file());

    for entry in files {
        let path = entry.path();
        let Some(macho) = MachoFile::open(path)? else {
            continue;
        };
        let rel = path.strip_prefix(root).unwrap_or(path).to_path_buf();
        let archs = macho.archs();
        let min_os = macho.min_os();
        max_min_os = max_min_os.max(min_os);
        common = Some(match common {
            None => archs.clone(),
            Some(c) => c.intersection(&archs).cloned().collect(),
        });

        let loader_dir = path.parent().unwrap_or(root);
        let search: Vec<PathBuf> = macho
            .rpaths()
            .iter()
            .filter_map(|r| expand(r, loader_dir, &executable_dir))
            .collect();

        for dep in macho.dependencies() {
            let name = dep.name.as_str();
            if is_system_path(name) {
                continue;
            }
            if allow_external.iter().any(|p| Path::new(name).starts_with(p)) {
                continue;
            }
            let label = format!("{}: {name}", rel.display());
            if name.starts_with('/') {
                report.external.push(label);
                continue;
            }
            let candidates: Vec<PathBuf> = match name.strip_prefix("@rpath/") {
                Some(rest) => search.iter().map(|d| normalize(&d.join(rest))).collect(),
                None => expand(name, loader_dir, &executable_dir).into_iter().collect(),
            };
            match candidates.iter().find(|c| c.exists()) {
                Some(found) if found.starts_with(root) => {}
                Some(_) => report.external.push(label),
                None => report.unresolved.push(label),
            }
        }

        report.binaries.push(AuditedBinary {
            path: rel,
            archs,
            min_os: min_os.map(format_version),
        });
    }

    report.common_archs = common.unwrap_or_default();
    report.min_os = max_min_os.map(format_version);
    Ok(report)
}

fn expand(name: &str, loader_dir: &Path, executable_dir: &Path) -> Option<PathBuf> {
    let (base, rest) = if let Some(rest) = name.strip_prefix("@loader_path") {
        (loader_dir, rest)
    } else if let Some(rest) = name.strip_prefix("@executable_path") {
        (executable_dir, rest)
    } else if name.starts_with('/') {
        return Some(PathBuf::from(name));
    } else {
        return None;
    };
    Some(normalize(&base.join(rest.trim_start_matches('/'))))
}
