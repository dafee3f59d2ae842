//! Bundle directory layout.
//!
//! ```text
//! Name.app/
//!   Contents/
//!     Info.plist
//!     PkgInfo
//!     MacOS/Name
//!     Resources/
//!       __boot__.py
//!       lib/python3.12/
//!         site-packages.zip
//!         lib-dynload/
//!     Frameworks/
//! ```
//!
//! The layout is computed once from the bundle root and the interpreter
//! version and never changes afterwards; the emitter materializes it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Paths of one bundle on disk.
#[derive(Debug, Clone)]
pub struct BundleLayout {
    root: PathBuf,
    name: String,
    python_dir: String,
}

impl BundleLayout {
    /// Describe the bundle at `root` whose launcher is called `name`, embedding
    /// Python `major.minor`.
    pub fn new(root: impl Into<PathBuf>, name: &str, version: (u32, u32)) -> Self {
        Self {
            root: root.into(),
            name: name.to_string(),
            python_dir: format!("python{}.{}", version.0, version.1),
        }
    }

    /// Bundle root: `Name.app`
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Launcher name, also `CFBundleExecutable`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Contents/`
    pub fn contents(&self) -> PathBuf {
        self.root.join("Contents")
    }

    /// `Contents/MacOS/`
    pub fn macos(&self) -> PathBuf {
        self.contents().join("MacOS")
    }

    /// `Contents/MacOS/<Name>`
    pub fn executable(&self) -> PathBuf {
        self.macos().join(&self.name)
    }

    /// `Contents/Resources/`
    pub fn resources(&self) -> PathBuf {
        self.contents().join("Resources")
    }

    /// `Contents/Frameworks/`
    pub fn frameworks(&self) -> PathBuf {
        self.contents().join("Frameworks")
    }

    /// `Contents/Info.plist`
    pub fn info_plist(&self) -> PathBuf {
        self.contents().join("Info.plist")
    }

    /// `Contents/PkgInfo`
    pub fn pkg_info(&self) -> PathBuf {
        self.contents().join("PkgInfo")
    }

    /// `Contents/Resources/__boot__.py`
    pub fn bootstrap(&self) -> PathBuf {
        self.resources().join("__boot__.py")
    }

    /// `pythonM.N`, the directory name under `Resources/lib/`.
    pub fn python_dir(&self) -> &str {
        &self.python_dir
    }

    /// `Contents/Resources/lib/pythonM.N/`
    pub fn pylib(&self) -> PathBuf {
        self.resources().join("lib").join(&self.python_dir)
    }

    /// `Contents/Resources/lib/pythonM.N/site-packages.zip`
    pub fn site_packages_zip(&self) -> PathBuf {
        self.pylib().join("site-packages.zip")
    }

    /// `Contents/Resources/lib/pythonM.N/lib-dynload/`
    pub fn lib_dynload(&self) -> PathBuf {
        self.pylib().join("lib-dynload")
    }

    /// Where a native extension module lands: `lib-dynload/<dotted.name>.so`.
    pub fn extension_path(&self, module: &str) -> PathBuf {
        self.lib_dynload().join(format!("{module}.so"))
    }

    /// Paths relative to `Contents/Resources/` that the launcher puts on
    /// `sys.path`, in order.
    pub fn resource_packages(&self) -> Vec<String> {
        vec![
            format!("lib/{}/site-packages.zip", self.python_dir),
            format!("lib/{}", self.python_dir),
            format!("lib/{}/lib-dynload", self.python_dir),
        ]
    }
}

/// Tracks every destination written into the bundle so nothing is
/// overwritten silently.
#[derive(Debug, Default)]
pub struct StagingSet {
    staged: BTreeSet<PathBuf>,
}

impl StagingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path`; fails if it, an ancestor or a descendant was claimed before.
    pub fn claim(&mut self, path: &Path) -> Result<()> {
        let collides = self.staged.contains(path)
            || path.ancestors().skip(1).any(|a| self.staged.contains(a))
            || self
                .staged
                .range(path.to_path_buf()..)
                .next()
                .is_some_and(|p| p.starts_with(path));
        if collides {
            return Err(BuildError::Layout(path.to_path_buf()));
        }
        self.staged.insert(path.to_path_buf());
        Ok(())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.staged.contains(path)
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}
