//! Filesystem helpers shared by the emitter and the relocator.

use crate::error::{IoContext, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Names that never belong in a bundle: version control metadata and editor litter.
pub fn is_scm_or_backup(name: &str) -> bool {
    matches!(
        name,
        ".git" | ".hg" | ".svn" | "CVS" | ".bzr" | ".DS_Store" | "__pycache__"
    ) || name.ends_with('~')
        || name.ends_with(".orig")
        || name.ends_with(".rej")
        || (name.starts_with(".#"))
}

/// Compute a relative path from `from_dir` to `to_path`.
///
/// Both paths must be absolute (or both relative to the same root).
pub fn relative_path(from_dir: &Path, to_path: &Path) -> PathBuf {
    let from_components: Vec<_> = from_dir.components().collect();
    let to_components: Vec<_> = to_path.components().collect();

    let common_len = from_components
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common_len..from_components.len() {
        result.push("..");
    }
    for part in &to_components[common_len..] {
        result.push(part);
    }
    result
}

/// Recursively copy `src` into `dst`, preserving relative symlinks.
///
/// `keep` sees each entry's path relative to `src`; returning `false` skips
/// the entry (and everything below it, for directories).
pub fn copy_tree(src: &Path, dst: &Path, keep: impl Fn(&Path) -> bool) -> Result<usize> {
    let mut copied = 0;
    let mut walker = walkdir::WalkDir::new(src).follow_links(false).into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
            crate::error::BuildError::fs("Failed to walk", &path, io)
        })?;
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(src) else {
            continue;
        };

        if !rel.as_os_str().is_empty() {
            let name = entry.file_name().to_string_lossy();
            if is_scm_or_backup(&name) || !keep(rel) {
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
        }

        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&target).at("Failed to create", &target)?;
        } else if ft.is_symlink() {
            let link = fs::read_link(path).at("Failed to read link", path)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).at("Failed to create", parent)?;
            }
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target).at("Failed to replace", &target)?;
            }
            std::os::unix::fs::symlink(&link, &target).at("Failed to symlink", &target)?;
            copied += 1;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).at("Failed to create", parent)?;
            }
            fs::copy(path, &target).at("Failed to copy", path)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Copy a file and mark it executable (`0755`).
pub fn copy_executable(src: &Path, dest: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).at("Failed to create", parent)?;
    }
    fs::copy(src, dest).at("Failed to copy", src)?;
    let mut perms = dest.metadata().at("Failed to stat", dest)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(dest, perms).at("Failed to chmod", dest)?;
    Ok(())
}

/// Hard-link `src` to `dest`, falling back to a copy across volumes.
pub fn hard_link_or_copy(src: &Path, dest: &Path) -> Result<()> {
    if dest.symlink_metadata().is_ok() {
        fs::remove_file(dest).at("Failed to replace", dest)?;
    }
    if fs::hard_link(src, dest).is_err() {
        copy_executable(src, dest)?;
    }
    Ok(())
}

/// Hex SHA-256 of a file's contents.
pub fn file_digest(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).at("Failed to open", path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).at("Failed to read", path)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_relative_path_same_dir() {
        let result = relative_path(Path::new("/a/b/c"), Path::new("/a/b/c/file"));
        assert_eq!(result, PathBuf::from("file"));
    }

    #[test]
    fn test_relative_path_cross_dir() {
        let result = relative_path(
            Path::new("/B.app/Contents/Resources/lib/python3.12/lib-dynload"),
            Path::new("/B.app/Contents/Frameworks"),
        );
        assert_eq!(result, PathBuf::from("../../../../Frameworks"));
    }

    #[test]
    fn test_copy_tree_skips_scm_and_filtered() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(src.path().join(".git")).unwrap();
        fs::write(src.path().join(".git/HEAD"), "ref").unwrap();
        fs::create_dir_all(src.path().join("Headers")).unwrap();
        fs::write(src.path().join("Headers/x.h"), "").unwrap();
        fs::write(src.path().join("keep.txt"), "x").unwrap();
        fs::write(src.path().join("keep.txt~"), "x").unwrap();
        std::os::unix::fs::symlink("keep.txt", src.path().join("link")).unwrap();

        let n = copy_tree(src.path(), dst.path(), |rel| !rel.starts_with("Headers")).unwrap();

        assert_eq!(n, 2);
        assert!(dst.path().join("keep.txt").is_file());
        assert!(dst.path().join("link").symlink_metadata().unwrap().is_symlink());
        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join("Headers").exists());
        assert!(!dst.path().join("keep.txt~").exists());
    }

    #[test]
    fn test_hard_link_replaces_existing() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "launcher").unwrap();
        fs::write(&b, "stale").unwrap();
        hard_link_or_copy(&a, &b).unwrap();
        assert_eq!(fs::read_to_string(&b).unwrap(), "launcher");
    }

    #[test]
    fn test_digest_distinguishes_content() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x"), "one").unwrap();
        fs::write(dir.path().join("y"), "two").unwrap();
        assert_ne!(
            file_digest(&dir.path().join("x")).unwrap(),
            file_digest(&dir.path().join("y")).unwrap()
        );
    }
}
