//! `site-packages.zip`.
//!
//! Entries are written sorted by path with a fixed timestamp and fixed
//! permissions, so the archive only changes when its contents do.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::{BuildError, IoContext, Result};

#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member; two members with the same path are a layout error.
    pub fn add(&mut self, path: impl Into<String>, data: Vec<u8>) -> Result<()> {
        let path = path.into();
        if self.entries.contains_key(&path) {
            return Err(BuildError::Layout(path.into()));
        }
        self.entries.insert(path, data);
        Ok(())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn write(self, path: &Path) -> Result<usize> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).at("Failed to create", parent)?;
        }
        let file = File::create(path).at("Failed to create", path)?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644);

        let count = self.entries.len();
        for (name, data) in self.entries {
            zip.start_file(name, options)?;
            zip.write_all(&data).at("Failed to write", path)?;
        }
        zip.finish()?;
        Ok(count)
    }
}
