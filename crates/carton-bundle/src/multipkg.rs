//! Multi-package dependency resolution.
//!
//! A dependency-reference TOC entry names a payload that lives in a sibling
//! archive shared across bundles (`package:entry`). Opened siblings are kept
//! in a small bounded pool for the duration of one launch so repeat
//! references reuse the same handle; every pooled archive is closed exactly
//! once at teardown, on every exit path.

use std::path::Path;

use crate::error::BundleError;
use crate::reader::Archive;

/// Fixed pool capacity: the number of distinct sibling archives one launch
/// may reference.
pub const ARCHIVE_POOL_CAPACITY: usize = 8;

/// Bounded map from dependency-package name to an owned, opened archive.
#[derive(Debug, Default)]
pub struct ArchivePool {
    slots: Vec<(String, Archive)>,
}

impl ArchivePool {
    pub fn new() -> ArchivePool {
        ArchivePool { slots: Vec::new() }
    }

    /// Returns the pooled archive for `package`, opening the sibling file
    /// `<exe_dir>/<package>.pkg` on first reference. Repeat references
    /// return the same handle. Keys are unique and the pool never grows past
    /// [`ARCHIVE_POOL_CAPACITY`].
    pub fn resolve(&mut self, package: &str, exe_dir: &Path) -> Result<&Archive, BundleError> {
        if let Some(index) = self.slots.iter().position(|(key, _)| key == package) {
            return Ok(&self.slots[index].1);
        }
        if self.slots.len() >= ARCHIVE_POOL_CAPACITY {
            return Err(BundleError::PoolExhausted(ARCHIVE_POOL_CAPACITY));
        }

        let sibling = exe_dir.join(format!("{package}.pkg"));
        let archive = Archive::open(&sibling).map_err(|err| match err {
            BundleError::NotFound(_) => BundleError::DependencyNotFound(package.to_string()),
            other => other,
        })?;

        self.slots.push((package.to_string(), archive));
        let index = self.slots.len() - 1;
        Ok(&self.slots[index].1)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Closes every pooled archive exactly once and empties the pool.
    /// Invoked unconditionally at the end of the launch sequence; `Drop`
    /// covers early-abort paths.
    pub fn release_all(&mut self) {
        for (_, mut archive) in self.slots.drain(..) {
            archive.close();
        }
    }
}

impl Drop for ArchivePool {
    fn drop(&mut self) {
        self.release_all();
    }
}
