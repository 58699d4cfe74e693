use std::path::PathBuf;

use thiserror::Error;

/// Typed errors for archive parsing, extraction, and dependency resolution.
///
/// Layers below the launcher never terminate the process; the launcher maps
/// these onto its bootstrap-fatal exit path.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("no archive container found in {0}")]
    NotFound(PathBuf),

    #[error("archive container in {0} is truncated")]
    Truncated(PathBuf),

    #[error("archive container is corrupt: {0}")]
    Corrupt(String),

    #[error("archive {0} is already closed")]
    Closed(PathBuf),

    #[error("entry name would escape the extraction root: {0:?}")]
    UnsafePath(String),

    #[error("dependency archive not found: {0:?}")]
    DependencyNotFound(String),

    #[error("archive pool exhausted (capacity {0})")]
    PoolExhausted(usize),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
