//! Archive container format and extraction engine for carton bundles.
//!
//! A carton bundle is a native executable with an archive container either
//! appended to the executable image or stored in a sibling `.pkg` file. The
//! container carries a flat table of contents (TOC) that is traversed in a
//! single forward pass at launch; payloads are materialized into the
//! launcher's private working directory.

pub mod error;
pub mod extract;
pub mod format;
pub mod multipkg;
pub mod reader;
pub mod writer;

pub use error::BundleError;
pub use extract::{extract_entry, sanitize_entry_name};
pub use format::{Typecode, TocEntry, ARCHIVE_MAGIC, COOKIE_LEN, FORMAT_VERSION};
pub use multipkg::{ArchivePool, ARCHIVE_POOL_CAPACITY};
pub use reader::Archive;
pub use writer::ArchiveWriter;
