//! Opening archive containers and walking their TOC.

use std::fs::File;
use std::io::{Read as _, Seek as _, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::BundleError;
use crate::extract::decompress;
use crate::format::{self, Cookie, TocEntry, COOKIE_LEN};

/// Extension of the standalone sibling container next to an executable whose
/// image does not carry an appended container itself.
pub const SIDECAR_EXTENSION: &str = "pkg";

/// An opened archive container.
///
/// Opened explicitly, closed explicitly (or on drop); never implicitly
/// reopened mid-traversal. The raw TOC region is read once at open and
/// decoded lazily by [`Archive::toc_entries`].
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    file: Option<File>,
    /// Container start within the backing store.
    start: u64,
    archive_length: u64,
    toc: Vec<u8>,
    runtime_lib: String,
}

impl Archive {
    /// Opens the container in `path` and validates its bounds against the
    /// actual backing-store size. Every TOC record is bounds-checked here;
    /// an entry whose payload would read past the container is a
    /// [`BundleError::Corrupt`], never silently clamped.
    pub fn open(path: &Path) -> Result<Archive, BundleError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BundleError::NotFound(path.to_path_buf()));
            }
            Err(err) => return Err(BundleError::Io(err)),
        };
        let backing_len = file.metadata()?.len();
        if backing_len < COOKIE_LEN as u64 {
            return Err(BundleError::NotFound(path.to_path_buf()));
        }

        let mut cookie_bytes = [0u8; COOKIE_LEN];
        file.seek(SeekFrom::Start(backing_len - COOKIE_LEN as u64))?;
        file.read_exact(&mut cookie_bytes)?;
        let cookie = match Cookie::parse(&cookie_bytes)? {
            Some(cookie) => cookie,
            None => return Err(BundleError::NotFound(path.to_path_buf())),
        };

        let archive_length = u64::from(cookie.archive_length);
        if archive_length > backing_len {
            return Err(BundleError::Truncated(path.to_path_buf()));
        }
        if archive_length < COOKIE_LEN as u64 {
            return Err(BundleError::Corrupt(format!(
                "declared container length {archive_length} is smaller than the cookie"
            )));
        }
        let start = backing_len - archive_length;

        let toc_offset = u64::from(cookie.toc_offset);
        let toc_length = u64::from(cookie.toc_length);
        if toc_offset + toc_length > archive_length - COOKIE_LEN as u64 {
            return Err(BundleError::Corrupt(format!(
                "TOC extent ({toc_offset}+{toc_length}) exceeds container bounds"
            )));
        }

        let mut toc = vec![0u8; toc_length as usize];
        file.seek(SeekFrom::Start(start + toc_offset))?;
        file.read_exact(&mut toc)?;

        let archive = Archive {
            path: path.to_path_buf(),
            file: Some(file),
            start,
            archive_length,
            toc,
            runtime_lib: cookie.runtime_lib,
        };

        for entry in archive.toc_entries() {
            let entry = entry?;
            let payload_end = entry.offset + u64::from(entry.compressed_length);
            if payload_end > archive.archive_length {
                return Err(BundleError::Corrupt(format!(
                    "payload of {:?} ends at {payload_end}, past the container end {}",
                    entry.name, archive.archive_length
                )));
            }
        }

        Ok(archive)
    }

    /// Opens the primary container for an executable: the executable image
    /// itself if a container is appended to it, otherwise the sibling
    /// `<exe>.pkg` file.
    pub fn open_for_executable(exe: &Path) -> Result<Archive, BundleError> {
        match Archive::open(exe) {
            Ok(archive) => Ok(archive),
            Err(BundleError::NotFound(_)) => {
                let mut sidecar = exe.as_os_str().to_os_string();
                sidecar.push(".");
                sidecar.push(SIDECAR_EXTENSION);
                Archive::open(Path::new(&sidecar))
            }
            Err(err) => Err(err),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the hosted runtime's shared library, from the cookie.
    pub fn runtime_lib(&self) -> &str {
        &self.runtime_lib
    }

    /// Forward-only cursor over the TOC. The sequence is lazy, finite, and
    /// restartable from scratch; it terminates at the declared TOC end and
    /// never reads past it. A corrupt record ends the sequence after the
    /// error is yielded.
    pub fn toc_entries(&self) -> TocCursor<'_> {
        TocCursor {
            toc: &self.toc,
            pos: 0,
        }
    }

    /// Forward scan for the entry named `name`.
    pub fn find_entry(&self, name: &str) -> Result<Option<TocEntry>, BundleError> {
        for entry in self.toc_entries() {
            let entry = entry?;
            if entry.name == name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Reads exactly `compressed_length` raw payload bytes for `entry`.
    pub fn read_payload(&self, entry: &TocEntry) -> Result<Vec<u8>, BundleError> {
        let end = entry.offset + u64::from(entry.compressed_length);
        if end > self.archive_length {
            return Err(BundleError::Corrupt(format!(
                "payload of {:?} exceeds container bounds",
                entry.name
            )));
        }
        let mut file = self.backing()?;
        file.seek(SeekFrom::Start(self.start + entry.offset))?;
        let mut payload = vec![0u8; entry.compressed_length as usize];
        file.read_exact(&mut payload).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                BundleError::Truncated(self.path.clone())
            } else {
                BundleError::Io(err)
            }
        })?;
        Ok(payload)
    }

    /// Reads and, if flagged, inflates the payload of `entry`. The inflated
    /// byte count must equal the declared uncompressed length.
    pub fn extract_to_memory(&self, entry: &TocEntry) -> Result<Vec<u8>, BundleError> {
        let payload = self.read_payload(entry)?;
        if entry.is_compressed {
            decompress(&payload, entry.uncompressed_length, &entry.name)
        } else {
            if payload.len() as u64 != u64::from(entry.uncompressed_length) {
                return Err(BundleError::Corrupt(format!(
                    "stored entry {:?} declares {} uncompressed bytes but carries {}",
                    entry.name,
                    entry.uncompressed_length,
                    payload.len()
                )));
            }
            Ok(payload)
        }
    }

    /// Absolute offset of an entry's payload within the backing store, for
    /// handing embedded payload locations to the hosted runtime.
    pub fn payload_location(&self, entry: &TocEntry) -> (u64, u32) {
        (self.start + entry.offset, entry.compressed_length)
    }

    /// Releases the backing file handle. Double-close is a no-op.
    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn backing(&self) -> Result<&File, BundleError> {
        self.file
            .as_ref()
            .ok_or_else(|| BundleError::Closed(self.path.clone()))
    }
}

/// Iterator over TOC records. See [`Archive::toc_entries`].
#[derive(Debug)]
pub struct TocCursor<'a> {
    toc: &'a [u8],
    pos: usize,
}

impl Iterator for TocCursor<'_> {
    type Item = Result<TocEntry, BundleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.toc.len() {
            return None;
        }
        match format::parse_toc_entry(self.toc, self.pos) {
            Ok((entry, next_pos)) => {
                self.pos = next_pos;
                Some(Ok(entry))
            }
            Err(err) => {
                // Stop at the first malformed record; the cursor never moves
                // backward and never resynchronizes.
                self.pos = self.toc.len();
                Some(Err(err))
            }
        }
    }
}
