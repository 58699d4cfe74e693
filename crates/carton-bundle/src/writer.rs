//! Minimal archive writer.
//!
//! The production packing tool lives outside this repository; this writer
//! exists so the test suites can build real containers instead of
//! hand-assembling bytes, and it doubles as executable documentation of the
//! format in `format.rs`.

use std::io::Write as _;
use std::path::Path;

use crate::format::{Typecode, ARCHIVE_MAGIC, COOKIE_LEN, FORMAT_VERSION, RUNTIME_LIB_FIELD_LEN, TOC_ENTRY_HEADER_LEN};

/// Accumulates entries and serializes a complete container (data region,
/// TOC, trailing cookie).
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    runtime_lib: String,
    data: Vec<u8>,
    toc: Vec<u8>,
}

impl ArchiveWriter {
    pub fn new() -> ArchiveWriter {
        ArchiveWriter::default()
    }

    /// Records the hosted runtime's shared library name in the cookie.
    pub fn set_runtime_lib(&mut self, name: &str) {
        assert!(
            name.len() < RUNTIME_LIB_FIELD_LEN,
            "runtime library name too long for the cookie field"
        );
        self.runtime_lib = name.to_string();
    }

    /// Appends an entry with a stored (uncompressed) payload.
    pub fn add_entry(&mut self, typecode: Typecode, name: &str, payload: &[u8]) {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(payload);
        self.push_record(
            typecode,
            name,
            offset,
            payload.len() as u32,
            payload.len() as u32,
            false,
        );
    }

    /// Appends an entry with a zlib-compressed payload.
    pub fn add_compressed_entry(&mut self, typecode: Typecode, name: &str, payload: &[u8]) {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(payload).expect("zlib encode");
        let compressed = encoder.finish().expect("zlib finish");

        let offset = self.data.len() as u32;
        self.data.extend_from_slice(&compressed);
        self.push_record(
            typecode,
            name,
            offset,
            compressed.len() as u32,
            payload.len() as u32,
            true,
        );
    }

    fn push_record(
        &mut self,
        typecode: Typecode,
        name: &str,
        offset: u32,
        compressed_length: u32,
        uncompressed_length: u32,
        is_compressed: bool,
    ) {
        let record_length = (TOC_ENTRY_HEADER_LEN + name.len() + 1) as u32;
        self.toc.extend_from_slice(&record_length.to_be_bytes());
        self.toc.extend_from_slice(&offset.to_be_bytes());
        self.toc.extend_from_slice(&compressed_length.to_be_bytes());
        self.toc.extend_from_slice(&uncompressed_length.to_be_bytes());
        self.toc.push(u8::from(is_compressed));
        self.toc.push(typecode.as_byte());
        self.toc.extend_from_slice(name.as_bytes());
        self.toc.push(0);
    }

    /// Serializes the container. The result can stand alone in its own file
    /// or be appended to an executable image; offsets in the cookie are
    /// container-relative either way.
    pub fn finish(self) -> Vec<u8> {
        let toc_offset = self.data.len() as u32;
        let toc_length = self.toc.len() as u32;
        let archive_length = (self.data.len() + self.toc.len() + COOKIE_LEN) as u32;

        let mut out = self.data;
        out.extend_from_slice(&self.toc);

        out.extend_from_slice(&ARCHIVE_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        out.extend_from_slice(&archive_length.to_be_bytes());
        out.extend_from_slice(&toc_offset.to_be_bytes());
        out.extend_from_slice(&toc_length.to_be_bytes());
        let mut name_field = [0u8; RUNTIME_LIB_FIELD_LEN];
        name_field[..self.runtime_lib.len()].copy_from_slice(self.runtime_lib.as_bytes());
        out.extend_from_slice(&name_field);
        out
    }

    /// Serializes the container into a standalone file.
    pub fn write_to(self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.finish())
    }
}
