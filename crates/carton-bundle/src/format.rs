//! On-disk layout of the carton archive container.
//!
//! The container may be appended to the executable image, so the cookie that
//! describes it trails the data: the last [`COOKIE_LEN`] bytes of the backing
//! store hold the magic, the total container length, and the TOC extent. All
//! integers are big-endian. Offsets inside TOC records are relative to the
//! container start (`backing_len - archive_length`), which makes the same
//! container work appended or standalone.

use crate::error::BundleError;

/// Magic bytes opening the trailing cookie.
pub const ARCHIVE_MAGIC: [u8; 8] = [b'C', b'A', b'R', b'T', b'O', b'N', 0x0b, 0x0e];

/// Container format version accepted by this reader.
pub const FORMAT_VERSION: u32 = 1;

/// Size of the zero-padded runtime library name field in the cookie.
pub const RUNTIME_LIB_FIELD_LEN: usize = 64;

/// Total cookie size: magic + 4 u32 fields + runtime library name.
pub const COOKIE_LEN: usize = 8 + 4 * 4 + RUNTIME_LIB_FIELD_LEN;

/// Fixed part of a TOC record preceding the entry name.
pub const TOC_ENTRY_HEADER_LEN: usize = 4 * 4 + 2;

/// How a TOC entry's payload is materialized or interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Typecode {
    /// Extension binary or shared library; gets exec permission bits.
    Binary,
    /// Plain data file.
    Data,
    /// Embedded zip payload (the hosted runtime's module store).
    ZipPayload,
    /// Symbolic link; payload bytes are the link target.
    Symlink,
    /// Payload lives in a sibling archive (`package:entry` name).
    Dependency,
    /// Program source unit, evaluated by the hosted runtime in TOC order.
    SourceUnit,
    /// Package marker consumed by the hosted runtime's importer.
    PackageMarker,
    /// Bootstrap option string carried in the entry name.
    RuntimeOption,
    /// Splash screen resource; rendering is out of scope for the launcher.
    SplashResource,
}

impl Typecode {
    pub fn from_byte(byte: u8) -> Option<Typecode> {
        match byte {
            b'b' => Some(Typecode::Binary),
            b'x' => Some(Typecode::Data),
            b'Z' => Some(Typecode::ZipPayload),
            b'n' => Some(Typecode::Symlink),
            b'd' => Some(Typecode::Dependency),
            b's' => Some(Typecode::SourceUnit),
            b'M' => Some(Typecode::PackageMarker),
            b'o' => Some(Typecode::RuntimeOption),
            b'l' => Some(Typecode::SplashResource),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Typecode::Binary => b'b',
            Typecode::Data => b'x',
            Typecode::ZipPayload => b'Z',
            Typecode::Symlink => b'n',
            Typecode::Dependency => b'd',
            Typecode::SourceUnit => b's',
            Typecode::PackageMarker => b'M',
            Typecode::RuntimeOption => b'o',
            Typecode::SplashResource => b'l',
        }
    }

    /// Whether the extraction pass writes this entry into the working
    /// directory (directly or via a sibling archive).
    pub fn is_extractable(self) -> bool {
        matches!(
            self,
            Typecode::Binary
                | Typecode::Data
                | Typecode::ZipPayload
                | Typecode::Symlink
                | Typecode::Dependency
        )
    }
}

/// Decoded trailing cookie.
#[derive(Debug, Clone)]
pub struct Cookie {
    pub format_version: u32,
    pub archive_length: u32,
    pub toc_offset: u32,
    pub toc_length: u32,
    pub runtime_lib: String,
}

impl Cookie {
    /// Decodes a cookie from the last [`COOKIE_LEN`] bytes of a backing
    /// store. Returns `Ok(None)` when the magic does not match (the backing
    /// store is simply not a carton container); other malformations are
    /// reported as [`BundleError::Corrupt`].
    pub fn parse(bytes: &[u8]) -> Result<Option<Cookie>, BundleError> {
        if bytes.len() != COOKIE_LEN {
            return Err(BundleError::Corrupt(format!(
                "cookie must be {COOKIE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[..8] != ARCHIVE_MAGIC {
            return Ok(None);
        }
        let format_version = read_be_u32(bytes, 8)?;
        if format_version != FORMAT_VERSION {
            return Err(BundleError::Corrupt(format!(
                "unsupported container format version {format_version} (expected {FORMAT_VERSION})"
            )));
        }
        let archive_length = read_be_u32(bytes, 12)?;
        let toc_offset = read_be_u32(bytes, 16)?;
        let toc_length = read_be_u32(bytes, 20)?;

        let name_field = &bytes[24..24 + RUNTIME_LIB_FIELD_LEN];
        let nul = name_field
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| BundleError::Corrupt("runtime library name is not NUL-terminated".to_string()))?;
        let runtime_lib = std::str::from_utf8(&name_field[..nul])
            .map_err(|_| BundleError::Corrupt("runtime library name is not valid UTF-8".to_string()))?
            .to_string();

        Ok(Some(Cookie {
            format_version,
            archive_length,
            toc_offset,
            toc_length,
            runtime_lib,
        }))
    }
}

/// One TOC record. Immutable once parsed; owned by the archive that produced
/// it and never copied across archives.
#[derive(Debug, Clone)]
pub struct TocEntry {
    pub typecode: Typecode,
    /// Logical relative path; doubles as the lookup key.
    pub name: String,
    /// Payload offset relative to the container start.
    pub offset: u64,
    pub compressed_length: u32,
    pub uncompressed_length: u32,
    pub is_compressed: bool,
}

/// Decodes one TOC record at `pos` within the raw TOC region. Returns the
/// entry and the position of the next record.
pub(crate) fn parse_toc_entry(toc: &[u8], pos: usize) -> Result<(TocEntry, usize), BundleError> {
    let remaining = toc.len() - pos;
    if remaining < TOC_ENTRY_HEADER_LEN + 1 {
        return Err(BundleError::Corrupt(format!(
            "truncated TOC record at offset {pos} ({remaining} bytes left)"
        )));
    }
    let record_length = read_be_u32(toc, pos)? as usize;
    if record_length < TOC_ENTRY_HEADER_LEN + 1 || record_length > remaining {
        return Err(BundleError::Corrupt(format!(
            "TOC record at offset {pos} declares bad length {record_length}"
        )));
    }
    let data_offset = read_be_u32(toc, pos + 4)?;
    let compressed_length = read_be_u32(toc, pos + 8)?;
    let uncompressed_length = read_be_u32(toc, pos + 12)?;
    let is_compressed = toc[pos + 16] != 0;
    let typecode_byte = toc[pos + 17];
    let typecode = Typecode::from_byte(typecode_byte).ok_or_else(|| {
        BundleError::Corrupt(format!(
            "TOC record at offset {pos} has unknown typecode 0x{typecode_byte:02x}"
        ))
    })?;

    let name_field = &toc[pos + TOC_ENTRY_HEADER_LEN..pos + record_length];
    let nul = name_field.iter().position(|&b| b == 0).ok_or_else(|| {
        BundleError::Corrupt(format!(
            "TOC record at offset {pos} has a name that is not NUL-terminated"
        ))
    })?;
    let name = std::str::from_utf8(&name_field[..nul])
        .map_err(|_| {
            BundleError::Corrupt(format!("TOC record at offset {pos} has a non-UTF-8 name"))
        })?
        .to_string();
    if name.is_empty() {
        return Err(BundleError::Corrupt(format!(
            "TOC record at offset {pos} has an empty name"
        )));
    }

    let entry = TocEntry {
        typecode,
        name,
        offset: u64::from(data_offset),
        compressed_length,
        uncompressed_length,
        is_compressed,
    };
    Ok((entry, pos + record_length))
}

pub(crate) fn read_be_u32(bytes: &[u8], at: usize) -> Result<u32, BundleError> {
    let field: [u8; 4] = bytes
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| BundleError::Corrupt(format!("u32 field at offset {at} out of bounds")))?;
    Ok(u32::from_be_bytes(field))
}
