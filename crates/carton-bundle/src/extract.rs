//! Materializing TOC entries under the working directory.

use std::io::Read as _;
use std::path::{Component, Path, PathBuf};

use crate::error::BundleError;
use crate::format::{TocEntry, Typecode};
use crate::multipkg::ArchivePool;
use crate::reader::Archive;

/// Materializes one TOC entry under `dest_root`.
///
/// Regular binaries, data files, and embedded zip payloads become files;
/// symlink entries become symbolic links; dependency references are resolved
/// through the archive pool against sibling archives next to the running
/// executable (`exe_dir`). Source units, package markers, runtime options,
/// and splash resources are consumed by the launcher and the hosted runtime
/// instead of being written to disk.
///
/// The first failure aborts the caller's extraction pass: a missing file is
/// a harder failure to diagnose once the hosted program is running.
pub fn extract_entry(
    archive: &Archive,
    entry: &TocEntry,
    dest_root: &Path,
    exe_dir: &Path,
    pool: &mut ArchivePool,
) -> Result<(), BundleError> {
    match entry.typecode {
        Typecode::Binary | Typecode::Data | Typecode::ZipPayload => {
            write_file(archive, entry, dest_root)
        }
        Typecode::Symlink => write_symlink(archive, entry, dest_root),
        Typecode::Dependency => extract_dependency(entry, dest_root, exe_dir, pool),
        Typecode::SourceUnit
        | Typecode::PackageMarker
        | Typecode::RuntimeOption
        | Typecode::SplashResource => Ok(()),
    }
}

/// Normalizes an entry name into a relative path that stays inside the
/// extraction root. Absolute names, drive prefixes, and `..` segments are
/// rejected with [`BundleError::UnsafePath`]; `.` segments are dropped.
pub fn sanitize_entry_name(name: &str) -> Result<PathBuf, BundleError> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(BundleError::UnsafePath(name.to_string()));
            }
            Component::ParentDir => {
                return Err(BundleError::UnsafePath(name.to_string()));
            }
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(BundleError::UnsafePath(name.to_string()));
    }
    Ok(out)
}

/// Inflates a zlib-compressed payload. The inflated byte count must equal
/// the declared uncompressed length exactly.
pub(crate) fn decompress(
    payload: &[u8],
    uncompressed_length: u32,
    name: &str,
) -> Result<Vec<u8>, BundleError> {
    let mut out = Vec::with_capacity(uncompressed_length as usize);
    let mut decoder = flate2::read::ZlibDecoder::new(payload);
    decoder
        .read_to_end(&mut out)
        .map_err(|err| BundleError::Corrupt(format!("inflate {name:?}: {err}")))?;
    if out.len() as u64 != u64::from(uncompressed_length) {
        return Err(BundleError::Corrupt(format!(
            "inflated size mismatch for {name:?}: declared {uncompressed_length}, got {}",
            out.len()
        )));
    }
    Ok(out)
}

fn dest_path(dest_root: &Path, name: &str) -> Result<PathBuf, BundleError> {
    Ok(dest_root.join(sanitize_entry_name(name)?))
}

fn write_file(archive: &Archive, entry: &TocEntry, dest_root: &Path) -> Result<(), BundleError> {
    let out_path = dest_path(dest_root, &entry.name)?;
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // The payload is inflated and length-checked in memory before anything
    // is written, and the write itself goes through a temp file + rename,
    // so a failed entry never leaves a partial file at the final path.
    let data = archive.extract_to_memory(entry)?;

    let tmp_path = temp_sibling(&out_path);
    if let Err(err) = write_file_at(&tmp_path, &data, entry.typecode) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err);
    }
    if let Err(err) = std::fs::rename(&tmp_path, &out_path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(BundleError::Io(err));
    }
    Ok(())
}

fn write_file_at(path: &Path, data: &[u8], typecode: Typecode) -> Result<(), BundleError> {
    std::fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let mode = if typecode == Typecode::Binary {
            0o700
        } else {
            0o600
        };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = typecode;
    Ok(())
}

fn temp_sibling(out_path: &Path) -> PathBuf {
    let file_name = out_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "entry".to_string());
    out_path.with_file_name(format!(".{file_name}.carton-{}", std::process::id()))
}

fn write_symlink(archive: &Archive, entry: &TocEntry, dest_root: &Path) -> Result<(), BundleError> {
    let out_path = dest_path(dest_root, &entry.name)?;
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let target_bytes = archive.extract_to_memory(entry)?;
    let target = String::from_utf8(target_bytes).map_err(|_| {
        BundleError::Corrupt(format!("symlink target of {:?} is not UTF-8", entry.name))
    })?;

    // The target is taken as-is and is not required to exist.
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(&target, &out_path)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (target, out_path);
        Err(BundleError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlink entries are not supported on this platform",
        )))
    }
}

fn extract_dependency(
    entry: &TocEntry,
    dest_root: &Path,
    exe_dir: &Path,
    pool: &mut ArchivePool,
) -> Result<(), BundleError> {
    let (package, item) = entry.name.split_once(':').ok_or_else(|| {
        BundleError::Corrupt(format!(
            "malformed dependency reference {:?} (expected \"package:entry\")",
            entry.name
        ))
    })?;

    let dep_archive = pool.resolve(package, exe_dir)?;
    let dep_entry = dep_archive
        .find_entry(item)?
        .ok_or_else(|| BundleError::DependencyNotFound(entry.name.clone()))?;

    match dep_entry.typecode {
        Typecode::Binary | Typecode::Data | Typecode::ZipPayload => {
            write_file(dep_archive, &dep_entry, dest_root)
        }
        Typecode::Symlink => write_symlink(dep_archive, &dep_entry, dest_root),
        other => Err(BundleError::Corrupt(format!(
            "dependency {:?} resolves to non-extractable entry (typecode {:?})",
            entry.name, other
        ))),
    }
}
