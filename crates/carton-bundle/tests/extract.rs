mod common;

use std::path::Path;

use carton_bundle::{
    extract_entry, Archive, ArchivePool, ArchiveWriter, BundleError, Typecode,
};
use common::{create_temp_dir, rm_rf};

fn open_archive(dir: &Path, name: &str, writer: ArchiveWriter) -> Archive {
    let path = dir.join(name);
    writer.write_to(&path).expect("write archive");
    Archive::open(&path).expect("open archive")
}

fn extract_all(archive: &Archive, dest_root: &Path, exe_dir: &Path) -> Result<(), BundleError> {
    let mut pool = ArchivePool::new();
    for entry in archive.toc_entries() {
        let entry = entry?;
        extract_entry(archive, &entry, dest_root, exe_dir, &mut pool)?;
    }
    Ok(())
}

#[test]
fn extracts_files_under_the_destination_root() {
    let dir = create_temp_dir("carton_extract_basic");
    let dest = dir.join("work");
    std::fs::create_dir(&dest).expect("mkdir");

    let mut writer = ArchiveWriter::new();
    writer.add_entry(Typecode::Data, "data/config.toml", b"key = 1\n");
    writer.add_compressed_entry(Typecode::Binary, "lib/native.so", &[0x7f; 2048]);
    let archive = open_archive(&dir, "app.pkg", writer);

    extract_all(&archive, &dest, &dir).expect("extract");

    let config = dest.join("data/config.toml");
    assert_eq!(std::fs::read(&config).expect("read"), b"key = 1\n");
    let native = dest.join("lib/native.so");
    assert_eq!(std::fs::read(&native).expect("read"), vec![0x7f; 2048]);

    // Canonical paths stay inside the working directory.
    let canonical = config.canonicalize().expect("canonicalize");
    assert!(canonical.starts_with(dest.canonicalize().expect("canonicalize root")));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let mode = std::fs::metadata(&native).expect("stat").permissions().mode();
        assert_ne!(mode & 0o100, 0, "binary entries get exec bits");
    }

    rm_rf(&dir);
}

#[test]
fn unsafe_names_extract_nothing() {
    let dir = create_temp_dir("carton_extract_unsafe");
    let dest = dir.join("work");
    std::fs::create_dir(&dest).expect("mkdir");

    for name in ["../escape.txt", "/abs.txt", "a/../../b.txt"] {
        let mut writer = ArchiveWriter::new();
        writer.add_entry(Typecode::Data, name, b"evil");
        let archive = open_archive(&dir, "bad.pkg", writer);

        let err = extract_all(&archive, &dest, &dir).expect_err("must fail");
        assert!(matches!(err, BundleError::UnsafePath(_)), "{name}: {err}");

        // Nothing may appear outside (or inside) the destination root.
        assert_eq!(std::fs::read_dir(&dest).expect("read_dir").count(), 0);
        assert!(!dir.join("escape.txt").exists());
        assert!(!dir.join("b.txt").exists());
    }

    rm_rf(&dir);
}

#[test]
fn corrupt_compressed_entry_leaves_no_partial_file() {
    let dir = create_temp_dir("carton_extract_corrupt");
    let dest = dir.join("work");
    std::fs::create_dir(&dest).expect("mkdir");

    let mut writer = ArchiveWriter::new();
    writer.add_compressed_entry(Typecode::Data, "big.bin", &[42u8; 4096]);
    let path = dir.join("app.pkg");
    let mut bytes = writer.finish();

    // Lie about the uncompressed length (field at offset 12 of the record,
    // which begins right after the compressed data region).
    let archive_len = bytes.len();
    let toc_len = u32::from_be_bytes(
        bytes[archive_len - 68..archive_len - 64].try_into().expect("toc_length field"),
    ) as usize;
    let record_start = archive_len - 88 - toc_len;
    bytes[record_start + 12..record_start + 16].copy_from_slice(&1u32.to_be_bytes());
    std::fs::write(&path, &bytes).expect("write");

    let archive = Archive::open(&path).expect("open");
    let err = extract_all(&archive, &dest, &dir).expect_err("must fail");
    assert!(matches!(err, BundleError::Corrupt(_)));

    // Neither the final file nor a temp file survives.
    assert_eq!(std::fs::read_dir(&dest).expect("read_dir").count(), 0);

    rm_rf(&dir);
}

#[cfg(unix)]
#[test]
fn symlink_entries_become_links_with_unvalidated_targets() {
    let dir = create_temp_dir("carton_extract_symlink");
    let dest = dir.join("work");
    std::fs::create_dir(&dest).expect("mkdir");

    let mut writer = ArchiveWriter::new();
    writer.add_entry(Typecode::Symlink, "lib/current", b"../does-not-exist");
    let archive = open_archive(&dir, "app.pkg", writer);

    extract_all(&archive, &dest, &dir).expect("extract");

    let link = dest.join("lib/current");
    let target = std::fs::read_link(&link).expect("read_link");
    assert_eq!(target, Path::new("../does-not-exist"));

    rm_rf(&dir);
}

#[test]
fn dependency_references_pull_from_sibling_archives() {
    let dir = create_temp_dir("carton_extract_dep");
    let dest = dir.join("work");
    std::fs::create_dir(&dest).expect("mkdir");

    // The shared sibling archive, named by the fixed convention.
    let mut shared = ArchiveWriter::new();
    shared.add_compressed_entry(Typecode::Binary, "common/engine.so", &[9u8; 512]);
    shared.write_to(&dir.join("base.pkg")).expect("write sibling");

    let mut writer = ArchiveWriter::new();
    writer.add_entry(Typecode::Dependency, "base:common/engine.so", b"");
    let archive = open_archive(&dir, "app.pkg", writer);

    extract_all(&archive, &dest, &dir).expect("extract");
    assert_eq!(
        std::fs::read(dest.join("common/engine.so")).expect("read"),
        vec![9u8; 512]
    );

    rm_rf(&dir);
}

#[test]
fn missing_dependency_aborts_the_pass() {
    let dir = create_temp_dir("carton_extract_dep_missing");
    let dest = dir.join("work");
    std::fs::create_dir(&dest).expect("mkdir");

    let mut writer = ArchiveWriter::new();
    writer.add_entry(Typecode::Dependency, "ghost:thing.bin", b"");
    writer.add_entry(Typecode::Data, "after.txt", b"never written");
    let archive = open_archive(&dir, "app.pkg", writer);

    let err = extract_all(&archive, &dest, &dir).expect_err("must fail");
    assert!(matches!(err, BundleError::DependencyNotFound(_)));
    assert!(!dest.join("after.txt").exists(), "fail-fast, no partial-then-continue");

    rm_rf(&dir);
}

#[test]
fn non_extractable_entries_write_nothing() {
    let dir = create_temp_dir("carton_extract_skip");
    let dest = dir.join("work");
    std::fs::create_dir(&dest).expect("mkdir");

    let mut writer = ArchiveWriter::new();
    writer.add_entry(Typecode::SourceUnit, "main", b"unit body");
    writer.add_entry(Typecode::RuntimeOption, "disable-traceback", b"");
    writer.add_entry(Typecode::PackageMarker, "pkg.marker", b"");
    writer.add_entry(Typecode::SplashResource, "splash.png", b"\x89PNG");
    let archive = open_archive(&dir, "app.pkg", writer);

    extract_all(&archive, &dest, &dir).expect("extract");
    assert_eq!(std::fs::read_dir(&dest).expect("read_dir").count(), 0);

    rm_rf(&dir);
}
