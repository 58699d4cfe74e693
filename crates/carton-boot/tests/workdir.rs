use std::path::PathBuf;
use std::sync::Mutex;

use carton_boot::workdir::{expand_placeholders, WorkingDirectory, ENV_TMPDIR, WORKDIR_PREFIX};

// Creation reads the process-wide temp-directory preference and one test
// rebinds it, so every test here serializes on the lock.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn create_temp_dir(prefix: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let base = std::env::temp_dir();
    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("{prefix}_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return path;
        }
    }
    panic!("failed to create temp dir under {}", base.display());
}

fn rm_rf(path: &std::path::Path) {
    let _ = std::fs::remove_dir_all(path);
}

#[test]
fn create_and_remove_roundtrip() {
    let _lock = ENV_LOCK.lock().unwrap();
    let mut workdir = WorkingDirectory::create(None).expect("create");
    let path = workdir.path().to_path_buf();

    assert!(path.is_dir());
    assert!(workdir.created_by_this_process());
    let name = path.file_name().expect("name").to_string_lossy().into_owned();
    assert!(name.starts_with(WORKDIR_PREFIX));
    assert!(name.contains(&std::process::id().to_string()));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let mode = std::fs::metadata(&path).expect("stat").permissions().mode();
        assert_eq!(mode & 0o777, 0o700, "restricted to the owning user");
    }

    workdir.remove().expect("remove");
    assert!(!path.exists());
}

#[test]
fn concurrent_instances_get_distinct_directories() {
    let _lock = ENV_LOCK.lock().unwrap();
    let mut first = WorkingDirectory::create(None).expect("first");
    let mut second = WorkingDirectory::create(None).expect("second");
    assert_ne!(first.path(), second.path());
    first.remove().expect("remove first");
    second.remove().expect("remove second");
}

#[test]
fn removal_handles_nested_trees_and_outward_symlinks() {
    let _lock = ENV_LOCK.lock().unwrap();
    let outside = create_temp_dir("carton_wd_outside");
    let target = outside.join("keep.txt");
    std::fs::write(&target, b"survives").expect("write target");

    let mut workdir = WorkingDirectory::create(None).expect("create");
    let root = workdir.path().to_path_buf();
    std::fs::create_dir_all(root.join("a/b/c")).expect("nest");
    std::fs::write(root.join("a/b/c/file.bin"), b"x").expect("write");

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(&outside, root.join("a/link-to-outside"))
            .expect("symlink dir");
        std::os::unix::fs::symlink(&target, root.join("link-to-file")).expect("symlink file");
    }

    workdir.remove().expect("remove");
    assert!(!root.exists());
    // The symlink itself was removed; its target was never descended into.
    assert!(target.exists());
    assert_eq!(std::fs::read(&target).expect("read"), b"survives");

    rm_rf(&outside);
}

#[test]
fn adopted_directories_are_not_torn_down() {
    let _lock = ENV_LOCK.lock().unwrap();
    let dir = create_temp_dir("carton_wd_adopted");
    let mut workdir = WorkingDirectory::adopt(dir.clone());
    assert!(!workdir.created_by_this_process());
    workdir.remove().expect("no-op remove");
    assert!(dir.is_dir(), "the parent owns teardown, not the child");
    rm_rf(&dir);
}

#[test]
fn custom_root_is_created_and_tmpdir_preference_restored() {
    let _lock = ENV_LOCK.lock().unwrap();
    let base = create_temp_dir("carton_wd_custom");
    let previous_tmpdir = std::env::var_os(ENV_TMPDIR);

    // Several components of the custom root do not exist yet.
    let custom = base.join("deep/nested/root");
    let mut workdir =
        WorkingDirectory::create(Some(custom.to_str().expect("utf-8"))).expect("create");

    assert!(workdir.path().starts_with(&custom));
    assert_eq!(
        std::env::var_os(ENV_TMPDIR),
        previous_tmpdir,
        "temp-directory preference restored after creation"
    );

    workdir.remove().expect("remove");
    assert!(custom.is_dir(), "the custom root itself is left in place");
    rm_rf(&base);
}

#[test]
fn custom_root_expands_environment_placeholders() {
    let _lock = ENV_LOCK.lock().unwrap();
    let base = create_temp_dir("carton_wd_expand");
    std::env::set_var("CARTON_TEST_ROOT", &base);

    let mut workdir =
        WorkingDirectory::create(Some("${CARTON_TEST_ROOT}/spot")).expect("create");
    assert!(workdir.path().starts_with(base.join("spot")));
    workdir.remove().expect("remove");

    std::env::remove_var("CARTON_TEST_ROOT");
    rm_rf(&base);
}

#[test]
fn placeholder_expansion_rules() {
    let _lock = ENV_LOCK.lock().unwrap();
    std::env::set_var("CARTON_TEST_VAR", "value");

    assert_eq!(expand_placeholders("/a/$CARTON_TEST_VAR/b"), "/a/value/b");
    assert_eq!(expand_placeholders("/a/${CARTON_TEST_VAR}b"), "/a/valueb");
    assert_eq!(
        expand_placeholders("/a/$CARTON_TEST_UNSET/b"),
        "/a/$CARTON_TEST_UNSET/b",
        "unset placeholders are left untouched"
    );

    if let Ok(home) = std::env::var("HOME") {
        assert_eq!(expand_placeholders("~/x"), format!("{home}/x"));
    }

    std::env::remove_var("CARTON_TEST_VAR");
}

#[test]
fn braced_placeholders_with_multibyte_names_expand_cleanly() {
    let _lock = ENV_LOCK.lock().unwrap();
    std::env::set_var("CARTON_TEST_CAFÉ", "mocha");

    assert_eq!(expand_placeholders("/a/${CARTON_TEST_CAFÉ}/b"), "/a/mocha/b");

    std::env::remove_var("CARTON_TEST_CAFÉ");
}
