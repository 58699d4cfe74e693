//! Ephemeral working-directory lifecycle.
//!
//! The working directory is created before any extraction, with a name that
//! avoids collisions among concurrently running instances of the same bundle
//! and with access restricted to the owning user. It is removed recursively
//! before process exit on every non-crash path, but only by the process
//! that created it (the split-process child inherits the path through the
//! environment and leaves teardown to its parent).

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::trace::trace;

/// Environment variable carrying the working-directory path from the parent
/// to the split-process child. Its presence marks a process as the child.
pub const ENV_WORKDIR: &str = "CARTON_WORKDIR";

/// The system temp-directory preference read (and, for a custom root,
/// temporarily overridden) by the launcher.
pub const ENV_TMPDIR: &str = "TMPDIR";

pub const WORKDIR_PREFIX: &str = "_carton";

/// Bounded retries for the unavoidable race between picking a directory
/// name and creating it.
const CREATE_ATTEMPTS: u32 = 16;

#[derive(Debug)]
pub struct WorkingDirectory {
    path: PathBuf,
    created: bool,
}

impl WorkingDirectory {
    /// Creates a fresh working directory under the system temp root, or
    /// under `custom_root` when configured. The custom root has
    /// environment-style placeholders expanded, is resolved to an absolute
    /// path, and has missing components created tolerantly (the strict
    /// check is the final secure creation below it); while the directory is
    /// being created, the temp-directory preference is rebound to the
    /// custom root and restored before returning on both success and
    /// failure.
    pub fn create(custom_root: Option<&str>) -> Result<WorkingDirectory> {
        let mut override_guard = match custom_root {
            Some(raw) => {
                let root = prepare_custom_root(raw)?;
                Some(TempRootOverride::set(&root))
            }
            None => None,
        };

        let result = create_in_temp_root();
        if let Some(guard) = override_guard.as_mut() {
            guard.restore();
        }
        result
    }

    /// Adopts a working directory created by another process (the parent in
    /// split-process mode). Teardown is not attempted for adopted
    /// directories.
    pub fn adopt(path: PathBuf) -> WorkingDirectory {
        WorkingDirectory {
            path,
            created: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_by_this_process(&self) -> bool {
        self.created
    }

    /// Recursively removes the directory if this process created it. The
    /// walk is best-effort; only failure to remove the top-level directory
    /// itself is surfaced.
    pub fn remove(&mut self) -> Result<()> {
        if !self.created {
            return Ok(());
        }
        self.created = false;
        trace(format!("removing working directory {}", self.path.display()));
        remove_tree(&self.path)
            .with_context(|| format!("remove working directory {}", self.path.display()))
    }
}

fn create_in_temp_root() -> Result<WorkingDirectory> {
    let temp_root = std::env::temp_dir();
    let pid = std::process::id();

    let mut last_error = None;
    for attempt in 0..CREATE_ATTEMPTS {
        let candidate = temp_root.join(format!(
            "{WORKDIR_PREFIX}{pid}-{nonce:08x}",
            nonce = name_nonce(attempt)
        ));
        match make_secure_dir(&candidate) {
            Ok(()) => {
                trace(format!("created working directory {}", candidate.display()));
                return Ok(WorkingDirectory {
                    path: candidate,
                    created: true,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                last_error = Some(err);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("create working directory {}", candidate.display())
                });
            }
        }
    }

    Err(anyhow::anyhow!(
        "cannot create a working directory under {} after {CREATE_ATTEMPTS} attempts: {}",
        temp_root.display(),
        last_error.map_or_else(|| "no candidate available".to_string(), |e| e.to_string())
    ))
}

/// Mixes the clock into candidate names so concurrently launched instances
/// of the same bundle do not collide on the pid alone.
fn name_nonce(attempt: u32) -> u32 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ std::process::id().rotate_left(16) ^ attempt
}

/// Creates a directory readable, writable, and searchable by the owning user
/// only.
fn make_secure_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt as _;
        std::fs::DirBuilder::new().mode(0o700).create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir(path)
    }
}

fn prepare_custom_root(raw: &str) -> Result<PathBuf> {
    let expanded = expand_placeholders(raw);
    let path = PathBuf::from(&expanded);
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .context("resolve current directory for custom working-directory root")?
            .join(path)
    };

    // Intermediate components are created tolerantly, with default shared
    // permissions; a genuinely unusable root shows up when the secure
    // per-run directory is created beneath it.
    let mut accumulated = PathBuf::new();
    for component in path.components() {
        accumulated.push(component);
        if accumulated.parent().is_some() {
            let _ = std::fs::create_dir(&accumulated);
        }
    }

    Ok(path)
}

/// Expands `~` (leading), `$NAME`, and `${NAME}` placeholders. Placeholders
/// naming unset variables are left untouched.
pub fn expand_placeholders(raw: &str) -> String {
    let mut input = raw;
    let mut out = String::with_capacity(raw.len());

    if input == "~" || input.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            out.push_str(&home);
            input = &input[1..];
        }
    }

    let mut chars = input.char_indices().peekable();
    while let Some((at, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        let rest = &input[at + 1..];
        // The skip advances a char iterator, so it is counted in characters;
        // a braced name may contain multibyte characters.
        let (name, skip) = if let Some(inner) = rest.strip_prefix('{') {
            match inner.find('}') {
                Some(end) => (&inner[..end], inner[..end].chars().count() + 2),
                None => ("", 0),
            }
        } else {
            let end = rest
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(rest.len());
            (&rest[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => {
                out.push_str(&value);
                for _ in 0..skip {
                    chars.next();
                }
            }
            _ => out.push('$'),
        }
    }

    out
}

/// Restores the previous temp-directory preference when dropped or
/// explicitly restored, whichever comes first.
#[derive(Debug)]
pub struct TempRootOverride {
    previous: Option<OsString>,
    restored: bool,
}

impl TempRootOverride {
    pub fn set(root: &Path) -> TempRootOverride {
        let previous = std::env::var_os(ENV_TMPDIR);
        std::env::set_var(ENV_TMPDIR, root);
        TempRootOverride {
            previous,
            restored: false,
        }
    }

    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        match self.previous.take() {
            Some(previous) => std::env::set_var(ENV_TMPDIR, previous),
            None => std::env::remove_var(ENV_TMPDIR),
        }
    }
}

impl Drop for TempRootOverride {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Recursive removal. Symbolic links, including links to directories, are
/// unlinked, never descended, so a link pointing outside the tree cannot
/// pull its target into the walk. Per-entry failures are tolerated; the
/// final removal of `root` itself is the one call whose failure is
/// surfaced.
pub fn remove_tree(root: &Path) -> std::io::Result<()> {
    remove_tree_contents(root);
    std::fs::remove_dir(root)
}

fn remove_tree_contents(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if metadata.file_type().is_dir() {
            remove_tree_contents(&path);
            let _ = std::fs::remove_dir(&path);
        } else {
            let _ = std::fs::remove_file(&path);
        }
    }
}
