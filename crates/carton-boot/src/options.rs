//! Runtime options embedded in the archive.
//!
//! Option strings ride in the *name* field of runtime-option TOC records;
//! they configure the bootstrap itself, not the bundled program. Unknown
//! options are ignored (newer packing tools may emit options an older
//! launcher does not know).

use carton_bundle::{Archive, BundleError, Typecode};

use crate::trace::trace;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Custom root for the working directory (`runtime-tmpdir <path>`).
    pub runtime_tmpdir: Option<String>,
    /// Suppress hosted-program tracebacks in failure reports
    /// (`disable-traceback`).
    pub disable_traceback: bool,
}

/// Scans the TOC for runtime-option records. Runs before extraction so the
/// working-directory root is known in time.
pub fn parse_runtime_options(archive: &Archive) -> Result<RuntimeOptions, BundleError> {
    let mut options = RuntimeOptions::default();
    for entry in archive.toc_entries() {
        let entry = entry?;
        if entry.typecode == Typecode::RuntimeOption {
            apply_option_line(&mut options, &entry.name);
        }
    }
    Ok(options)
}

pub fn apply_option_line(options: &mut RuntimeOptions, line: &str) {
    let line = line.trim();
    if let Some(path) = line.strip_prefix("runtime-tmpdir ") {
        options.runtime_tmpdir = Some(path.trim().to_string());
    } else if line == "disable-traceback" {
        options.disable_traceback = true;
    } else if !line.is_empty() {
        trace(format!("ignoring unknown runtime option {line:?}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_runtime_tmpdir() {
        let mut options = RuntimeOptions::default();
        apply_option_line(&mut options, "runtime-tmpdir /var/tmp/app ");
        assert_eq!(options.runtime_tmpdir.as_deref(), Some("/var/tmp/app"));
        assert!(!options.disable_traceback);
    }

    #[test]
    fn parses_disable_traceback() {
        let mut options = RuntimeOptions::default();
        apply_option_line(&mut options, "disable-traceback");
        assert!(options.disable_traceback);
    }

    #[test]
    fn unknown_options_are_ignored() {
        let mut options = RuntimeOptions::default();
        apply_option_line(&mut options, "some-future-knob 42");
        assert_eq!(options, RuntimeOptions::default());
    }
}
