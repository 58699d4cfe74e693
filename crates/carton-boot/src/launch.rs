//! The launch state machine.
//!
//! One linear pass with early exit on error at every step:
//! open archive → parse options → create working directory → extract →
//! (split-process) spawn child and relay its exit status, or (in-process)
//! bind symbols → start runtime → import bootstrap modules → install
//! payloads → run program units. Cleanup runs unconditionally regardless of
//! which step failed.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use carton_bundle::{extract_entry, Archive, ArchivePool, BundleError, Typecode};
use carton_runtime::{HostedFailure, RuntimeApi, RuntimeError};

use crate::options::{parse_runtime_options, RuntimeOptions};
use crate::spawn;
use crate::trace::trace;
use crate::workdir::{WorkingDirectory, ENV_WORKDIR};

pub const EXIT_OK: u8 = 0;
/// The bundled program raised an unhandled error.
pub const EXIT_HOSTED_FAILURE: u8 = 1;
/// The bundle itself is broken (archive, extraction, working directory,
/// symbol resolution, or spawn failed).
pub const EXIT_BOOTSTRAP_FAILURE: u8 = 2;

/// Launch inputs owned by the process boundary (the launcher itself takes
/// no command-line options; argv belongs to the bundled program).
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub executable: PathBuf,
    /// Original invocation arguments, forwarded to the child in
    /// split-process mode and to the hosted runtime otherwise.
    pub args: Vec<String>,
    /// Set in the split-process child: the working directory the parent
    /// already populated. The child never removes it.
    pub inherited_workdir: Option<PathBuf>,
}

struct LaunchContext {
    config: LaunchConfig,
    options: RuntimeOptions,
    archive: Archive,
    pool: ArchivePool,
    workdir: Option<WorkingDirectory>,
    /// Present once entry points are resolved; gates whether teardown may
    /// call into the hosted runtime.
    runtime: Option<RuntimeApi>,
}

/// Runs the whole launch sequence and returns the process exit code.
pub fn run(config: LaunchConfig) -> u8 {
    let mut ctx = match prepare(config) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("carton-boot: fatal: {err:#}");
            return EXIT_BOOTSTRAP_FAILURE;
        }
    };

    let code = match launch(&mut ctx) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("carton-boot: fatal: {err:#}");
            EXIT_BOOTSTRAP_FAILURE
        }
    };

    // Teardown failures are reported but never change the exit code; the
    // primary result is already determined by this point.
    cleanup(&mut ctx);
    code
}

fn prepare(config: LaunchConfig) -> Result<LaunchContext> {
    let archive = Archive::open_for_executable(&config.executable)
        .with_context(|| format!("open bundle archive for {}", config.executable.display()))?;
    trace(format!("opened archive {}", archive.path().display()));
    let options = parse_runtime_options(&archive).context("parse runtime options")?;

    Ok(LaunchContext {
        config,
        options,
        archive,
        pool: ArchivePool::new(),
        workdir: None,
        runtime: None,
    })
}

fn launch(ctx: &mut LaunchContext) -> Result<u8> {
    if let Some(inherited) = ctx.config.inherited_workdir.clone() {
        // Split-process child: the parent extracted everything already.
        trace(format!("child mode, working directory {}", inherited.display()));
        ctx.workdir = Some(WorkingDirectory::adopt(inherited.clone()));
        return run_in_process(ctx, &inherited);
    }

    if archive_needs_extraction(&ctx.archive)? {
        // Split-process parent.
        let workdir = WorkingDirectory::create(ctx.options.runtime_tmpdir.as_deref())
            .context("create working directory")?;
        let dest_root = workdir.path().to_path_buf();
        ctx.workdir = Some(workdir);

        let exe_dir = executable_dir(&ctx.config.executable)?;
        extract_archive_files(&ctx.archive, &mut ctx.pool, &dest_root, &exe_dir)
            .context("extract bundle archive")?;

        return spawn_child(ctx, &dest_root);
    }

    // Nothing to extract: run in place, rooted at the bundle directory.
    let home = executable_dir(&ctx.config.executable)?;
    run_in_process(ctx, &home)
}

fn executable_dir(executable: &Path) -> Result<PathBuf> {
    executable
        .parent()
        .map(Path::to_path_buf)
        .with_context(|| format!("executable {} has no parent directory", executable.display()))
}

fn archive_needs_extraction(archive: &Archive) -> Result<bool, BundleError> {
    for entry in archive.toc_entries() {
        if entry?.typecode.is_extractable() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Drives the extraction engine over the TOC in file order. The first
/// failure aborts the pass.
pub fn extract_archive_files(
    archive: &Archive,
    pool: &mut ArchivePool,
    dest_root: &Path,
    exe_dir: &Path,
) -> Result<(), BundleError> {
    for entry in archive.toc_entries() {
        let entry = entry?;
        if !entry.typecode.is_extractable() {
            continue;
        }
        trace(format!("extracting {:?}", entry.name));
        extract_entry(archive, &entry, dest_root, exe_dir, pool)?;
    }
    Ok(())
}

fn spawn_child(ctx: &mut LaunchContext, workdir: &Path) -> Result<u8> {
    let mut command = Command::new(&ctx.config.executable);
    command.args(&ctx.config.args);
    command.env(ENV_WORKDIR, workdir);

    trace("spawning payload child process");
    let code = spawn::spawn_and_wait(command)?;
    trace(format!("child exited with status {code}"));
    Ok(code.clamp(0, 255) as u8)
}

fn run_in_process(ctx: &mut LaunchContext, home: &Path) -> Result<u8> {
    // SymbolsBound
    let lib_name = ctx.archive.runtime_lib().to_string();
    if lib_name.is_empty() {
        anyhow::bail!("bundle archive does not name a runtime library");
    }
    let lib_path = home.join(&lib_name);
    trace(format!("binding runtime entry points from {}", lib_path.display()));
    let mut runtime = RuntimeApi::load(&lib_path).context("bind runtime entry points")?;

    // RuntimeStarted
    runtime.initialize(home).context("start hosted runtime")?;

    // BootstrapModulesImported
    runtime
        .import_bootstrap()
        .context("import bootstrap modules")?;
    let mut argv = Vec::with_capacity(ctx.config.args.len() + 1);
    argv.push(ctx.config.executable.display().to_string());
    argv.extend(ctx.config.args.iter().cloned());
    runtime.set_argv(&argv).context("hand argv to runtime")?;

    // PayloadInstalled
    install_payloads(&ctx.archive, &runtime, home).context("install module-store payloads")?;

    // From here on teardown is allowed to call into the runtime.
    let runtime = &*ctx.runtime.insert(runtime);

    // Running
    let want_traceback = !ctx.options.disable_traceback;
    for entry in ctx.archive.toc_entries() {
        let entry = entry?;
        if entry.typecode != Typecode::SourceUnit {
            continue;
        }
        let data = ctx.archive.extract_to_memory(&entry)?;
        trace(format!("running unit {:?}", entry.name));
        match runtime.run_unit(&entry.name, &data, want_traceback) {
            Ok(()) => {}
            Err(RuntimeError::Hosted(failure)) => {
                report_hosted_failure(&failure, ctx.options.disable_traceback);
                // Remaining units are not executed once one fails.
                return Ok(EXIT_HOSTED_FAILURE);
            }
            // Anything else is a launcher-side problem, not the program's.
            Err(err) => {
                return Err(err).with_context(|| format!("run unit {:?}", entry.name));
            }
        }
    }

    Ok(EXIT_OK)
}

/// Registers every embedded-zip payload with the runtime: as a plain file
/// path when the extraction pass materialized it under `home`, otherwise as
/// a `path?offset:length` locator into the archive itself.
fn install_payloads(archive: &Archive, runtime: &RuntimeApi, home: &Path) -> Result<()> {
    for entry in archive.toc_entries() {
        let entry = entry?;
        if entry.typecode != Typecode::ZipPayload {
            continue;
        }
        let extracted = match carton_bundle::sanitize_entry_name(&entry.name) {
            Ok(rel) => home.join(rel),
            Err(err) => return Err(err.into()),
        };
        let locator = if extracted.is_file() {
            extracted.display().to_string()
        } else {
            let (offset, length) = archive.payload_location(&entry);
            format!("{}?{offset}:{length}", archive.path().display())
        };
        trace(format!("installing payload {locator}"));
        runtime.add_payload(&locator)?;
    }
    Ok(())
}

fn report_hosted_failure(failure: &HostedFailure, traceback_disabled: bool) {
    eprintln!(
        "carton-boot: failed to execute unit {:?} due to unhandled error: {}",
        failure.unit, failure.message
    );
    if traceback_disabled {
        eprintln!("carton-boot: traceback is disabled via bundle option");
    } else if let Some(traceback) = &failure.traceback {
        eprintln!("{traceback}");
    }
}

fn cleanup(ctx: &mut LaunchContext) {
    if let Some(runtime) = ctx.runtime.as_mut() {
        runtime.finalize();
    }
    ctx.pool.release_all();
    ctx.archive.close();
    if let Some(workdir) = ctx.workdir.as_mut() {
        if let Err(err) = workdir.remove() {
            eprintln!("carton-boot: cleanup: {err:#}");
        }
    }
}
