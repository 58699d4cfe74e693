//! Split-process child spawning, exit relay, and termination-signal grace.
//!
//! In split-process mode the bundled program runs in a freshly spawned child
//! that shares the parent's process group, so an interactive interrupt from
//! the terminal reaches both processes at once. The parent swallows its own
//! copy and keeps waiting: the child must get the first chance to run its
//! cleanup handlers. Shutdown-class requests are held back for a bounded
//! grace window before the default disposition is allowed to terminate the
//! parent. The window elapses on a dedicated watcher thread; the launch
//! thread stays runnable the whole time, so it reaps the child, relays the
//! exit status, and tears the working directory down while the clock runs.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(unix)]
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use anyhow::{Context, Result};

/// Grace window granted to the child on a shutdown-class request.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

/// What the watcher does with a termination request while the child is
/// running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Consume the signal; the child received its own copy via the process
    /// group and handles it first.
    Swallow,
    /// Let the grace window elapse, then restore the default disposition
    /// and re-raise.
    GraceThenDefault,
}

/// Parent-side disposition for a termination signal, `None` for signals the
/// launcher leaves alone.
pub fn disposition(signo: i32) -> Option<SignalAction> {
    #[cfg(unix)]
    match signo {
        libc::SIGINT | libc::SIGQUIT => Some(SignalAction::Swallow),
        libc::SIGTERM | libc::SIGHUP => Some(SignalAction::GraceThenDefault),
        _ => None,
    }
    #[cfg(not(unix))]
    {
        let _ = signo;
        None
    }
}

/// True while a payload child is running. Signals arriving outside that
/// window behave as if no shield were installed.
static SHIELD_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Pid that armed the running watcher thread. Threads do not survive a
/// fork, so the shield is re-armed whenever the pid changes.
#[cfg(unix)]
static WATCHER_PID: AtomicU32 = AtomicU32::new(0);

/// Spawns `command` with inherited standard streams, shields the parent from
/// termination requests while the child runs, and waits (blocking,
/// unbounded). Returns the child's exit code verbatim; a child killed by
/// signal N is reported as 128+N.
pub fn spawn_and_wait(mut command: Command) -> Result<i32> {
    let _guard = TerminationGuard::engage();

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt as _;
        // The termination signals are blocked on this thread and the mask
        // survives exec; the child must start with them deliverable.
        command.pre_exec(|| {
            let set = guarded_sigset();
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("spawn child process {:?}", command.get_program()))?;
    let status = child.wait().context("wait for child process")?;

    Ok(exit_code_of(status))
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signo) = status.signal() {
            return 128 + signo;
        }
    }
    1
}

#[cfg(unix)]
fn guarded_sigset() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for signo in [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM, libc::SIGHUP] {
            libc::sigaddset(&mut set, signo);
        }
        set
    }
}

/// Arms the signal shield for the duration of one child's lifetime.
///
/// On the first engagement in a process the termination signals are blocked
/// on the calling thread and a watcher thread (which inherits the blocked
/// mask) takes over delivery through `sigwait`. Dropping the guard only
/// clears the active flag; the watcher then hands any later signal straight
/// to its default disposition.
struct TerminationGuard;

impl TerminationGuard {
    fn engage() -> TerminationGuard {
        #[cfg(unix)]
        {
            let pid = std::process::id();
            if WATCHER_PID.swap(pid, Ordering::SeqCst) != pid {
                unsafe {
                    let set = guarded_sigset();
                    libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
                }
                std::thread::spawn(watch_termination);
            }
        }
        SHIELD_ACTIVE.store(true, Ordering::SeqCst);
        TerminationGuard
    }
}

impl Drop for TerminationGuard {
    fn drop(&mut self) {
        SHIELD_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Sole delivery point for the termination signals; shares no launch state
/// with the main thread beyond the active flag.
#[cfg(unix)]
fn watch_termination() {
    let set = guarded_sigset();
    loop {
        let mut signo: libc::c_int = 0;
        if unsafe { libc::sigwait(&set, &mut signo) } != 0 {
            return;
        }
        if !SHIELD_ACTIVE.load(Ordering::SeqCst) {
            resume_default(signo);
            continue;
        }
        match disposition(signo) {
            Some(SignalAction::Swallow) | None => {}
            Some(SignalAction::GraceThenDefault) => {
                // The main thread keeps running while the window elapses:
                // it reaps the child, relays the exit status, and removes
                // the working directory. A process still alive afterwards
                // terminates under the default disposition.
                std::thread::sleep(SHUTDOWN_GRACE);
                resume_default(signo);
            }
        }
    }
}

/// Restores the default disposition for `signo` and re-raises it on this
/// thread, terminating the process.
#[cfg(unix)]
fn resume_default(signo: libc::c_int) {
    unsafe {
        libc::signal(signo, libc::SIG_DFL);
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signo);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
        libc::raise(signo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn interactive_interrupts_are_swallowed() {
        assert_eq!(disposition(libc::SIGINT), Some(SignalAction::Swallow));
        assert_eq!(disposition(libc::SIGQUIT), Some(SignalAction::Swallow));
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_requests_get_a_grace_window() {
        assert_eq!(
            disposition(libc::SIGTERM),
            Some(SignalAction::GraceThenDefault)
        );
        assert_eq!(
            disposition(libc::SIGHUP),
            Some(SignalAction::GraceThenDefault)
        );
        assert_eq!(disposition(libc::SIGUSR1), None);
    }
}
