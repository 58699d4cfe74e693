//! Bootstrap launcher for carton bundles.
//!
//! The binary in `main.rs` drives a linear launch sequence: open the primary
//! archive, parse runtime options, create the ephemeral working directory,
//! extract the TOC, and either spawn a child process for the payload
//! (split-process mode) or bind the hosted runtime's entry points and run
//! the bundled program units in-process. Cleanup runs on every exit path.

pub mod launch;
pub mod options;
pub mod spawn;
pub mod trace;
pub mod workdir;
