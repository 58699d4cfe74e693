//! Dynamic binding of the hosted runtime's embedding API.
//!
//! The hosted language runtime is an opaque shared library exposing a small,
//! versioned set of C entry points. They are resolved by name at launch
//! through one generic lookup routine into a struct of typed function
//! handles; a missing required entry point is fatal, optional ones degrade
//! gracefully.

use std::ffi::{c_char, c_int, CStr, CString};
use std::path::Path;

use libloading::Library;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to load runtime library {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: libloading::Error,
    },

    #[error("runtime library is missing required entry point {0:?}")]
    MissingSymbol(&'static str),

    #[error("runtime initialization failed (status {0})")]
    InitFailed(c_int),

    #[error("runtime rejected {what}: status {status}")]
    CallFailed { what: String, status: c_int },

    #[error("embedded NUL byte in {0:?}")]
    BadString(String),

    #[error("unhandled failure in unit {:?}: {}", .0.unit, .0.message)]
    Hosted(Box<HostedFailure>),
}

/// An unhandled failure reported by the hosted runtime while evaluating a
/// program unit. The traceback is absent when the runtime does not expose
/// one or when traceback visibility is disabled.
#[derive(Debug)]
pub struct HostedFailure {
    pub unit: String,
    pub message: String,
    pub traceback: Option<String>,
}

type InitFn = unsafe extern "C" fn(home: *const c_char) -> c_int;
type BootstrapFn = unsafe extern "C" fn() -> c_int;
type SetArgvFn = unsafe extern "C" fn(argc: c_int, argv: *const *const c_char) -> c_int;
type AddPayloadFn = unsafe extern "C" fn(locator: *const c_char) -> c_int;
type RunUnitFn = unsafe extern "C" fn(name: *const c_char, data: *const u8, len: usize) -> c_int;
type MessageFn = unsafe extern "C" fn() -> *const c_char;
type FinalizeFn = unsafe extern "C" fn() -> c_int;

const SYM_INITIALIZE: &str = "rt_initialize";
const SYM_BOOTSTRAP: &str = "rt_bootstrap";
const SYM_SET_ARGV: &str = "rt_set_argv";
const SYM_ADD_PAYLOAD: &str = "rt_add_payload";
const SYM_RUN_UNIT: &str = "rt_run_unit";
const SYM_ERROR_MESSAGE: &str = "rt_error_message";
const SYM_ERROR_TRACEBACK: &str = "rt_error_traceback";
const SYM_FINALIZE: &str = "rt_finalize";

/// Resolved entry-point table of the hosted runtime.
///
/// The struct owns the loaded library; the function handles are plain
/// pointers copied out of the resolved symbols and stay valid for the
/// struct's lifetime.
pub struct RuntimeApi {
    _lib: Library,
    init: InitFn,
    run_unit: RunUnitFn,
    error_message: MessageFn,
    finalize: FinalizeFn,
    bootstrap: Option<BootstrapFn>,
    set_argv: Option<SetArgvFn>,
    add_payload: Option<AddPayloadFn>,
    error_traceback: Option<MessageFn>,
    started: bool,
}

impl std::fmt::Debug for RuntimeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeApi")
            .field("started", &self.started)
            .field("has_traceback", &self.error_traceback.is_some())
            .finish()
    }
}

fn required<T: Copy + 'static>(lib: &Library, name: &'static str) -> Result<T, RuntimeError> {
    let symbol = unsafe { lib.get::<T>(name.as_bytes()) }
        .map_err(|_| RuntimeError::MissingSymbol(name))?;
    Ok(*symbol)
}

fn optional<T: Copy + 'static>(lib: &Library, name: &'static str) -> Option<T> {
    unsafe { lib.get::<T>(name.as_bytes()) }.ok().map(|s| *s)
}

impl RuntimeApi {
    /// Opens the shared library at `path` and resolves the entry-point
    /// table. Any missing required symbol is fatal.
    pub fn load(path: &Path) -> Result<RuntimeApi, RuntimeError> {
        let lib = unsafe { Library::new(path) }.map_err(|source| RuntimeError::Load {
            path: path.display().to_string(),
            source,
        })?;

        let init = required::<InitFn>(&lib, SYM_INITIALIZE)?;
        let run_unit = required::<RunUnitFn>(&lib, SYM_RUN_UNIT)?;
        let error_message = required::<MessageFn>(&lib, SYM_ERROR_MESSAGE)?;
        let finalize = required::<FinalizeFn>(&lib, SYM_FINALIZE)?;

        let bootstrap = optional::<BootstrapFn>(&lib, SYM_BOOTSTRAP);
        let set_argv = optional::<SetArgvFn>(&lib, SYM_SET_ARGV);
        let add_payload = optional::<AddPayloadFn>(&lib, SYM_ADD_PAYLOAD);
        let error_traceback = optional::<MessageFn>(&lib, SYM_ERROR_TRACEBACK);

        Ok(RuntimeApi {
            _lib: lib,
            init,
            run_unit,
            error_message,
            finalize,
            bootstrap,
            set_argv,
            add_payload,
            error_traceback,
            started: false,
        })
    }

    /// Initializes the runtime rooted at `home` (the working directory in
    /// split-process mode, the bundle directory otherwise).
    pub fn initialize(&mut self, home: &Path) -> Result<(), RuntimeError> {
        let home = path_to_cstring(home)?;
        let status = unsafe { (self.init)(home.as_ptr()) };
        if status != 0 {
            return Err(RuntimeError::InitFailed(status));
        }
        self.started = true;
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Imports the runtime's bootstrap support modules, if the runtime
    /// exposes that step.
    pub fn import_bootstrap(&self) -> Result<(), RuntimeError> {
        if let Some(bootstrap) = self.bootstrap {
            let status = unsafe { bootstrap() };
            if status != 0 {
                return Err(RuntimeError::CallFailed {
                    what: "bootstrap module import".to_string(),
                    status,
                });
            }
        }
        Ok(())
    }

    /// Forwards the original process arguments to the runtime, if supported.
    pub fn set_argv(&self, args: &[String]) -> Result<(), RuntimeError> {
        let Some(set_argv) = self.set_argv else {
            return Ok(());
        };
        let storage: Vec<CString> = args
            .iter()
            .map(|arg| {
                CString::new(arg.as_bytes()).map_err(|_| RuntimeError::BadString(arg.clone()))
            })
            .collect::<Result<_, _>>()?;
        let pointers: Vec<*const c_char> = storage.iter().map(|s| s.as_ptr()).collect();
        let status = unsafe { set_argv(pointers.len() as c_int, pointers.as_ptr()) };
        if status != 0 {
            return Err(RuntimeError::CallFailed {
                what: "argv handoff".to_string(),
                status,
            });
        }
        Ok(())
    }

    /// Registers a module-store payload location with the runtime, if
    /// supported. The locator is either a plain file path or
    /// `"<path>?<offset>:<length>"` for a payload embedded in an archive.
    pub fn add_payload(&self, locator: &str) -> Result<(), RuntimeError> {
        let Some(add_payload) = self.add_payload else {
            return Ok(());
        };
        let locator_c = CString::new(locator.as_bytes())
            .map_err(|_| RuntimeError::BadString(locator.to_string()))?;
        let status = unsafe { add_payload(locator_c.as_ptr()) };
        if status != 0 {
            return Err(RuntimeError::CallFailed {
                what: format!("payload registration ({locator})"),
                status,
            });
        }
        Ok(())
    }

    /// Evaluates one program source unit. A nonzero status is an unhandled
    /// failure of the hosted program, surfaced as [`RuntimeError::Hosted`];
    /// the message (and, when available and wanted, the traceback) is
    /// captured from the runtime's error indicator.
    pub fn run_unit(
        &self,
        name: &str,
        data: &[u8],
        want_traceback: bool,
    ) -> Result<(), RuntimeError> {
        let name_c = unit_name_cstring(name)?;
        let status = unsafe { (self.run_unit)(name_c.as_ptr(), data.as_ptr(), data.len()) };
        if status == 0 {
            return Ok(());
        }

        let message = unsafe { cstr_to_string((self.error_message)()) }
            .unwrap_or_else(|| format!("hosted runtime returned status {status}"));
        let traceback = if want_traceback {
            self.error_traceback
                .and_then(|traceback| unsafe { cstr_to_string(traceback()) })
        } else {
            None
        };

        Err(RuntimeError::Hosted(Box::new(HostedFailure {
            unit: name.to_string(),
            message,
            traceback,
        })))
    }

    pub fn has_traceback_support(&self) -> bool {
        self.error_traceback.is_some()
    }

    /// Shuts the runtime down. Idempotent; a no-op unless `initialize`
    /// succeeded earlier.
    pub fn finalize(&mut self) {
        if self.started {
            self.started = false;
            let _ = unsafe { (self.finalize)() };
        }
    }
}

/// Copies a NUL-terminated C string out of the runtime. Returns `None` for a
/// NULL pointer.
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

fn unit_name_cstring(name: &str) -> Result<CString, RuntimeError> {
    CString::new(name.as_bytes()).map_err(|_| RuntimeError::BadString(name.to_string()))
}

fn path_to_cstring(path: &Path) -> Result<CString, RuntimeError> {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt as _;
        path.as_os_str().as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = path.to_string_lossy().into_owned().into_bytes();

    CString::new(bytes).map_err(|_| RuntimeError::BadString(path.display().to_string()))
}
