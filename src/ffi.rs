//! C exports the interpreter links against.
//!
//! `stdlibrary_wrapper.h` renames the interpreter's `fwrite` and `system`
//! call sites to `fwrite_sandbox` and `system_sandbox`; those land here.
//! Signatures match the libc primitives exactly. The policy is installed
//! once with `stdlib_sandbox_init*` before the interpreter starts; until
//! then every call is denied.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::sync::{Arc, OnceLock};

use libc::{size_t, FILE};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, CONFIG_ENV_VAR};
use crate::sandbox::{
    Mediator, PolicyEvaluator, ProcessSpawner, SandboxError, WriteStream, WriteTarget,
    SPAWN_DENIED_STATUS,
};

static MEDIATOR: OnceLock<Mediator<LibcSystem>> = OnceLock::new();

/// Mediator used for calls that arrive before `install`. Its evaluator
/// never leaves the uninitialized state.
static FAIL_CLOSED: OnceLock<Mediator<LibcSystem>> = OnceLock::new();

fn mediator() -> &'static Mediator<LibcSystem> {
    MEDIATOR.get().unwrap_or_else(|| {
        FAIL_CLOSED
            .get_or_init(|| Mediator::with_spawner(Arc::new(PolicyEvaluator::new()), LibcSystem))
    })
}

/// Installs the process-wide policy. Only the first call succeeds.
pub fn install(config: &Config) -> Result<(), SandboxError> {
    if MEDIATOR.get().is_some() {
        return Err(SandboxError::AlreadyInitialized);
    }
    let evaluator = Arc::new(PolicyEvaluator::new());
    evaluator.initialize(config.sandbox.clone())?;
    let mediator =
        Mediator::with_spawner(evaluator, LibcSystem).with_context(config.caller_context());
    MEDIATOR
        .set(mediator)
        .map_err(|_| SandboxError::AlreadyInitialized)
}

/// libc `system`, the real spawn primitive.
struct LibcSystem;

impl ProcessSpawner for LibcSystem {
    fn spawn(&self, command: &str) -> i32 {
        match CString::new(command) {
            Ok(command) => unsafe { libc::system(command.as_ptr()) },
            Err(_) => -1,
        }
    }
}

/// A C `FILE*`, written with the real libc `fwrite`.
struct CFileStream {
    file: *mut FILE,
}

impl WriteStream for CFileStream {
    fn target(&self) -> WriteTarget {
        let fd = unsafe { libc::fileno(self.file) };
        WriteTarget::from_fd(fd)
    }

    fn write_elements(&mut self, data: &[u8], size: usize, count: usize) -> usize {
        unsafe { libc::fwrite(data.as_ptr() as *const c_void, size, count, self.file) }
    }
}

fn set_errno(code: c_int) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        *libc::__errno_location() = code;
    }
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe {
        *libc::__error() = code;
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    )))]
    let _ = code;
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stdlib_sandbox=warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn init_from_path(path: &str) -> c_int {
    init_logging();
    info!("Loading sandbox policy from {path}");
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!("Cannot load sandbox policy {path}: {e}");
            return -1;
        }
    };
    match install(&config) {
        Ok(()) => {
            info!("Sandbox policy: {}", config.policy_description());
            0
        }
        Err(e) => {
            error!("Cannot install sandbox policy: {e}");
            -1
        }
    }
}

/// Loads the policy file at `config_path`. Returns 0 on success, -1 if the
/// file is unreadable, invalid, or a policy is already installed.
///
/// # Safety
/// `config_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn stdlib_sandbox_init(config_path: *const c_char) -> c_int {
    if config_path.is_null() {
        return -1;
    }
    match CStr::from_ptr(config_path).to_str() {
        Ok(path) => init_from_path(path),
        Err(_) => -1,
    }
}

/// Loads the policy file named by `STDLIB_SANDBOX_CONFIG`. Returns -1 when
/// the variable is unset; the sandbox then stays fail-closed.
#[no_mangle]
pub extern "C" fn stdlib_sandbox_init_from_env() -> c_int {
    match std::env::var(CONFIG_ENV_VAR) {
        Ok(path) => init_from_path(&path),
        Err(_) => {
            init_logging();
            warn!("{CONFIG_ENV_VAR} not set, sandbox stays closed");
            -1
        }
    }
}

/// Mediated `fwrite`. A denied write returns 0 with `errno` set to `EPERM`
/// and leaves the stream untouched.
///
/// # Safety
/// Same contract as `fwrite`: `buffer` must hold `size * count` readable
/// bytes and `stream` must be an open `FILE*`.
#[no_mangle]
pub unsafe extern "C" fn fwrite_sandbox(
    buffer: *const c_void,
    size: size_t,
    count: size_t,
    stream: *mut FILE,
) -> size_t {
    if stream.is_null() {
        set_errno(libc::EINVAL);
        return 0;
    }

    // An overflowing length is denied by the policy; never build a slice for it.
    let len = size.checked_mul(count).unwrap_or(0);
    let data: &[u8] = if buffer.is_null() || len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(buffer as *const u8, len)
    };

    let mut stream = CFileStream { file: stream };
    match mediator().try_fwrite(data, size, count, &mut stream) {
        Ok(written) => written,
        Err(_) => {
            set_errno(libc::EPERM);
            0
        }
    }
}

/// `errno` of a denied spawn. A real `system` that cannot create the child
/// fails with -1 and the `fork` error, most commonly this one.
const SPAWN_DENIED_ERRNO: c_int = libc::EAGAIN;

/// Mediated `system`. Allowed commands return the real `system` status;
/// denied ones return -1 with `errno` set to `EAGAIN`, without starting a
/// process. `system(NULL)` reports that no shell is available.
///
/// # Safety
/// `command` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn system_sandbox(command: *const c_char) -> c_int {
    if command.is_null() {
        return 0;
    }
    let result = match CStr::from_ptr(command).to_str() {
        Ok(command) => mediator().try_system(command),
        Err(_) => {
            warn!("Denied non UTF-8 command");
            Err(SandboxError::InvalidCommand("not UTF-8".to_string()))
        }
    };
    match result {
        Ok(status) => status,
        Err(_) => {
            set_errno(SPAWN_DENIED_ERRNO);
            SPAWN_DENIED_STATUS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{DenyReason, SandboxState, TargetRule};
    use std::ptr;

    fn last_errno() -> Option<i32> {
        std::io::Error::last_os_error().raw_os_error()
    }

    #[test]
    fn test_null_arguments() {
        let buf = b"abc";
        unsafe {
            assert_eq!(
                fwrite_sandbox(buf.as_ptr() as *const c_void, 1, 3, ptr::null_mut()),
                0
            );
            assert_eq!(system_sandbox(ptr::null()), 0);
            assert_eq!(stdlib_sandbox_init(ptr::null()), -1);
        }
    }

    #[test]
    fn test_fd_rule_matches_fopen_stream() {
        let dir = tempfile::tempdir().unwrap();
        let c_out = CString::new(dir.path().join("o").to_str().unwrap()).unwrap();
        let buffer = [b'y'; 8];

        unsafe {
            let file = libc::fopen(c_out.as_ptr(), b"wb\0".as_ptr() as *const c_char);
            assert!(!file.is_null());
            let fd = libc::fileno(file);
            let allow_fd = |n: i32| {
                let state = SandboxState {
                    allowed_write_targets: Some(vec![TargetRule::Descriptor(n)]),
                    ..Default::default()
                };
                Mediator::with_spawner(Arc::new(PolicyEvaluator::ready(state)), LibcSystem)
            };

            let mut stream = CFileStream { file };
            assert_eq!(allow_fd(fd).try_fwrite(&buffer, 1, 8, &mut stream).unwrap(), 8);
            assert!(matches!(
                allow_fd(fd + 1).try_fwrite(&buffer, 1, 8, &mut stream),
                Err(SandboxError::Denied(DenyReason::TargetNotAllowed(_)))
            ));
            assert_eq!(libc::fclose(file), 0);
        }

        assert_eq!(std::fs::metadata(dir.path().join("o")).unwrap().len(), 8);
    }

    /// Whole lifecycle in one test: the installed policy is process-wide.
    #[test]
    fn test_exports_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("sandbox.toml");
        std::fs::write(
            &config_path,
            "[guest]\nname = \"ffi-test\"\n\n[sandbox]\nmax_write_bytes = 100\nallowed_command_patterns = [\"exit *\"]\n",
        )
        .unwrap();
        let out_path = dir.path().join("out.bin");

        let c_config = CString::new(config_path.to_str().unwrap()).unwrap();
        let c_out = CString::new(out_path.to_str().unwrap()).unwrap();
        let buffer = [b'x'; 500];
        let exit_zero = CString::new("exit 0").unwrap();
        let exit_three = CString::new("exit 3").unwrap();
        let rm = CString::new("rm -rf /").unwrap();

        unsafe {
            let file = libc::fopen(c_out.as_ptr(), b"wb\0".as_ptr() as *const c_char);
            assert!(!file.is_null());

            // Fail-closed before init
            assert_eq!(fwrite_sandbox(buffer.as_ptr() as *const c_void, 1, 5, file), 0);
            set_errno(0);
            assert_eq!(system_sandbox(exit_zero.as_ptr()), SPAWN_DENIED_STATUS);
            assert_eq!(last_errno(), Some(libc::EAGAIN));

            assert_eq!(stdlib_sandbox_init(c_config.as_ptr()), 0);
            assert_eq!(stdlib_sandbox_init(c_config.as_ptr()), -1);

            assert_eq!(fwrite_sandbox(buffer.as_ptr() as *const c_void, 1, 50, file), 50);
            assert_eq!(fwrite_sandbox(buffer.as_ptr() as *const c_void, 1, 500, file), 0);
            assert_eq!(last_errno(), Some(libc::EPERM));
            assert_eq!(libc::fclose(file), 0);

            let status = system_sandbox(exit_three.as_ptr());
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 3);
            set_errno(0);
            assert_eq!(system_sandbox(rm.as_ptr()), SPAWN_DENIED_STATUS);
            assert_eq!(last_errno(), Some(libc::EAGAIN));

            set_errno(0);
            assert_eq!(system_sandbox(b"echo \xff\0".as_ptr() as *const c_char), SPAWN_DENIED_STATUS);
            assert_eq!(last_errno(), Some(libc::EAGAIN));
        }

        assert_eq!(std::fs::metadata(&out_path).unwrap().len(), 50);
        assert_eq!(mediator().context().guest, "ffi-test");
    }
}
