use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Destination of a mediated write, as seen by the policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteTarget {
    Stdout,
    Stderr,
    /// An open descriptor whose path could not be resolved.
    Descriptor(i32),
    /// A regular file (or anything else with a filesystem path). `fd` is
    /// the open descriptor it was resolved from, if any.
    Path { path: PathBuf, fd: Option<i32> },
}

impl WriteTarget {
    /// A path target not yet backed by an open descriptor.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        WriteTarget::Path {
            path: path.into(),
            fd: None,
        }
    }

    /// Maps a raw descriptor to a target. Descriptors 1 and 2 are the
    /// standard streams; anything else is resolved through `/proc/self/fd`
    /// when the platform offers it.
    pub fn from_fd(fd: i32) -> Self {
        match fd {
            1 => WriteTarget::Stdout,
            2 => WriteTarget::Stderr,
            _ => match std::fs::read_link(format!("/proc/self/fd/{fd}")) {
                Ok(path) if path.is_absolute() => WriteTarget::Path {
                    path,
                    fd: Some(fd),
                },
                _ => WriteTarget::Descriptor(fd),
            },
        }
    }

    /// Underlying descriptor number, when known.
    pub fn fd(&self) -> Option<i32> {
        match self {
            WriteTarget::Stdout => Some(1),
            WriteTarget::Stderr => Some(2),
            WriteTarget::Descriptor(fd) => Some(*fd),
            WriteTarget::Path { fd, .. } => *fd,
        }
    }
}

impl fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteTarget::Stdout => write!(f, "stdout"),
            WriteTarget::Stderr => write!(f, "stderr"),
            WriteTarget::Descriptor(fd) => write!(f, "fd:{fd}"),
            WriteTarget::Path { path, .. } => write!(f, "{}", path.display()),
        }
    }
}

/// Which host primitive a descriptor was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Write,
    SpawnProcess,
}

/// Identifies the interpreter instance issuing a call. Only used for
/// logging; the policy never looks at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub guest: String,
}

impl CallerContext {
    pub fn new(guest: impl Into<String>) -> Self {
        Self {
            guest: guest.into(),
        }
    }
}

impl Default for CallerContext {
    fn default() -> Self {
        Self::new("guest")
    }
}

/// What the guest asked the host to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// `fwrite`-shaped request: `count` elements of `size` bytes each.
    Write {
        target: WriteTarget,
        size: usize,
        count: usize,
    },
    /// `system`-shaped request with the literal command text.
    Spawn { command: String },
}

/// Immutable record of one intercepted call.
///
/// Built at interception time, evaluated exactly once, then dropped
/// when the mediated call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub operation: Operation,
    pub context: CallerContext,
}

impl OperationDescriptor {
    pub fn write(target: WriteTarget, size: usize, count: usize, context: CallerContext) -> Self {
        Self {
            operation: Operation::Write {
                target,
                size,
                count,
            },
            context,
        }
    }

    pub fn spawn(command: impl Into<String>, context: CallerContext) -> Self {
        Self {
            operation: Operation::Spawn {
                command: command.into(),
            },
            context,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self.operation {
            Operation::Write { .. } => OperationKind::Write,
            Operation::Spawn { .. } => OperationKind::SpawnProcess,
        }
    }

    /// Requested byte length of a write (`size × count`).
    /// `None` for spawns, and for writes whose length overflows.
    pub fn byte_len(&self) -> Option<u64> {
        match &self.operation {
            Operation::Write { size, count, .. } => size
                .checked_mul(*count)
                .and_then(|len| u64::try_from(len).ok()),
            Operation::Spawn { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_len_multiplies_size_and_count() {
        let op = OperationDescriptor::write(WriteTarget::Stdout, 4, 25, CallerContext::default());
        assert_eq!(op.byte_len(), Some(100));
        assert_eq!(op.kind(), OperationKind::Write);
    }

    #[test]
    fn test_byte_len_overflow_is_none() {
        let op = OperationDescriptor::write(
            WriteTarget::Stdout,
            usize::MAX,
            2,
            CallerContext::default(),
        );
        assert_eq!(op.byte_len(), None);
    }

    #[test]
    fn test_spawn_has_no_byte_len() {
        let op = OperationDescriptor::spawn("echo hi", CallerContext::new("lua-5.4.6"));
        assert_eq!(op.byte_len(), None);
        assert_eq!(op.kind(), OperationKind::SpawnProcess);
        assert_eq!(op.context.guest, "lua-5.4.6");
    }

    #[test]
    fn test_from_fd_standard_streams() {
        assert_eq!(WriteTarget::from_fd(1), WriteTarget::Stdout);
        assert_eq!(WriteTarget::from_fd(2), WriteTarget::Stderr);
    }

    #[test]
    fn test_from_fd_unknown_descriptor() {
        // Far above any descriptor a test process has open.
        assert_eq!(WriteTarget::from_fd(987_654), WriteTarget::Descriptor(987_654));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_from_fd_keeps_descriptor_of_open_file() {
        use std::os::unix::io::AsRawFd;

        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = file.as_file().as_raw_fd();
        match WriteTarget::from_fd(fd) {
            WriteTarget::Path { path, fd: resolved } => {
                assert_eq!(resolved, Some(fd));
                assert_eq!(path, file.path().canonicalize().unwrap());
            }
            other => panic!("expected a path target, got {other:?}"),
        }
        assert_eq!(WriteTarget::path("/tmp/x").fd(), None);
        assert_eq!(WriteTarget::Stderr.fd(), Some(2));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(WriteTarget::Stdout.to_string(), "stdout");
        assert_eq!(WriteTarget::Stderr.to_string(), "stderr");
        assert_eq!(WriteTarget::Descriptor(7).to_string(), "fd:7");
        assert_eq!(
            WriteTarget::path("/tmp/out.txt").to_string(),
            "/tmp/out.txt"
        );
    }
}
