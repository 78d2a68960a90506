use std::fmt;

use thiserror::Error;

use super::descriptor::WriteTarget;

/// Why the policy refused an operation.
///
/// Never shown to the guest: it only sees the same failure value the
/// real primitive would return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Evaluated before a policy was installed (fail-closed).
    PolicyNotInitialized,
    WriteTooLarge { requested: u64, limit: u64 },
    /// `size × count` does not fit in a byte count.
    SizeOverflow,
    TargetNotAllowed(WriteTarget),
    CommandNotAllowed,
    ShellMetacharacter(char),
    EmptyCommand,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::PolicyNotInitialized => write!(f, "sandbox policy not initialized"),
            DenyReason::WriteTooLarge { requested, limit } => {
                write!(f, "write of {requested} bytes exceeds limit of {limit}")
            }
            DenyReason::SizeOverflow => write!(f, "write size overflows"),
            DenyReason::TargetNotAllowed(target) => {
                write!(f, "write target {target} not allowed")
            }
            DenyReason::CommandNotAllowed => write!(f, "command matches no allowed pattern"),
            DenyReason::ShellMetacharacter(c) => {
                write!(f, "command contains shell metacharacter {c:?}")
            }
            DenyReason::EmptyCommand => write!(f, "command is empty"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("sandbox policy not initialized")]
    NotInitialized,

    #[error("sandbox policy already initialized")]
    AlreadyInitialized,

    #[error("sandbox violation: {0}")]
    Denied(DenyReason),

    #[error("invalid write target rule: {0}")]
    InvalidTargetRule(String),

    #[error("invalid command pattern: {0}")]
    InvalidCommand(String),
}

impl From<DenyReason> for SandboxError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::PolicyNotInitialized => SandboxError::NotInitialized,
            other => SandboxError::Denied(other),
        }
    }
}
