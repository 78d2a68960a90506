//! Policy Evaluator.
//!
//! A `PolicyEvaluator` starts `Uninitialized` and becomes `Ready` exactly
//! once, when a `SandboxState` is installed. From then on the state is
//! read-only, so any number of interpreter threads can evaluate against it
//! without locking. Evaluation is a pure function of
//! (`OperationDescriptor`, `SandboxState`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::info;

use super::descriptor::{Operation, OperationDescriptor, WriteTarget};
use super::error::{DenyReason, SandboxError};

/// Characters that let a single `system()` string run more than the
/// command it appears to be.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '>', '<', '(', ')', '\n', '\r'];

/// Outcome of evaluating one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn into_result(self) -> Result<(), SandboxError> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(reason.into()),
        }
    }
}

/// One entry of `allowed_write_targets`.
///
/// Text forms: `stdout`, `stderr`, `fd:<n>`, or an absolute path. A path
/// rule covers the path itself and everything below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetRule {
    Stdout,
    Stderr,
    Descriptor(i32),
    PathPrefix(PathBuf),
}

impl TargetRule {
    pub fn matches(&self, target: &WriteTarget) -> bool {
        match (self, target) {
            (TargetRule::Stdout, WriteTarget::Stdout) => true,
            (TargetRule::Stderr, WriteTarget::Stderr) => true,
            (TargetRule::Descriptor(fd), target) => target.fd() == Some(*fd),
            (TargetRule::PathPrefix(prefix), WriteTarget::Path { path, .. }) => {
                path.starts_with(prefix)
            }
            _ => false,
        }
    }
}

impl TryFrom<String> for TargetRule {
    type Error = SandboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TargetRule::try_from(value.as_str())
    }
}

impl TryFrom<&str> for TargetRule {
    type Error = SandboxError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let value = value.trim();
        match value {
            "stdout" => Ok(TargetRule::Stdout),
            "stderr" => Ok(TargetRule::Stderr),
            _ => {
                if let Some(fd) = value.strip_prefix("fd:") {
                    return fd
                        .parse::<i32>()
                        .ok()
                        .filter(|fd| *fd >= 0)
                        .map(TargetRule::Descriptor)
                        .ok_or_else(|| SandboxError::InvalidTargetRule(value.to_string()));
                }
                let path = Path::new(value);
                if !path.is_absolute() {
                    return Err(SandboxError::InvalidTargetRule(value.to_string()));
                }
                Ok(TargetRule::PathPrefix(path.to_path_buf()))
            }
        }
    }
}

impl From<TargetRule> for String {
    fn from(rule: TargetRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for TargetRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRule::Stdout => write!(f, "stdout"),
            TargetRule::Stderr => write!(f, "stderr"),
            TargetRule::Descriptor(fd) => write!(f, "fd:{fd}"),
            TargetRule::PathPrefix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Glob over a whole command line: `*` matches any run of characters,
/// `?` exactly one, everything else is literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandPattern(String);

impl CommandPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, SandboxError> {
        let pattern = pattern.into();
        if pattern.trim().is_empty() {
            return Err(SandboxError::InvalidCommand(pattern));
        }
        Ok(Self(pattern))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, command: &str) -> bool {
        glob_match(&self.0.chars().collect::<Vec<_>>(), &command.chars().collect::<Vec<_>>())
    }
}

impl TryFrom<String> for CommandPattern {
    type Error = SandboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CommandPattern::new(value)
    }
}

impl From<CommandPattern> for String {
    fn from(pattern: CommandPattern) -> Self {
        pattern.0
    }
}

/// Iterative wildcard match with single-star backtracking.
fn glob_match(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Process-wide sandbox configuration. Read-only once installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxState {
    /// Largest single write in bytes. `None` means no limit.
    #[serde(default)]
    pub max_write_bytes: Option<u64>,
    /// Streams a guest may write to. `None` means any stream.
    #[serde(default)]
    pub allowed_write_targets: Option<Vec<TargetRule>>,
    /// Commands a guest may run. Empty means none.
    #[serde(default)]
    pub allowed_command_patterns: Vec<CommandPattern>,
    #[serde(default = "default_reject_shell_metacharacters")]
    pub reject_shell_metacharacters: bool,
}

fn default_reject_shell_metacharacters() -> bool {
    true
}

impl Default for SandboxState {
    fn default() -> Self {
        Self {
            max_write_bytes: None,
            allowed_write_targets: None,
            allowed_command_patterns: Vec::new(),
            reject_shell_metacharacters: default_reject_shell_metacharacters(),
        }
    }
}

impl SandboxState {
    /// Decides a single operation against this state.
    pub fn decide(&self, op: &OperationDescriptor) -> Decision {
        match &op.operation {
            Operation::Write { target, .. } => self.decide_write(op, target),
            Operation::Spawn { command } => self.decide_spawn(command),
        }
    }

    fn decide_write(&self, op: &OperationDescriptor, target: &WriteTarget) -> Decision {
        let Some(requested) = op.byte_len() else {
            return Decision::Deny(DenyReason::SizeOverflow);
        };

        if let Some(limit) = self.max_write_bytes {
            if requested > limit {
                return Decision::Deny(DenyReason::WriteTooLarge { requested, limit });
            }
        }

        if let Some(ref rules) = self.allowed_write_targets {
            if !rules.iter().any(|rule| rule.matches(target)) {
                return Decision::Deny(DenyReason::TargetNotAllowed(target.clone()));
            }
        }

        Decision::Allow
    }

    fn decide_spawn(&self, command: &str) -> Decision {
        let command = command.trim();
        if command.is_empty() {
            return Decision::Deny(DenyReason::EmptyCommand);
        }

        if self.reject_shell_metacharacters {
            if let Some(c) = command.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
                return Decision::Deny(DenyReason::ShellMetacharacter(c));
            }
        }

        if self
            .allowed_command_patterns
            .iter()
            .any(|pattern| pattern.matches(command))
        {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::CommandNotAllowed)
        }
    }

    /// SHA-1 of the canonical JSON form, hex-encoded.
    ///
    /// Logged at startup so a deployment can confirm which policy the
    /// interpreter actually runs under.
    pub fn fingerprint(&self) -> String {
        // Serializing plain structs and strings cannot fail.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha1::digest(&canonical))
    }
}

/// Two-state evaluator: `Uninitialized` until `initialize`, then `Ready`.
#[derive(Debug, Default)]
pub struct PolicyEvaluator {
    state: OnceLock<SandboxState>,
}

impl PolicyEvaluator {
    /// An uninitialized evaluator; every evaluation is denied.
    pub const fn new() -> Self {
        Self {
            state: OnceLock::new(),
        }
    }

    /// An evaluator that is `Ready` from the start.
    pub fn ready(state: SandboxState) -> Self {
        let evaluator = Self::new();
        let _ = evaluator.state.set(state);
        evaluator
    }

    /// Moves the evaluator to `Ready`. Only the first call wins.
    pub fn initialize(&self, state: SandboxState) -> Result<(), SandboxError> {
        let fingerprint = state.fingerprint();
        self.state
            .set(state)
            .map_err(|_| SandboxError::AlreadyInitialized)?;
        info!("Sandbox policy ready (fingerprint {fingerprint})");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.state.get().is_some()
    }

    pub fn state(&self) -> Option<&SandboxState> {
        self.state.get()
    }

    /// Fails closed while uninitialized.
    pub fn evaluate(&self, op: &OperationDescriptor) -> Decision {
        match self.state.get() {
            Some(state) => state.decide(op),
            None => Decision::Deny(DenyReason::PolicyNotInitialized),
        }
    }
}
