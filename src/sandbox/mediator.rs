//! Mediated Primitive Set.
//!
//! One wrapper per intercepted host primitive. Each wrapper builds an
//! `OperationDescriptor`, gets exactly one `Decision` for it, and only
//! then touches the host. Denials come back through the same channel the
//! real primitive uses to report failure (short count, failed status), so
//! guest error handling keeps working unmodified.

use std::io::{self, Write};
use std::process::Command;
use std::sync::Arc;

use tracing::{debug, warn};

use super::descriptor::{CallerContext, OperationDescriptor, WriteTarget};
use super::error::SandboxError;
use super::policy::{Decision, PolicyEvaluator};

/// Status returned by a denied spawn. Same value `system(3)` returns when
/// no child process could be created.
pub const SPAWN_DENIED_STATUS: i32 = -1;

/// The real write primitive of one open stream.
pub trait WriteStream {
    /// Stream identifier the policy matches against.
    fn target(&self) -> WriteTarget;

    /// Writes `count` elements of `size` bytes taken from `data`, which is
    /// exactly `size × count` bytes long. Returns the number of complete
    /// elements written, like `fwrite`.
    fn write_elements(&mut self, data: &[u8], size: usize, count: usize) -> usize;
}

/// `WriteStream` over any `io::Write`.
pub struct IoStream<W> {
    inner: W,
    target: WriteTarget,
}

impl<W: Write> IoStream<W> {
    pub fn new(inner: W, target: WriteTarget) -> Self {
        Self { inner, target }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> WriteStream for IoStream<W> {
    fn target(&self) -> WriteTarget {
        self.target.clone()
    }

    fn write_elements(&mut self, data: &[u8], size: usize, count: usize) -> usize {
        if size == 0 || count == 0 {
            return 0;
        }

        let mut written = 0;
        while written < data.len() {
            match self.inner.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Write to {} failed after {written} bytes: {e}", self.target);
                    break;
                }
            }
        }
        written / size
    }
}

/// The real process-spawn primitive.
pub trait ProcessSpawner: Send + Sync {
    /// Runs `command` through the shell and returns its status.
    fn spawn(&self, command: &str) -> i32;
}

/// Runs commands with `sh -c`. Returns the exit code, `128 + signal` for a
/// child killed by a signal, and `-1` if the shell could not be started.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellSpawner;

impl ProcessSpawner for ShellSpawner {
    fn spawn(&self, command: &str) -> i32 {
        match Command::new("sh").arg("-c").arg(command).status() {
            Ok(status) => match status.code() {
                Some(code) => code,
                None => signal_status(&status),
            },
            Err(e) => {
                warn!("Failed to start shell: {e}");
                -1
            }
        }
    }
}

#[cfg(unix)]
fn signal_status(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| 128 + sig).unwrap_or(-1)
}

#[cfg(not(unix))]
fn signal_status(_status: &std::process::ExitStatus) -> i32 {
    -1
}

/// Policy-enforcing stand-in for `fwrite` and `system`.
pub struct Mediator<S = ShellSpawner> {
    evaluator: Arc<PolicyEvaluator>,
    spawner: S,
    context: CallerContext,
}

impl Mediator<ShellSpawner> {
    pub fn new(evaluator: Arc<PolicyEvaluator>) -> Self {
        Self::with_spawner(evaluator, ShellSpawner)
    }
}

impl<S: ProcessSpawner> Mediator<S> {
    pub fn with_spawner(evaluator: Arc<PolicyEvaluator>, spawner: S) -> Self {
        Self {
            evaluator,
            spawner,
            context: CallerContext::default(),
        }
    }

    pub fn with_context(mut self, context: CallerContext) -> Self {
        self.context = context;
        self
    }

    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    pub fn context(&self) -> &CallerContext {
        &self.context
    }

    /// Typed decision for a write, without performing it.
    pub fn check_write(
        &self,
        target: WriteTarget,
        size: usize,
        count: usize,
    ) -> Result<(), SandboxError> {
        let op = OperationDescriptor::write(target, size, count, self.context.clone());
        self.evaluator.evaluate(&op).into_result()
    }

    /// Typed decision for a spawn, without performing it.
    pub fn check_spawn(&self, command: &str) -> Result<(), SandboxError> {
        let op = OperationDescriptor::spawn(command, self.context.clone());
        self.evaluator.evaluate(&op).into_result()
    }

    /// Mediated `fwrite`. Returns the number of elements written; 0 when
    /// the policy denies the write, in which case the stream is untouched.
    pub fn fwrite(
        &self,
        data: &[u8],
        size: usize,
        count: usize,
        stream: &mut dyn WriteStream,
    ) -> usize {
        self.try_fwrite(data, size, count, stream).unwrap_or(0)
    }

    /// Like `fwrite`, but keeps the reason of a denial.
    pub fn try_fwrite(
        &self,
        data: &[u8],
        size: usize,
        count: usize,
        stream: &mut dyn WriteStream,
    ) -> Result<usize, SandboxError> {
        let target = stream.target();
        let op = OperationDescriptor::write(target.clone(), size, count, self.context.clone());

        if let Decision::Deny(reason) = self.evaluator.evaluate(&op) {
            warn!(
                "[{}] denied write of {size}x{count} to {target}: {reason}",
                self.context.guest
            );
            return Err(reason.into());
        }

        // Allowed writes always have a byte length.
        let len = op.byte_len().unwrap_or(0) as usize;
        if data.len() < len {
            warn!(
                "[{}] write to {target} claims {len} bytes but buffer holds {}",
                self.context.guest,
                data.len()
            );
            return Ok(0);
        }

        debug!("[{}] write of {len} bytes to {target} allowed", self.context.guest);
        Ok(stream.write_elements(&data[..len], size, count))
    }

    /// Mediated `system`. Returns the real status when allowed and
    /// `SPAWN_DENIED_STATUS` when denied, without starting a process.
    pub fn system(&self, command: &str) -> i32 {
        self.try_system(command).unwrap_or(SPAWN_DENIED_STATUS)
    }

    /// Like `system`, but keeps the reason of a denial.
    pub fn try_system(&self, command: &str) -> Result<i32, SandboxError> {
        let op = OperationDescriptor::spawn(command, self.context.clone());

        match self.evaluator.evaluate(&op) {
            Decision::Allow => {
                debug!("[{}] spawn allowed: {command}", self.context.guest);
                Ok(self.spawner.spawn(command))
            }
            Decision::Deny(reason) => {
                warn!("[{}] denied spawn of {command:?}: {reason}", self.context.guest);
                Err(reason.into())
            }
        }
    }
}
