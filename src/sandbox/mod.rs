//! Call-interception sandbox for embedded interpreters.
//!
//! The guest runtime believes it calls the host's `fwrite` and `system`.
//! The binding layer resolves those names to the mediated primitives in
//! this module instead, and each call goes through three steps:
//!
//! 1. Descriptor: the call is captured as an `OperationDescriptor`
//! 2. Policy: the `PolicyEvaluator` turns it into exactly one `Decision`
//! 3. Host: on `Allow` the real primitive runs and its result is returned
//!    unchanged; on `Deny` nothing reaches the host and the guest sees the
//!    primitive's ordinary failure value
//!
//! An evaluator without a policy denies everything.

pub mod descriptor;
pub mod error;
pub mod mediator;
pub mod policy;

pub use descriptor::{CallerContext, Operation, OperationDescriptor, OperationKind, WriteTarget};
pub use error::{DenyReason, SandboxError};
pub use mediator::{
    IoStream, Mediator, ProcessSpawner, ShellSpawner, WriteStream, SPAWN_DENIED_STATUS,
};
pub use policy::{CommandPattern, Decision, PolicyEvaluator, SandboxState, TargetRule};
