//! Policy mediator for the `fwrite` and `system` primitives of embedded
//! script interpreters.
//!
//! Link the static library into the interpreter, include
//! `stdlibrary_wrapper.h` in its sources, and call `stdlib_sandbox_init`
//! before the first script runs.

pub mod binding;
pub mod config;
pub mod ffi;
pub mod sandbox;

pub use config::Config;
pub use sandbox::{Decision, Mediator, PolicyEvaluator, SandboxError, SandboxState};
