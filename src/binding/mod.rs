//! Binding/Redirection Layer.
//!
//! The interpreter's sources are treated as fixed. Redirection happens at
//! build time: the wrapper header renames the host primitives at every
//! call site, and the static library built from this crate provides the
//! renamed symbols (see `crate::ffi`). `audit` verifies that no call site
//! escaped the renaming.

pub mod audit;
pub mod header;

pub use audit::{audit_source, audit_tree, AuditOptions, BindingReport, Bypass, BypassKind};
pub use header::{mediated_name, render_wrapper_header, REDIRECTED_SYMBOLS, WRAPPER_HEADER_NAME};
