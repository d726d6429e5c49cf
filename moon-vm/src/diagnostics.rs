pub use crate::compiler::diagnostics::render_source_error;

#[cfg(feature = "runtime")]
pub use crate::vm::diagnostics::render_vm_error;
