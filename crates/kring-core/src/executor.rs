//! The `Executor` trait: where submission and resumption work runs.
//!
//! ## Implementors
//!
//! - `kring_module::inline::InlineExecutor` - runs work on the caller.
//!
//! ## Contract
//!
//! - `execute` must eventually run `work` exactly once.
//! - Executors are cheap to clone and default-constructible, so a service
//!   can hold one by value and hand out copies.
//! - Equality means "same execution context": a service compares its own
//!   executor with a caller's to decide whether work can be routed
//!   directly.

pub trait Executor: Clone + Default + PartialEq + Send + Sync + 'static {
    fn execute<W>(&self, work: W)
    where
        W: FnOnce() + Send + 'static;
}
