//! # kring-core: shared vocabulary for the kring runtime
//!
//! Everything the ring layer and the service layer must agree on lives
//! here, and nothing in this crate touches the kernel:
//!
//! | Module     | Contents                                              |
//! |------------|-------------------------------------------------------|
//! | `entry`    | `Token`, `Operation`, `Submission`, `Completion`      |
//! | `error`    | `KringError`, `Result`                                |
//! | `executor` | the `Executor` trait                                  |
//! | `kprint`   | leveled stderr logging (`kinfo!`, `kwarn!`, ...)      |
//! | `env`      | typed environment lookups for configuration           |
//! | `spinlock` | a short-critical-section lock for completion slots    |
//!
//! Implementations live in `kring-module` (rings, syscalls, inline
//! executor) and `kring-executor` (the async service).

pub mod entry;
pub mod env;
pub mod error;
pub mod executor;
pub mod kprint;
pub mod spinlock;

pub use entry::{Completion, Operation, Submission, Token};
pub use error::{KringError, Result};
pub use executor::Executor;
pub use spinlock::SpinLock;
