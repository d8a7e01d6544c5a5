//! # kring-module: default implementations
//!
//! Hand-mapped io_uring rings and the pieces around them. Nothing here
//! goes through liburing or the `io-uring` crate's ring types: the
//! submission and completion queues are mapped and indexed directly.
//!
//! | Piece            | Type                | Module   |
//! |------------------|---------------------|----------|
//! | Syscall bridge   | `setup`, `enter`    | `sys`    |
//! | Kernel resource  | `Handle`            | `handle` |
//! | Mapped memory    | `RingMap`           | `mmap`   |
//! | Shared cursor    | `SharedCursor`      | `cursor` |
//! | Submission queue | `SubmissionRing`    | `sqr`    |
//! | Completion queue | `CompletionRing`    | `cqr`    |
//! | Ring pair        | `Uring`             | `uring`  |
//! | Executor         | `InlineExecutor`    | `inline` |

pub mod cqr;
pub mod cursor;
pub mod handle;
pub mod inline;
pub mod mmap;
pub mod sqr;
pub mod sys;
pub mod uring;

pub use cqr::CompletionRing;
pub use handle::Handle;
pub use inline::InlineExecutor;
pub use sqr::SubmissionRing;
pub use uring::{Uring, UringConfig};
