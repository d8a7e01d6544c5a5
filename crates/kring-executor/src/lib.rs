//! # kring-executor
//!
//! The async I/O service: awaitable operations on a hand-mapped io_uring,
//! resumed through an [`Executor`](kring_core::Executor).
//!
//! ```ignore
//! use kring_executor::{InlineExecutor, Service};
//!
//! let service = Service::new(InlineExecutor, 64)?;
//! let (n, buf) = service.block_on(service.read(fd, vec![0u8; 512], 0))?;
//! let n = n? as usize;
//! ```
//!
//! | Piece              | Type                      | Module    |
//! |--------------------|---------------------------|-----------|
//! | Service façade     | `Service`                 | `service` |
//! | Awaitable op       | `Op`                      | `op`      |
//! | Completion slots   | `TokenSlab`               | `token`   |
//! | Owned buffers      | `IoBuf`, `IoBufMut`       | `buf`     |
//! | Configuration      | `ServiceBuilder`          | `config`  |
//! | Task driver        | `spawn`, `JoinHandle`     | `task`    |

pub mod buf;
pub mod config;
pub mod op;
pub mod service;
pub mod task;
pub mod token;

pub use buf::{BufResult, IoBuf, IoBufMut, RawAddr, Slice};
pub use config::{ServiceBuilder, DEFAULT_BANDWIDTH};
pub use kring_module::InlineExecutor;
pub use op::Op;
pub use service::Service;
pub use task::{spawn, JoinHandle};
pub use token::TokenSlab;
