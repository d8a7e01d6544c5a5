//! # kring-net
//!
//! TCP sockets whose accept, connect, receive and send all go through a
//! kring [`Service`](kring_executor::Service).
//!
//! ```ignore
//! let service = Service::new(InlineExecutor, 256)?;
//! let listener = Listener::bind(&service, "0.0.0.0:7878".parse()?, 1024)?;
//! spawn(async move {
//!     while let Ok((stream, _)) = listener.accept().await {
//!         // ...
//!     }
//! });
//! service.run()?;
//! ```

pub mod addr;
pub mod tcp;

pub use tcp::{Listener, Stream};
