//! TCP `Listener` and `Stream` over a `Service`.
//!
//! Socket setup (`socket`, `setsockopt`, `bind`, `listen`) is done with
//! plain syscalls; everything that can block goes through the ring.
//!
//! ```ignore
//! let listener = Listener::bind(&service, "0.0.0.0:7878".parse()?, 1024)?;
//! let (stream, peer) = listener.accept().await?;
//! let (n, buf) = stream.recv(vec![0u8; 4096]).await;
//! let (res, _) = stream.send_all(Slice::new(buf, 0..n?)).await;
//! res?;
//! ```

use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use kring_core::error::{KringError, Result};
use kring_core::executor::Executor;
use kring_core::kdebug;
use kring_executor::{BufResult, IoBuf, IoBufMut, RawAddr, Service, Slice};
use kring_module::handle::Handle;
use kring_module::InlineExecutor;
use nix::errno::Errno;

use crate::addr::{from_storage, to_storage};

fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(KringError::Os(Errno::last_raw()))
    } else {
        Ok(ret)
    }
}

fn socket_for(addr: &SocketAddr) -> Result<Handle> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    // SAFETY: plain syscall.
    let fd = cvt(unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) })?;
    Ok(Handle::new(fd))
}

type NameFn = unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int;

fn sock_name(fd: RawFd, f: NameFn) -> Result<SocketAddr> {
    // SAFETY: all-zero is a valid sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage/len describe a writable buffer of the stated size.
    cvt(unsafe { f(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len) })?;
    from_storage(&storage, len).ok_or(KringError::Os(libc::EAFNOSUPPORT))
}

/// A listening TCP socket.
pub struct Listener<E: Executor = InlineExecutor> {
    service: Service<E>,
    handle: Handle,
}

impl<E: Executor> Listener<E> {
    /// `socket` + `SO_REUSEADDR` + `bind` + `listen`. Port 0 picks an
    /// ephemeral port; see [`local_addr`](Self::local_addr).
    pub fn bind(service: &Service<E>, addr: SocketAddr, backlog: i32) -> Result<Self> {
        let handle = socket_for(&addr)?;
        let fd = handle.raw();

        let on: libc::c_int = 1;
        // SAFETY: option value points at a live c_int of the stated size.
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&on as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;

        let (storage, len) = to_storage(&addr);
        // SAFETY: storage holds a sockaddr of length len.
        cvt(unsafe { libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast(), len) })?;
        // SAFETY: plain syscall.
        cvt(unsafe { libc::listen(fd, backlog) })?;

        kdebug!("listening on {} fd={}", addr, fd);
        Ok(Self { service: service.clone(), handle })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        sock_name(self.handle.raw(), libc::getsockname)
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<(Stream<E>, SocketAddr)> {
        let (fd, peer) = self.service.accept(self.handle.raw()).await?;
        let stream = Stream {
            service: self.service.clone(),
            handle: Handle::new(fd),
        };
        let peer = from_storage(&peer.storage, peer.len).ok_or(KringError::Os(libc::EAFNOSUPPORT))?;
        Ok((stream, peer))
    }

    pub fn service(&self) -> &Service<E> {
        &self.service
    }
}

impl<E: Executor> AsRawFd for Listener<E> {
    fn as_raw_fd(&self) -> RawFd {
        self.handle.raw()
    }
}

/// A connected TCP socket. Closed on drop.
pub struct Stream<E: Executor = InlineExecutor> {
    service: Service<E>,
    handle: Handle,
}

impl<E: Executor> Stream<E> {
    /// Open a socket and connect it through the ring.
    pub async fn connect(service: &Service<E>, addr: SocketAddr) -> Result<Self> {
        let handle = socket_for(&addr)?;
        let (storage, len) = to_storage(&addr);
        service.connect(handle.raw(), RawAddr::new(storage, len)).await?;
        Ok(Self { service: service.clone(), handle })
    }

    /// One read into `buf`. `Ok(0)` is end of stream.
    pub async fn recv<B: IoBufMut>(&self, buf: B) -> BufResult<usize, B> {
        let (res, buf) = self.service.read(self.handle.raw(), buf, 0).await;
        (res.map(|n| n as usize), buf)
    }

    /// Read until `buf` is full or the peer closes. Returns bytes read.
    pub async fn recv_all<B: IoBufMut>(&self, mut buf: B) -> BufResult<usize, B> {
        let total = buf.bytes_init();
        let mut filled = 0;
        while filled < total {
            let (res, slice) = self.recv(Slice::new(buf, filled..total)).await;
            buf = slice.into_inner();
            match res {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return (Err(e), buf),
            }
        }
        (Ok(filled), buf)
    }

    /// One write. Returns bytes accepted by the kernel.
    pub async fn send<B: IoBuf>(&self, buf: B) -> BufResult<usize, B> {
        let (res, buf) = self.service.write(self.handle.raw(), buf, 0).await;
        (res.map(|n| n as usize), buf)
    }

    /// Write all of `buf`.
    pub async fn send_all<B: IoBuf>(&self, mut buf: B) -> BufResult<(), B> {
        let total = buf.bytes_init();
        let mut sent = 0;
        while sent < total {
            let (res, slice) = self.send(Slice::new(buf, sent..total)).await;
            buf = slice.into_inner();
            match res {
                Ok(0) => return (Err(KringError::Os(libc::EPIPE)), buf),
                Ok(n) => sent += n,
                Err(e) => return (Err(e), buf),
            }
        }
        (Ok(()), buf)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        sock_name(self.handle.raw(), libc::getsockname)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        sock_name(self.handle.raw(), libc::getpeername)
    }
}

impl<E: Executor> AsRawFd for Stream<E> {
    fn as_raw_fd(&self) -> RawFd {
        self.handle.raw()
    }
}
