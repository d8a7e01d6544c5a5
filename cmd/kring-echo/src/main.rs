//! kring Echo Server
//!
//! Single-threaded TCP echo server. Every accept, read and write is an
//! io_uring operation awaited by a task; the main thread only calls
//! `run_one()`.
//!
//! Usage:
//!     cargo build --release -p kring-echo
//!     KRING_BANDWIDTH=512 ./target/release/kring-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done
//!
//! Each connection keeps one operation in flight and the accept loop one
//! more, so at most `bandwidth - 1` connections are served at a time.
//! Further clients wait in the listen backlog.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use kring_core::{kdebug, kerror, kinfo};
use kring_executor::{spawn, InlineExecutor, Service, ServiceBuilder, Slice};
use kring_net::{Listener, Stream};

const BUF_SIZE: usize = 4096;

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

/// Caps live connections; the accept loop parks here when full.
struct Gate {
    active: AtomicUsize,
    limit: usize,
    parked: Mutex<Option<Waker>>,
}

impl Gate {
    fn new(limit: usize) -> Self {
        Self { active: AtomicUsize::new(0), limit, parked: Mutex::new(None) }
    }

    fn admit(&self) -> Admit<'_> {
        Admit { gate: self }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        let waker = self.parked.lock().ok().and_then(|mut w| w.take());
        if let Some(w) = waker {
            w.wake();
        }
    }
}

struct Admit<'a> {
    gate: &'a Gate,
}

impl Future for Admit<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let gate = self.gate;
        if let Ok(mut parked) = gate.parked.lock() {
            if gate.active.load(Ordering::Acquire) >= gate.limit {
                *parked = Some(cx.waker().clone());
                return Poll::Pending;
            }
        }
        gate.active.fetch_add(1, Ordering::AcqRel);
        Poll::Ready(())
    }
}

async fn serve(stream: Stream, stats: Arc<Stats>) -> kring_core::Result<()> {
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let (n, filled) = stream.recv(buf).await;
        let n = n?;
        if n == 0 {
            return Ok(());
        }
        let (res, echoed) = stream.send_all(Slice::new(filled, 0..n)).await;
        res?;
        buf = echoed.into_inner();
        stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
}

async fn accept_loop(listener: Listener, gate: Arc<Gate>, stats: Arc<Stats>) {
    loop {
        gate.admit().await;
        match listener.accept().await {
            Ok((stream, peer)) => {
                let accepts = stats.accepts.fetch_add(1, Ordering::Relaxed) + 1;
                kdebug!("accept #{} from {}", accepts, peer);
                if accepts % 1000 == 0 {
                    kinfo!(
                        "accepts={} bytes={} errors={}",
                        accepts,
                        stats.bytes.load(Ordering::Relaxed),
                        stats.errors.load(Ordering::Relaxed)
                    );
                }
                let gate = Arc::clone(&gate);
                let stats = Arc::clone(&stats);
                spawn(async move {
                    if let Err(e) = serve(stream, Arc::clone(&stats)).await {
                        stats.errors.fetch_add(1, Ordering::Relaxed);
                        kdebug!("connection from {} failed: {}", peer, e);
                    }
                    gate.leave();
                });
            }
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                kerror!("accept failed: {}", e);
                gate.leave();
            }
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);

    let service: Service = match ServiceBuilder::from_env().build(InlineExecutor) {
        Ok(s) => s,
        Err(e) => {
            kerror!("kring-echo: {}", e);
            std::process::exit(1);
        }
    };
    let bandwidth = service.bandwidth() as usize;
    if bandwidth < 2 {
        kerror!("kring-echo: bandwidth {} leaves no room for connections", bandwidth);
        std::process::exit(1);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match Listener::bind(&service, addr, 1024) {
        Ok(l) => l,
        Err(e) => {
            kerror!("kring-echo: bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    kinfo!(
        "kring-echo: listening on {} (bandwidth {}, max {} connections)",
        addr,
        bandwidth,
        bandwidth - 1
    );

    let stats = Arc::new(Stats::default());
    let _acceptor = spawn(accept_loop(listener, Arc::new(Gate::new(bandwidth - 1)), stats));

    loop {
        if let Err(e) = service.run_one() {
            kerror!("kring-echo: {}", e);
            std::process::exit(1);
        }
    }
}
