//! kring End-to-End Smoke Test
//!
//! Exercises the whole stack against the running kernel:
//!   Part A: Raw rings: setup, geometry, one NOP through SQ and CQ by hand
//!   Part B: Service: nop, pipe read/write, vectored I/O, introspection
//!   Part C: Error paths: bad descriptors, invalid configuration
//!   Part D: Network: listener, connect, echo between two tasks
//!   Part E: Throughput: a task chaining many operations
//!
//! Run: ./target/release/kring-smoke
//! Exit status is non-zero if any check fails.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Instant;

use kring_core::entry::{Operation, Submission, Token};
use kring_core::error::KringError;
use kring_executor::{spawn, InlineExecutor, Service, ServiceBuilder, Slice};
use kring_module::uring::{Uring, UringConfig};
use kring_net::{Listener, Stream};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn pipe() -> Option<(File, File)> {
    nix::unistd::pipe().ok().map(|(r, w)| (File::from(r), File::from(w)))
}

// ════════════════════════════════════════════════════════════
// Part A: Raw rings
// ════════════════════════════════════════════════════════════

fn test_rings(t: &mut TestRunner) -> bool {
    t.section("Part A: Raw rings");

    let uring = match Uring::setup(&UringConfig { sq_entries: 8, cq_entries: 16, ..Default::default() }) {
        Ok(u) => { t.pass("io_uring_setup + mmap"); u }
        Err(e) => {
            t.fail("io_uring_setup + mmap", &e.to_string());
            println!("       io_uring unavailable; skipping everything else.");
            return false;
        }
    };
    println!("       fd={} features={:#x}", uring.fd(), uring.features());

    let (_handle, mut sq, mut cq) = uring.into_parts();
    t.check(
        "SQ capacity is a power of two >= 8",
        sq.capacity().is_power_of_two() && sq.capacity() >= 8,
        &format!("got {}", sq.capacity()),
    );
    t.check(
        "CQ capacity is a power of two >= 16",
        cq.capacity().is_power_of_two() && cq.capacity() >= 16,
        &format!("got {}", cq.capacity()),
    );

    sq.next().prepare(&Submission::new(Operation::Nop, Token(0xfeed)));
    match sq.submit() {
        Ok(n) => t.check("submit NOP", n == 1 && sq.is_empty(), &format!("consumed {}", n)),
        Err(e) => t.fail("submit NOP", &e.to_string()),
    }

    match cq.wait(1) {
        Ok(()) => {
            let cqe = *cq.next();
            cq.seen();
            t.check(
                "NOP completion echoes user_data",
                cqe.user_data == 0xfeed && cqe.res == 0,
                &format!("user_data={:#x} res={}", cqe.user_data, cqe.res),
            );
            t.check("CQ empty after seen()", cq.is_empty(), "records left over");
        }
        Err(e) => t.fail("wait for NOP completion", &e.to_string()),
    }
    true
}

// ════════════════════════════════════════════════════════════
// Part B: Service
// ════════════════════════════════════════════════════════════

fn test_service(t: &mut TestRunner, service: &Service) {
    t.section("Part B: Service");

    t.check("fresh service is idle", service.idle() && !service.busy(), "pending > 0");

    match service.block_on(service.nop()) {
        Ok(Ok(())) => t.pass("await nop"),
        other => t.fail("await nop", &format!("{:?}", other)),
    }

    let Some((mut r, mut w)) = pipe() else {
        t.fail("pipe()", "pipe creation failed");
        return;
    };

    match service.block_on(service.write(w.as_raw_fd(), b"kring".as_slice(), 0)) {
        Ok((Ok(5), _)) => {
            let mut got = [0u8; 5];
            let ok = r.read_exact(&mut got).is_ok() && &got == b"kring";
            t.check("write to pipe", ok, "pipe contents differ");
        }
        other => t.fail("write to pipe", &format!("{:?}", other)),
    }

    let _ = w.write_all(b"smoke");
    match service.block_on(service.read(r.as_raw_fd(), vec![0u8; 16], 0)) {
        Ok((Ok(5), buf)) => t.check("read from pipe", &buf[..5] == b"smoke", "wrong bytes"),
        other => t.fail("read from pipe", &format!("{:?}", other)),
    }

    let parts = vec![b"ab".as_slice(), b"cde".as_slice()];
    let wrote = service.block_on(service.writev(w.as_raw_fd(), parts, 0));
    let read = service.block_on(service.readv(r.as_raw_fd(), vec![vec![0u8; 3], vec![0u8; 2]], 0));
    let ok = match (&wrote, &read) {
        (Ok((Ok(5), _)), Ok((Ok(5), bufs))) => bufs[0] == b"abc" && bufs[1] == b"de",
        _ => false,
    };
    t.check("writev + readv", ok, &format!("writev={:?} readv={:?}", wrote, read));

    t.check("idle after block_on", service.idle(), &format!("pending={}", service.pending()));
}

// ════════════════════════════════════════════════════════════
// Part C: Error paths
// ════════════════════════════════════════════════════════════

fn test_errors(t: &mut TestRunner, service: &Service) {
    t.section("Part C: Error paths");

    match service.block_on(service.read(-1, vec![0u8; 8], 0)) {
        Ok((Err(KringError::Os(libc::EBADF)), _)) => t.pass("read(-1) -> EBADF"),
        other => t.fail("read(-1) -> EBADF", &format!("{:?}", other)),
    }
    t.check("pending back to 0", service.pending() == 0, &format!("pending={}", service.pending()));

    match ServiceBuilder::new().bandwidth(0).build(InlineExecutor) {
        Err(KringError::InvalidConfig(_)) => t.pass("bandwidth 0 rejected"),
        Err(e) => t.fail("bandwidth 0 rejected", &e.to_string()),
        Ok(_) => t.fail("bandwidth 0 rejected", "service was created"),
    }
}

// ════════════════════════════════════════════════════════════
// Part D: Network
// ════════════════════════════════════════════════════════════

fn test_network(t: &mut TestRunner, service: &Service) {
    t.section("Part D: Network");

    let listener = match Listener::bind(service, ([127, 0, 0, 1], 0).into(), 16) {
        Ok(l) => { t.pass("bind 127.0.0.1:0"); l }
        Err(e) => { t.fail("bind 127.0.0.1:0", &e.to_string()); return; }
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => { t.fail("getsockname", &e.to_string()); return; }
    };

    let server = spawn(async move {
        let (stream, _) = listener.accept().await?;
        let (n, buf) = stream.recv(vec![0u8; 64]).await;
        let n = n?;
        stream.send_all(Slice::new(buf, 0..n)).await.0?;
        Ok::<usize, KringError>(n)
    });

    let svc = service.clone();
    let client = spawn(async move {
        let stream = Stream::connect(&svc, addr).await?;
        stream.send_all(b"ping over io_uring".as_slice()).await.0?;
        let (n, mut buf) = stream.recv_all(vec![0u8; 18]).await;
        buf.truncate(n?);
        Ok::<Vec<u8>, KringError>(buf)
    });

    if let Err(e) = service.run() {
        t.fail("drive echo", &e.to_string());
        return;
    }
    t.check("server task finished", server.is_finished(), "still pending");
    match client.try_take() {
        Some(Ok(echoed)) => t.check("echo round trip", echoed == b"ping over io_uring", "payload differs"),
        other => t.fail("echo round trip", &format!("{:?}", other)),
    }
}

// ════════════════════════════════════════════════════════════
// Part E: Throughput
// ════════════════════════════════════════════════════════════

fn test_throughput(t: &mut TestRunner, service: &Service) {
    t.section("Part E: Throughput");

    const OPS: u32 = 100_000;
    let svc = service.clone();
    let start = Instant::now();
    let chain = spawn(async move {
        for _ in 0..OPS {
            svc.nop().await?;
        }
        Ok::<u32, KringError>(OPS)
    });
    let drained = service.run();
    let elapsed = start.elapsed();

    match (drained, chain.try_take()) {
        (Ok(()), Some(Ok(n))) => {
            let per_sec = n as f64 / elapsed.as_secs_f64();
            println!("       {} sequential nops in {:?} ({:.0} ops/s)", n, elapsed, per_sec);
            t.pass("sequential nop chain");
        }
        (drained, taken) => t.fail("sequential nop chain", &format!("{:?} {:?}", drained, taken)),
    }
}

fn main() {
    println!("=== kring End-to-End Smoke Test ===");
    let kver = std::fs::read_to_string("/proc/version").unwrap_or_default();
    println!("    kernel: {}", kver.trim().split(' ').nth(2).unwrap_or("?"));

    let mut t = TestRunner::new();

    if test_rings(&mut t) {
        match ServiceBuilder::from_env().build(InlineExecutor) {
            Ok(service) => {
                println!("       service bandwidth={} ring fd={}", service.bandwidth(), service.ring_fd());
                test_service(&mut t, &service);
                test_errors(&mut t, &service);
                test_network(&mut t, &service);
                test_throughput(&mut t, &service);
            }
            Err(e) => t.fail("Service::new", &e.to_string()),
        }
    }

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
