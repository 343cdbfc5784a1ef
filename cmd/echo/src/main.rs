//! TCP echo server on hooked fiber I/O
//!
//! One IoManager accepts, another runs a fiber per connection. Each
//! connection reads and writes with blocking-style calls.
//!
//! ```text
//! cargo run --release -p fiberio-echo -- 0.0.0.0:9000
//! ```
//!
//! # Environment Variables
//!
//! - `FIO_THREADS=4` - Worker threads for connection fibers
//! - `FIO_TCP_SERVER_READ_TIMEOUT=120000` - Idle connection timeout (ms)
//! - `FIO_LOG_LEVEL=info` - Set log level (off, error, warn, info, debug, trace)

use fiberio::{kinfo, kwarn, FiberStream, IoManager, SchedulerConfig, Stream, TcpServer};
use std::net::SocketAddr;

const DEFAULT_ADDR: &str = "0.0.0.0:9000";

fn handle(stream: FiberStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    kinfo!("client {} connected", peer);

    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => match stream.write_fix_size(&buf[..n]) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            Err(e) => {
                kwarn!("client {}: {}", peer, e);
                break;
            }
        }
    }
    kinfo!("client {} closed", peer);
}

fn main() {
    let addr = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let addr: SocketAddr = match addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("bad address {}: {}", addr, e);
            std::process::exit(2);
        }
    };

    let worker_config = SchedulerConfig::from_env().name("echo-worker").use_caller(false);
    let accept_config = SchedulerConfig::new().name("echo-accept").threads(1);
    let (worker, acceptor) = match (IoManager::new(worker_config), IoManager::new(accept_config)) {
        (Ok(w), Ok(a)) => (w, a),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("cannot start io managers: {}", e);
            std::process::exit(1);
        }
    };

    let server = TcpServer::new(worker.clone(), acceptor.clone(), handle);
    let bound = match server.bind(addr) {
        Ok(bound) => bound,
        Err(e) => {
            eprintln!("cannot bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    server.start();
    println!("echo server listening on {} (Ctrl-D on stdin to stop)", bound);

    // Serve until stdin closes
    let mut line = String::new();
    while matches!(std::io::stdin().read_line(&mut line), Ok(n) if n > 0) {
        line.clear();
    }

    server.stop();
    acceptor.stop();
    worker.stop();
    println!("echo server stopped");
}
