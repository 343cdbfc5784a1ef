//! Basic fiberio example
//!
//! Fibers that yield to each other, a recurring timer, sleeping fibers and a
//! fiber pinned to one worker.
//!
//! # Environment Variables
//!
//! - `FIO_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `FIO_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `FIO_THREADS=4` - Worker threads

use fiberio::{current_id, kdebug, kinfo, sleep_ms, spawn, yield_now, Runtime, SchedulerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
// FIO_LOG_LEVEL=debug FIO_FLUSH_EPRINT=1 cargo run -p fiberio-basic
fn main() {
    println!("=== fiberio Basic Example ===\n");

    let config = SchedulerConfig::from_env().name("basic").use_caller(false);
    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("cannot start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let completed = Arc::new(AtomicUsize::new(0));

    // Recurring timer: ticks until the sleepers are done
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = Arc::clone(&ticks);
    let ticker = runtime.io_manager().add_timer(
        25,
        move || {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            kdebug!("[timer] tick {}", n);
        },
        true,
    );

    let c = Arc::clone(&completed);
    let result = runtime.block_on(move || {
        kinfo!("spawning fibers...");

        for i in 1..=3 {
            let c = Arc::clone(&c);
            let _ = spawn(move || {
                kdebug!("[fiber {}] started as {}", i, current_id());
                for j in 0..3 {
                    kdebug!("[fiber {}] iteration {}", i, j);
                    yield_now();
                }
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        for i in 1..=3u64 {
            let c = Arc::clone(&c);
            let _ = spawn(move || {
                sleep_ms(50 * i);
                kdebug!("[sleeper {}] woke after {}ms", i, 50 * i);
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        6
    });

    let Ok(expected) = result else {
        eprintln!("root fiber failed");
        std::process::exit(1);
    };

    // Pin one last fiber to the first worker
    if let Some(&tid) = runtime.io_manager().thread_ids().first() {
        let c = Arc::clone(&completed);
        runtime.spawn_on(
            move || {
                kinfo!("[pinned] running on thread {}", tid);
                c.fetch_add(1, Ordering::SeqCst);
            },
            tid,
        );
    }

    let start = std::time::Instant::now();
    while completed.load(Ordering::SeqCst) < expected {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    ticker.cancel();
    runtime.shutdown();

    println!(
        "{} fiber(s) completed in {:?}, timer ticked {} time(s)",
        completed.load(Ordering::SeqCst),
        start.elapsed(),
        ticks.load(Ordering::SeqCst)
    );
    println!("\n=== Example Complete ===");
}
