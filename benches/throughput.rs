//! Throughput benchmark: measure cachequorum proxy overhead vs a direct
//! connection to a single backend.
//!
//! Requires a memcache-compatible backend on localhost:11211 (or
//! CACHEQUORUM_BENCH_BACKEND_PORT) and a running cachequorum proxy on
//! localhost:11311 (or CACHEQUORUM_BENCH_PROXY_PORT), configured with that
//! backend as its only server.
//!
//! Usage:
//!   # Terminal 1: start a backend
//!   memcached -p 11211
//!
//!   # Terminal 2: start cachequorum pointed at it
//!   ./target/release/cachequorum --port 11311
//!
//!   # Terminal 3: run the benchmark
//!   cargo bench --bench throughput
//!
//! Measures round-trip latency of a `set` followed by a `get` through both
//! a direct connection and through the proxy, reporting the overhead.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

fn build_set(key: &str, value: &[u8]) -> Vec<u8> {
    let mut msg = format!("set {key} 0 0 {}\r\n", value.len()).into_bytes();
    msg.extend_from_slice(value);
    msg.extend_from_slice(b"\r\n");
    msg
}

fn build_get(key: &str) -> Vec<u8> {
    format!("get {key}\r\n").into_bytes()
}

fn read_line(reader: &mut BufReader<TcpStream>) -> std::io::Result<String> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(line)
}

/// Runs one `set` + `get` round trip, reading until the `get` reply's
/// terminating `END` line.
fn bench_round_trip(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>, key: &str, value: &[u8]) {
    stream.write_all(&build_set(key, value)).unwrap();
    read_line(reader).unwrap(); // STORED

    stream.write_all(&build_get(key)).unwrap();
    loop {
        let line = read_line(reader).unwrap();
        if line.starts_with("VALUE") {
            let bytes: usize = line.trim_end().rsplit(' ').next().unwrap().parse().unwrap();
            let mut body = vec![0u8; bytes + 2];
            reader.read_exact(&mut body).unwrap();
        } else if line.trim_end() == "END" {
            break;
        }
    }
}

fn connect(addr: &str) -> Option<(TcpStream, BufReader<TcpStream>)> {
    let stream = TcpStream::connect(addr).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    let reader = BufReader::new(stream.try_clone().ok()?);
    Some((stream, reader))
}

fn bench(addr: &str, iterations: u32, warmup: u32) -> Duration {
    let (mut stream, mut reader) = match connect(addr) {
        Some(pair) => pair,
        None => {
            eprintln!("could not connect to {addr}");
            std::process::exit(1);
        }
    };

    let value = vec![b'x'; 128];
    for i in 0..warmup {
        bench_round_trip(&mut stream, &mut reader, &format!("bench-warmup-{i}"), &value);
    }

    let start = Instant::now();
    for i in 0..iterations {
        bench_round_trip(&mut stream, &mut reader, &format!("bench-{i}"), &value);
    }
    start.elapsed() / iterations
}

fn main() {
    let backend_port = std::env::var("CACHEQUORUM_BENCH_BACKEND_PORT").unwrap_or_else(|_| "11211".into());
    let proxy_port = std::env::var("CACHEQUORUM_BENCH_PROXY_PORT").unwrap_or_else(|_| "11311".into());
    let iterations: u32 = std::env::var("CACHEQUORUM_BENCH_ITERATIONS")
        .unwrap_or_else(|_| "1000".into())
        .parse()
        .unwrap_or(1000);
    let warmup = 100;

    println!("cachequorum throughput benchmark");
    println!("─────────────────────────────────");
    println!("iterations:   {iterations}");
    println!("direct:       localhost:{backend_port}");
    println!("proxy:        localhost:{proxy_port}");
    println!();

    let direct_avg = bench(&format!("localhost:{backend_port}"), iterations, warmup);
    let proxy_avg = bench(&format!("localhost:{proxy_port}"), iterations, warmup);

    let overhead = proxy_avg.saturating_sub(direct_avg);
    let overhead_pct = if direct_avg.as_nanos() > 0 {
        (overhead.as_nanos() as f64 / direct_avg.as_nanos() as f64) * 100.0
    } else {
        0.0
    };

    println!("Results (average per set+get round trip):");
    println!("  direct:    {:>8.1}us", direct_avg.as_nanos() as f64 / 1000.0);
    println!("  proxy:     {:>8.1}us", proxy_avg.as_nanos() as f64 / 1000.0);
    println!("  overhead:  {:>8.1}us ({:.1}%)", overhead.as_nanos() as f64 / 1000.0, overhead_pct);
}
