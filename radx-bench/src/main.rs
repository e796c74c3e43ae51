//! # Client Benchmark Harness
//!
//! Purpose: Drive the radx client against an in-process cluster so the cost of
//! the dispatch path (queueing, task spawn, completion hand-off) can be
//! measured and compared over time.
//!
//! ## Design Principles
//! 1. **Deterministic Workload**: Use a fixed PRNG seed for stable comparisons.
//! 2. **Allocation Control**: Pre-build object refs and payloads before timing.
//! 3. **Windowed Async**: The async phase keeps a fixed number of completions
//!    outstanding, the way a pipelining caller would.
//! 4. **Swappable Transport**: `memory` runs requests inline on the dispatcher,
//!    `blocking` routes them through the blocking pool.
//!
//! Usage: `radx-bench [objects] [ops] [value_size] [window] [memory|blocking]`

use std::collections::VecDeque;
use std::env;
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use radx_client::transport::Transport;
use radx_client::{BlockingTransport, ClusterConfig, Completion, Connection, MemoryTransport, ObjectRef};
use radx_cluster::MemoryCluster;
use radx_common::logging::{init_logging, LogConfig};

const DEFAULT_OBJECT_COUNT: usize = 1 << 12;
const DEFAULT_OP_COUNT: usize = 200_000;
const DEFAULT_VALUE_SIZE: usize = 128;
const DEFAULT_WINDOW: usize = 64;
const MONITOR: &str = "127.0.0.1:6789";
const POOL: &str = "bench";

struct BenchConfig {
    object_count: usize,
    object_mask: usize,
    op_count: usize,
    value_size: usize,
    window: usize,
    transport: String,
}

impl BenchConfig {
    fn from_args() -> Self {
        let mut args = env::args().skip(1);
        let requested = parse_usize(args.next(), DEFAULT_OBJECT_COUNT);
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT);
        let value_size = parse_usize(args.next(), DEFAULT_VALUE_SIZE);
        let window = parse_usize(args.next(), DEFAULT_WINDOW).max(1);
        let transport = args.next().unwrap_or_else(|| "memory".to_string());

        let object_count = requested.max(1).next_power_of_two();
        BenchConfig {
            object_count,
            object_mask: object_count - 1,
            op_count,
            value_size,
            window,
            transport,
        }
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

/// XorShift keeps the workload reproducible without another dependency.
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    #[inline]
    fn next_index(&mut self, mask: usize) -> usize {
        (self.next_u64() as usize) & mask
    }
}

fn build_payloads(count: usize, size: usize, seed: u64) -> Vec<Bytes> {
    (0..count)
        .map(|i| {
            let mut buffer = vec![0u8; size];
            let stamp = (seed ^ i as u64).to_le_bytes();
            let len = buffer.len().min(stamp.len());
            buffer[..len].copy_from_slice(&stamp[..len]);
            Bytes::from(buffer)
        })
        .collect()
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let ops_per_sec = (ops as f64) / secs;
    let micros_per_op = (secs * 1e6) / (ops.max(1) as f64);
    println!("{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {micros_per_op:.2} µs/op)");
}

fn transport_for(name: &str, cluster: &Arc<MemoryCluster>) -> Result<Arc<dyn Transport>> {
    match name {
        "memory" => Ok(Arc::new(MemoryTransport::new(Arc::clone(cluster)))),
        "blocking" => Ok(Arc::new(BlockingTransport::new(Arc::clone(cluster)))),
        other => bail!("unknown transport '{}', expected memory or blocking", other),
    }
}

fn main() {
    init_logging(&LogConfig {
        level: "warn".to_string(),
        ..LogConfig::default()
    });
    if let Err(err) = run() {
        eprintln!("radx-bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let bench = BenchConfig::from_args();

    let cluster = Arc::new(MemoryCluster::new("radx", vec![MONITOR.to_string()]));
    cluster
        .create_pool(POOL)
        .context("creating benchmark pool")?;
    let config = ClusterConfig {
        mon_hosts: vec![MONITOR.to_string()],
        ..ClusterConfig::default()
    };
    let conn = Connection::open(config, transport_for(&bench.transport, &cluster)?)
        .context("connecting to simulated cluster")?;
    let pool = conn.open_pool(POOL)?;

    let objects = (0..bench.object_count)
        .map(|i| pool.object(format!("obj-{:08}", i)))
        .collect::<Result<Vec<ObjectRef>, _>>()?;
    let payloads = build_payloads(bench.object_count, bench.value_size, 0xA5A5_A5A5_A5A5_A5A5);
    for (object, payload) in objects.iter().zip(&payloads) {
        pool.write_full(object, payload.clone())?;
    }

    println!(
        "transport={}, objects={}, ops={}, value_size={}, window={}",
        bench.transport, bench.object_count, bench.op_count, bench.value_size, bench.window
    );

    let mut rng = XorShift64::new(0x1234_5678_9ABC_DEF0);
    let start = Instant::now();
    for _ in 0..bench.op_count {
        let idx = rng.next_index(bench.object_mask);
        black_box(pool.read(&objects[idx], 0, bench.value_size as u64)?);
    }
    report("READ (blocking)", bench.op_count, start.elapsed());

    let mut rng = XorShift64::new(0x0FED_CBA9_8765_4321);
    let start = Instant::now();
    for _ in 0..bench.op_count {
        let idx = rng.next_index(bench.object_mask);
        pool.write_full(&objects[idx], payloads[idx].clone())?;
    }
    report("WRITE_FULL (blocking)", bench.op_count, start.elapsed());

    let mut rng = XorShift64::new(0x5A5A_5A5A_5A5A_5A5A);
    let mut window: VecDeque<Completion<Bytes>> = VecDeque::with_capacity(bench.window);
    let start = Instant::now();
    for _ in 0..bench.op_count {
        if window.len() == bench.window {
            if let Some(done) = window.pop_front() {
                black_box(done.wait()?);
            }
        }
        let idx = rng.next_index(bench.object_mask);
        window.push_back(pool.aio_read(&objects[idx], 0, bench.value_size as u64));
    }
    for done in window {
        black_box(done.wait()?);
    }
    report("READ (aio)", bench.op_count, start.elapsed());

    let metrics = conn.metrics();
    let latency = &metrics.latency;
    println!(
        "requests={}, errors={}, retries={}, p50<={}µs, p99<={}µs",
        metrics.requests_total,
        metrics.errors_total,
        metrics.retries_total,
        latency.quantile_upper_bound_us(0.50).unwrap_or_default(),
        latency.quantile_upper_bound_us(0.99).unwrap_or_default(),
    );

    pool.close();
    conn.shutdown()?;
    tracing::debug!("benchmark finished");
    Ok(())
}
