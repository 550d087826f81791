//! Latency report for the state queue.
//!
//! ```bash
//! cargo run --release -p nautilus-perf --bin perf_report
//! ```
//!
//! Prints the segment layout, single-thread operation costs and the
//! push-to-pop latency between two threads attached to one shared segment,
//! then writes everything to `perf/results/<unix secs>_spsc.json`.

use std::hint::black_box;
use std::mem::{align_of, size_of};
use std::path::PathBuf;
use std::sync::Barrier;
use std::time::{SystemTime, UNIX_EPOCH};

use nautilus_icc::{RingBuffer, SegmentHeader, SharedQueue, ShmError, ShmTransport, bytes_for_ring};
use nautilus_perf::{
    Latency, OpResult, ProcessUsage, QueueOp, StampClock, bench_segment_name, fmt_ns, stamp_seq,
    time_op,
};
use nautilus_state::{STATE_QUEUE_SLOTS, State};
use serde::Serialize;

type StateQueue = SharedQueue<State, STATE_QUEUE_SLOTS>;

const CROSS_THREAD_STATES: u64 = 200_000;

#[derive(Serialize)]
struct Layout {
    state_bytes: usize,
    header_bytes: usize,
    ring_bytes: usize,
    segment_bytes: usize,
    slots: usize,
    usable: usize,
}

#[derive(Serialize)]
struct CrossThread {
    states: u64,
    latency: Latency,
    full_retries: u64,
    empty_polls: u64,
    out_of_order: u64,
}

#[derive(Serialize)]
struct Report {
    unix_secs: u64,
    layout: Layout,
    ops: Vec<OpResult>,
    cross_thread: Option<CrossThread>,
    usage: ProcessUsage,
}

fn main() {
    let usage_at_start = ProcessUsage::now();
    let rule = "=".repeat(72);
    println!("{rule}\n  NAUTILUS STATE QUEUE REPORT\n{rule}");

    let layout = layout();
    print_layout(&layout);

    let mut ops = single_thread_ops();
    println!("\nsingle thread (ns per op)");
    print_ops_header();
    for r in &ops {
        println!("{r}");
    }

    println!("\ncross thread through one shared segment");
    let cross_thread = match cross_thread() {
        Ok(ct) => {
            let row = OpResult {
                op: QueueOp::PushToPop,
                latency: ct.latency.clone(),
            };
            print_ops_header();
            println!("{row}");
            println!(
                "  {} states, {} full retries, {} empty polls, {} out of order",
                ct.states, ct.full_retries, ct.empty_polls, ct.out_of_order
            );
            ops.push(row);
            Some(ct)
        }
        Err(e) => {
            println!("  skipped: {e}");
            None
        }
    };

    let usage = ProcessUsage::now().since(&usage_at_start);
    println!(
        "\nprocess: {} minor faults, {} major, {}/{} vol/invol switches, {:.3}s cpu",
        usage.minor_faults,
        usage.major_faults,
        usage.voluntary_switches,
        usage.involuntary_switches,
        usage.cpu_us as f64 / 1e6
    );

    let unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let report = Report {
        unix_secs,
        layout,
        ops,
        cross_thread,
        usage,
    };
    match save(&report) {
        Ok(path) => println!("\nsaved {}", path.display()),
        Err(e) => eprintln!("\nfailed to save report: {e}"),
    }
}

fn layout() -> Layout {
    Layout {
        state_bytes: size_of::<State>(),
        header_bytes: size_of::<SegmentHeader>(),
        ring_bytes: size_of::<RingBuffer<State, STATE_QUEUE_SLOTS>>(),
        segment_bytes: bytes_for_ring::<State, STATE_QUEUE_SLOTS>(),
        slots: STATE_QUEUE_SLOTS,
        usable: STATE_QUEUE_SLOTS - 1,
    }
}

fn print_layout(l: &Layout) {
    println!("\nlayout");
    println!(
        "  State           {:>7} B  (align {})",
        l.state_bytes,
        align_of::<State>()
    );
    println!("  SegmentHeader   {:>7} B", l.header_bytes);
    println!(
        "  RingBuffer      {:>7} B  ({} slots, {} usable)",
        l.ring_bytes, l.slots, l.usable
    );
    println!(
        "  segment         {:>7} B  ({} B of header, padding and indices)",
        l.segment_bytes,
        l.segment_bytes - l.slots * l.state_bytes
    );
}

fn print_ops_header() {
    println!(
        "  {:<30} {:>9} {:>9} {:>9} {:>9}",
        "operation", "p50", "p99", "p99.9", "max"
    );
}

fn single_thread_ops() -> Vec<OpResult> {
    let state = StampClock::start().stamp(0);
    let mut ring = Box::new(RingBuffer::<State, STATE_QUEUE_SLOTS>::new());

    let mut ops = vec![
        time_op(QueueOp::RingRoundTrip, 1000, 10_000, || {
            ring.push(black_box(state));
            black_box(ring.pop());
        }),
        time_op(QueueOp::RingEmptyPop, 1000, 10_000, || {
            black_box(ring.pop());
        }),
    ];

    let name = bench_segment_name("report_hot");
    let transport = ShmTransport::new();
    let pair = transport
        .create::<State, STATE_QUEUE_SLOTS>(&name)
        .and_then(|w| Ok((w, transport.open::<State, STATE_QUEUE_SLOTS>(&name)?)));
    match pair {
        Ok((mut writer, mut reader)) => ops.push(time_op(QueueOp::ShmRoundTrip, 1000, 10_000, || {
            writer.push(black_box(state));
            black_box(reader.pop());
        })),
        Err(e) => println!("  shm round trip skipped: {e}"),
    }
    let _ = transport.cleanup(&name);
    ops
}

/// One producer and one consumer thread, each with its own mapping of the
/// segment as two processes would have. Every state carries its send time.
fn cross_thread() -> Result<CrossThread, ShmError> {
    let name = bench_segment_name("report_xthread");
    let transport = ShmTransport::new();
    let mut writer: StateQueue = transport.create(&name)?;
    let opened: Result<StateQueue, ShmError> = transport.open(&name);
    let mut reader = match opened {
        Ok(q) => q,
        Err(e) => {
            let _ = transport.cleanup(&name);
            return Err(e);
        }
    };

    let clock = StampClock::start();
    let ready = Barrier::new(2);

    let (mut ages, empty_polls, out_of_order, full_retries) = std::thread::scope(|s| {
        let consumer = s.spawn(|| {
            let mut ages = Vec::with_capacity(CROSS_THREAD_STATES as usize);
            let (mut empty, mut out_of_order) = (0u64, 0u64);
            ready.wait();
            while (ages.len() as u64) < CROSS_THREAD_STATES {
                match reader.pop() {
                    Some(state) => {
                        if stamp_seq(&state) != ages.len() as u64 {
                            out_of_order += 1;
                        }
                        ages.push(clock.age_ns(&state));
                    }
                    None => {
                        empty += 1;
                        std::hint::spin_loop();
                    }
                }
            }
            (ages, empty, out_of_order)
        });

        ready.wait();
        let mut full = 0u64;
        for seq in 0..CROSS_THREAD_STATES {
            // restamp on each retry so time spent waiting on a full ring is not counted
            while !writer.push(clock.stamp(seq)) {
                full += 1;
                std::hint::spin_loop();
            }
        }
        let (ages, empty, out_of_order) = consumer.join().unwrap_or_default();
        (ages, empty, out_of_order, full)
    });
    let _ = transport.cleanup(&name);

    let latency = Latency::from_samples(&mut ages).unwrap_or_default();
    println!("  median {} per state", fmt_ns(latency.p50));
    Ok(CrossThread {
        states: CROSS_THREAD_STATES,
        latency,
        full_retries,
        empty_polls,
        out_of_order,
    })
}

fn save(report: &Report) -> std::io::Result<PathBuf> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("results");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}_spsc.json", report.unix_secs));
    let file = std::fs::File::create(&path)?;
    serde_json::to_writer_pretty(file, report).map_err(std::io::Error::other)?;
    Ok(path)
}
