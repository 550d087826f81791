//! Measurement helpers for the state queue: stamped states, per-operation
//! latency summaries and process usage deltas.

use nautilus_state::State;
use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// Queue operation a measurement belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOp {
    /// push then pop on one in-process ring
    RingRoundTrip,
    /// pop on an empty in-process ring
    RingEmptyPop,
    /// push through one mapping, pop through another, same thread
    ShmRoundTrip,
    /// stamp on the producer thread to pop on the consumer thread
    PushToPop,
}

impl QueueOp {
    pub fn label(self) -> &'static str {
        match self {
            QueueOp::RingRoundTrip => "ring push+pop",
            QueueOp::RingEmptyPop => "ring pop (empty)",
            QueueOp::ShmRoundTrip => "shm push+pop",
            QueueOp::PushToPop => "push -> pop (cross-thread)",
        }
    }
}

/// Nanosecond latency summary.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Latency {
    pub count: usize,
    pub mean: f64,
    pub p50: u64,
    pub p99: u64,
    pub p999: u64,
    pub max: u64,
}

impl Latency {
    /// Summarise `samples`, reordering them. `None` when empty.
    pub fn from_samples(samples: &mut [u64]) -> Option<Self> {
        let max = *samples.iter().max()?;
        let count = samples.len();
        let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / count as f64;
        let mut rank = |q: f64| {
            // nearest-rank percentile
            let idx = ((q * count as f64).ceil() as usize).clamp(1, count) - 1;
            *samples.select_nth_unstable(idx).1
        };
        Some(Self {
            count,
            mean,
            p50: rank(0.50),
            p99: rank(0.99),
            p999: rank(0.999),
            max,
        })
    }
}

/// One row of the report.
#[derive(Clone, Debug, Serialize)]
pub struct OpResult {
    pub op: QueueOp,
    pub latency: Latency,
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let l = &self.latency;
        write!(
            f,
            "  {:<30} {:>9} {:>9} {:>9} {:>9}",
            self.op.label(),
            fmt_ns(l.p50),
            fmt_ns(l.p99),
            fmt_ns(l.p999),
            fmt_ns(l.max),
        )
    }
}

/// Time `op` as `rounds` samples of `per_round` calls each; a sample is the
/// mean cost of one call in its round.
pub fn time_op(op: QueueOp, rounds: usize, per_round: u32, mut f: impl FnMut()) -> OpResult {
    // first round only warms caches and faults in the slots
    for _ in 0..per_round {
        f();
    }
    let mut samples: Vec<u64> = (0..rounds)
        .map(|_| {
            let start = Instant::now();
            for _ in 0..per_round {
                f();
            }
            (start.elapsed() / per_round).as_nanos() as u64
        })
        .collect();
    OpResult {
        op,
        latency: Latency::from_samples(&mut samples).unwrap_or_default(),
    }
}

/// Monotonic clock shared by the threads of one run.
#[derive(Clone, Copy, Debug)]
pub struct StampClock {
    epoch: Instant,
}

impl StampClock {
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// A state carrying `seq` in the east position and the send time in north.
    pub fn stamp(&self, seq: u64) -> State {
        let still = [0.0; 3];
        State::new([self.now_ns() as f64, seq as f64, 0.0], still, still, still)
    }

    /// Nanoseconds since `state` was stamped.
    pub fn age_ns(&self, state: &State) -> u64 {
        self.now_ns().saturating_sub(state.position[0] as u64)
    }
}

/// Sequence number carried by a stamped state.
pub fn stamp_seq(state: &State) -> u64 {
    state.position[1] as u64
}

/// Page faults, context switches and CPU time of this process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ProcessUsage {
    pub minor_faults: i64,
    pub major_faults: i64,
    pub voluntary_switches: i64,
    pub involuntary_switches: i64,
    pub cpu_us: i64,
}

impl ProcessUsage {
    pub fn now() -> Self {
        // SAFETY: rusage is plain data and getrusage only writes into it.
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) } != 0 {
            return Self::default();
        }
        let us = |tv: libc::timeval| tv.tv_sec as i64 * 1_000_000 + tv.tv_usec as i64;
        Self {
            minor_faults: ru.ru_minflt as i64,
            major_faults: ru.ru_majflt as i64,
            voluntary_switches: ru.ru_nvcsw as i64,
            involuntary_switches: ru.ru_nivcsw as i64,
            cpu_us: us(ru.ru_utime) + us(ru.ru_stime),
        }
    }

    /// What happened between `earlier` and `self`.
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            minor_faults: self.minor_faults - earlier.minor_faults,
            major_faults: self.major_faults - earlier.major_faults,
            voluntary_switches: self.voluntary_switches - earlier.voluntary_switches,
            involuntary_switches: self.involuntary_switches - earlier.involuntary_switches,
            cpu_us: self.cpu_us - earlier.cpu_us,
        }
    }
}

/// Segment name unique to this process and `label`.
pub fn bench_segment_name(label: &str) -> String {
    format!("nautilus_bench_{label}_{}", std::process::id())
}

pub fn fmt_ns(ns: u64) -> String {
    match ns {
        0..1_000 => format!("{ns} ns"),
        1_000..1_000_000 => format!("{:.1} us", ns as f64 / 1e3),
        _ => format!("{:.1} ms", ns as f64 / 1e6),
    }
}
