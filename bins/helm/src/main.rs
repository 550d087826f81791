use anyhow::{Context, Result};
use nautilus_config::BusConfig;
use nautilus_icc::{SharedQueue, ShmError, ShmTransport};
use nautilus_state::{STATE_QUEUE_SLOTS, State};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type StateQueue = SharedQueue<State, STATE_QUEUE_SLOTS>;

/// Circle radius (m) and turn rate (rad/s) of the synthetic track.
const TRACK_RADIUS_M: f64 = 25.0;
const TURN_RATE: f64 = 0.1;
const DEPTH_M: f64 = 3.0;

fn synthetic_state(t: f64) -> State {
    let (sin, cos) = (TURN_RATE * t).sin_cos();
    let speed = TRACK_RADIUS_M * TURN_RATE;
    let yaw_deg = (TURN_RATE * t + std::f64::consts::FRAC_PI_2).to_degrees() % 360.0;
    State::new(
        [TRACK_RADIUS_M * cos, TRACK_RADIUS_M * sin, DEPTH_M],
        [-speed * sin, speed * cos, 0.0],
        [0.0, 0.0, yaw_deg],
        [0.0, 0.0, TURN_RATE],
    )
}

fn create_queue(transport: &ShmTransport, config: &BusConfig) -> Result<StateQueue> {
    let name = &config.segment_name;
    match transport.create(name) {
        Err(ShmError::AlreadyExists { .. }) if config.reclaim_stale => {
            warn!(segment = %name, "reclaiming stale shared queue");
            transport.cleanup(name)?;
            transport.create(name).context("failed to create shared queue after reclaim")
        }
        other => other.with_context(|| format!("failed to create shared queue '{name}'")),
    }
}

fn main() -> Result<()> {
    let config = BusConfig::load_or_default(std::env::args().nth(1)).context("failed to load config")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let transport = ShmTransport::new();
    let mut bus = create_queue(&transport, &config)?;

    info!(
        segment = %config.segment_name,
        tick_hz = config.tick_hz,
        slots = STATE_QUEUE_SLOTS,
        "HELM: publishing states"
    );

    let period = config.tick_period();
    let start = Instant::now();
    let mut next_tick = start;
    let mut last_report = start;
    let mut ticks: u64 = 0;
    let (mut pushed, mut dropped) = (0u64, 0u64);

    loop {
        let state = synthetic_state(start.elapsed().as_secs_f64());

        // A control tick never waits on the consumer; a full bus drops the state.
        if bus.push(state) {
            pushed += 1;
        } else {
            dropped += 1;
        }
        ticks += 1;

        if last_report.elapsed() >= config.report_interval() {
            info!(pushed, dropped, queued = bus.len(), "HELM: tick report");
            if dropped > 0 {
                warn!(dropped, "HELM: consumer is not keeping up");
            }
            pushed = 0;
            dropped = 0;
            last_report = Instant::now();
        }

        if config.max_ticks.is_some_and(|max| ticks >= max) {
            break;
        }

        next_tick += period;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else if now - next_tick > period * 10 {
            // fell far behind; don't try to catch up with a burst
            next_tick = now;
        }
    }

    // Give the relay a moment to drain before the name disappears.
    std::thread::sleep(Duration::from_millis(100));
    transport.cleanup(&config.segment_name)?;
    info!(ticks, "HELM: done, shared queue removed");
    Ok(())
}
