use anyhow::{Context, Result, bail};
use nautilus_config::BusConfig;
use nautilus_icc::{SharedQueue, ShmError, ShmTransport};
use nautilus_state::{STATE_QUEUE_SLOTS, State};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type StateQueue = SharedQueue<State, STATE_QUEUE_SLOTS>;

const OPEN_RETRY: Duration = Duration::from_millis(50);
const IDLE_SLEEP: Duration = Duration::from_millis(1);
const LIVENESS_CHECK: Duration = Duration::from_millis(100);

pub struct Relay {
    pub transport: ShmTransport,
    pub queue: StateQueue,
    pub received: u64,
    pub last: Option<State>,
}

impl Relay {
    /// Open the producer's queue, retrying until it appears or `timeout` passes.
    pub fn open(segment: &str, timeout: Duration) -> Result<Self> {
        let transport = ShmTransport::new();
        let deadline = Instant::now() + timeout;
        let queue = loop {
            match transport.open(segment) {
                Ok(queue) => break queue,
                Err(ShmError::NotFound { .. }) if Instant::now() < deadline => {
                    std::thread::sleep(OPEN_RETRY);
                }
                Err(ShmError::NotFound { .. }) => {
                    bail!("shared queue '{segment}' did not appear within {timeout:?}")
                }
                // Created but not yet sized or initialised by the producer.
                Err(ShmError::Layout { source, .. }) if Instant::now() < deadline => {
                    debug!(segment, %source, "segment not ready");
                    std::thread::sleep(OPEN_RETRY);
                }
                Err(e) => return Err(e).context("failed to open shared queue"),
            }
        };
        Ok(Self {
            transport,
            queue,
            received: 0,
            last: None,
        })
    }

    /// Drain all available states from the queue.
    pub fn poll_states(&mut self) -> usize {
        let mut count = 0usize;
        while let Some(state) = self.queue.pop() {
            self.process_state(&state);
            count += 1;
        }
        count
    }

    #[inline]
    fn process_state(&mut self, state: &State) {
        debug!(
            seq = self.received,
            position = ?state.position,
            velocity = ?state.velocity,
            attitude = ?state.attitude,
            "RELAY: state"
        );
        self.received += 1;
        self.last = Some(*state);
    }

    /// True once the producer has removed our segment, including when a
    /// restarted producer has created a fresh one under the same name.
    fn producer_gone(&self) -> bool {
        match self.queue.is_orphaned() {
            Ok(gone) => gone,
            Err(e) => {
                warn!(segment = self.queue.name(), error = %e, "RELAY: liveness check failed");
                false
            }
        }
    }
}

fn main() -> Result<()> {
    let config = BusConfig::load_or_default(std::env::args().nth(1)).context("failed to load config")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(segment = %config.segment_name, "RELAY: waiting for shared queue");
    let mut relay = Relay::open(&config.segment_name, config.open_timeout())?;
    info!(
        segment = %config.segment_name,
        capacity = relay.queue.capacity(),
        "RELAY: attached"
    );

    let mut last_report = Instant::now();
    let mut last_liveness = Instant::now();
    let mut window = 0u64;

    loop {
        let drained = relay.poll_states();
        window += drained as u64;

        if last_report.elapsed() >= config.report_interval() {
            let rate = window as f64 / last_report.elapsed().as_secs_f64();
            info!(received = relay.received, rate_hz = rate, "RELAY: rate report");
            if let Some(state) = relay.last {
                info!("RELAY: latest state\n{state}");
            }
            window = 0;
            last_report = Instant::now();
        }

        if drained == 0 {
            if last_liveness.elapsed() >= LIVENESS_CHECK {
                if relay.producer_gone() {
                    // States pushed before the unlink are still in our mapping.
                    relay.poll_states();
                    break;
                }
                last_liveness = Instant::now();
            }
            std::thread::sleep(IDLE_SLEEP);
        }
    }

    if relay.received == 0 {
        warn!("RELAY: producer exited without sending any state");
    }
    info!(received = relay.received, "RELAY: producer gone, exiting");
    relay.transport.close(&config.segment_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(label: &str) -> String {
        format!("relay_{label}_{}", std::process::id())
    }

    #[test]
    fn waits_for_a_late_producer() {
        let name = test_name("late");
        let producer = ShmTransport::new();

        let relay = std::thread::scope(|s| {
            let waiter = s.spawn(|| Relay::open(&name, Duration::from_secs(5)));
            std::thread::sleep(Duration::from_millis(120));
            let mut bus: StateQueue = producer.create(&name).expect("create");
            assert!(bus.push(State::default()));
            waiter.join().expect("relay thread panicked")
        });

        let mut relay = relay.expect("relay attached");
        assert_eq!(relay.poll_states(), 1);
        producer.cleanup(&name).expect("cleanup");
    }

    #[test]
    fn gives_up_when_nobody_creates() {
        let err = Relay::open(&test_name("absent"), Duration::from_millis(100)).err();
        assert!(err.is_some());
    }

    #[test]
    fn notices_producer_restart() {
        let name = test_name("restart");
        let producer = ShmTransport::new();
        let mut bus: StateQueue = producer.create(&name).expect("create");
        let mut relay = Relay::open(&name, Duration::from_secs(1)).expect("attach");

        let mut s = State::default();
        s.position[0] = 10.0;
        assert!(bus.push(s));
        assert_eq!(relay.poll_states(), 1);
        assert_eq!(relay.last, Some(s));
        assert!(!relay.producer_gone());

        // helm with reclaim_stale: cleanup, then create under the same name
        drop(bus);
        producer.cleanup(&name).expect("cleanup");
        let _bus: StateQueue = producer.create(&name).expect("recreate");
        assert!(relay.producer_gone());
        assert_eq!(relay.received, 1);

        producer.cleanup(&name).expect("cleanup");
    }

    #[test]
    fn notices_plain_removal() {
        let name = test_name("removed");
        let producer = ShmTransport::new();
        let _bus: StateQueue = producer.create(&name).expect("create");
        let relay = Relay::open(&name, Duration::from_secs(1)).expect("attach");
        assert!(!relay.producer_gone());
        producer.cleanup(&name).expect("cleanup");
        assert!(relay.producer_gone());
    }
}
