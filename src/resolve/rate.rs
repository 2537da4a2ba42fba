//! adaptive per-nameserver rate limiting
//!
//! Each nameserver carries a token bucket whose refill interval tracks the
//! server's observed round-trip times. Slow servers are queried near their
//! measured latency to avoid queueing collapse; fast servers are pushed up
//! to the rate ceiling. A second, fixed-rate bucket caps the whole pool
//! when a global QPS limit is configured.

use std::cmp;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant as TokioInstant};

/// Queries per second a single server is never pushed beyond.
pub const MAX_RATE: u32 = 15;

/// Queries per second a single server is never throttled below.
pub const MIN_RATE: u32 = 1;

/// RTT samples are clamped to this before entering the running mean.
pub const MAX_INTERVAL: Duration = Duration::from_secs(1);

/// Token interval before any RTT has been observed.
const INITIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Samples required before a non-initial rate update.
pub const MIN_SAMPLES: u32 = 10;

/// Minimum spacing between non-initial rate updates.
pub const RATE_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

struct RateState {
    next_free: TokioInstant,
    interval: Duration,
    avg: Duration,
    count: u32,
    first: bool,
    last_update: Instant,
}

/// Adaptive token bucket for one nameserver.
pub struct RateTracker {
    state: Mutex<RateState>,
}

impl RateTracker {
    pub fn new() -> RateTracker {
        RateTracker {
            state: Mutex::new(RateState {
                next_free: TokioInstant::now(),
                interval: INITIAL_INTERVAL,
                avg: Duration::from_secs(0),
                count: 0,
                first: true,
                last_update: Instant::now(),
            }),
        }
    }

    /// Wait until one token is available. Waiters are serviced in the
    /// order their slots were reserved.
    pub async fn take(&self) {
        let deadline = {
            let mut state = self.state.lock();
            let now = TokioInstant::now();
            let at = cmp::max(state.next_free, now);
            state.next_free = at + state.interval;
            at
        };
        sleep_until(deadline).await;
    }

    /// Record one observed round trip and adjust the token interval when
    /// enough samples have accumulated.
    pub fn report_rtt(&self, rtt: Duration) {
        let rtt = cmp::min(rtt, MAX_INTERVAL);
        let mut state = self.state.lock();

        state.count += 1;
        state.avg = (state.avg * (state.count - 1) + rtt) / state.count;

        let due = state.count >= MIN_SAMPLES
            && state.last_update.elapsed() >= RATE_UPDATE_INTERVAL;
        if state.first || due {
            state.interval = clamp_interval(state.avg);
            state.first = false;
            state.count = 0;
            state.avg = Duration::from_secs(0);
            state.last_update = Instant::now();
        }
    }

    /// The current token interval.
    pub fn interval(&self) -> Duration {
        self.state.lock().interval
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        RateTracker::new()
    }
}

fn clamp_interval(avg: Duration) -> Duration {
    let floor = Duration::from_secs(1) / MAX_RATE;
    let ceil = Duration::from_secs(1) / MIN_RATE;
    cmp::min(cmp::max(avg, floor), ceil)
}

struct QpsState {
    next_free: TokioInstant,
    interval: Duration,
}

/// Fixed-rate token bucket for the pool-wide QPS cap. A rate of zero
/// means unlimited.
pub struct QpsLimiter {
    state: Mutex<QpsState>,
}

impl QpsLimiter {
    pub fn new(qps: u32) -> QpsLimiter {
        QpsLimiter {
            state: Mutex::new(QpsState {
                next_free: TokioInstant::now(),
                interval: qps_interval(qps),
            }),
        }
    }

    pub async fn take(&self) {
        let deadline = {
            let mut state = self.state.lock();
            if state.interval.as_nanos() == 0 {
                return;
            }
            let now = TokioInstant::now();
            let at = cmp::max(state.next_free, now);
            state.next_free = at + state.interval;
            at
        };
        sleep_until(deadline).await;
    }

    pub fn set_qps(&self, qps: u32) {
        self.state.lock().interval = qps_interval(qps);
    }
}

fn qps_interval(qps: u32) -> Duration {
    if qps == 0 {
        Duration::from_secs(0)
    } else {
        Duration::from_secs(1) / qps
    }
}
