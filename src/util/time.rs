//! Time utilities for the fixed-step simulation

use std::ops::RangeInclusive;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Discrete simulation step index
pub type Tick = u64;

/// Default simulation rate
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Fastest tick rate a world may be configured with
pub const MAX_TICK_RATE: u32 = 1000;

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Fixed-rate tick counter shared by every component of a peer.
///
/// The clock never skips: if the host stalls for several step durations, the
/// next [`TickClock::advance`] returns all of the missed ticks so the caller
/// can simulate each one.
#[derive(Debug, Clone)]
pub struct TickClock {
    tick: Tick,
    tick_rate: u32,
    step: Duration,
    last_update: Instant,
    accumulated: Duration,
}

impl TickClock {
    pub fn new(start_tick: Tick, tick_rate: u32, now: Instant) -> Self {
        let tick_rate = tick_rate.max(1);
        Self {
            tick: start_tick,
            tick_rate,
            step: Duration::from_nanos((1_000_000_000 / tick_rate as u64).max(1)),
            last_update: now,
            accumulated: Duration::ZERO,
        }
    }

    /// Last tick that has been handed out
    pub fn current(&self) -> Tick {
        self.tick
    }

    pub fn step_duration(&self) -> Duration {
        self.step
    }

    /// Fixed physics delta in seconds
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }

    /// Accumulate wall time up to `now` and return every tick that became due.
    ///
    /// The range is empty when less than one step has elapsed. A `now` earlier
    /// than the previous update is treated as no elapsed time.
    pub fn advance(&mut self, now: Instant) -> RangeInclusive<Tick> {
        self.accumulated += now.saturating_duration_since(self.last_update);
        self.last_update = self.last_update.max(now);

        let step = self.step.as_nanos();
        let elapsed = self.accumulated.as_nanos();
        let due = (elapsed / step) as u64;
        self.accumulated = Duration::from_nanos((elapsed % step) as u64);

        let first = self.tick + 1;
        self.tick += due;
        first..=self.tick
    }

    /// Advance by exactly one tick regardless of wall time
    pub fn step_once(&mut self) -> Tick {
        self.tick += 1;
        self.tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_returns_nothing_before_a_full_step() {
        let start = Instant::now();
        let mut clock = TickClock::new(10, 50, start);

        let due = clock.advance(start + Duration::from_millis(19));
        assert!(due.is_empty());
        assert_eq!(clock.current(), 10);
    }

    #[test]
    fn advance_catches_up_after_a_stall() {
        let start = Instant::now();
        let mut clock = TickClock::new(0, 50, start);

        // 20ms steps, stalled for 105ms: five ticks due, 5ms carried over
        let due: Vec<Tick> = clock.advance(start + Duration::from_millis(105)).collect();
        assert_eq!(due, vec![1, 2, 3, 4, 5]);

        let due: Vec<Tick> = clock.advance(start + Duration::from_millis(120)).collect();
        assert_eq!(due, vec![6]);
    }

    #[test]
    fn advance_ignores_time_going_backwards() {
        let start = Instant::now();
        let mut clock = TickClock::new(0, 50, start + Duration::from_millis(40));

        assert!(clock.advance(start).is_empty());
        assert_eq!(clock.current(), 0);
    }

    #[test]
    fn step_never_rounds_to_zero() {
        let start = Instant::now();
        let mut clock = TickClock::new(0, u32::MAX, start);
        assert_eq!(clock.step_duration(), Duration::from_nanos(1));

        let due = clock.advance(start + Duration::from_micros(3));
        assert_eq!(due, 1..=3_000);
        assert_eq!(clock.current(), 3_000);
    }

    #[test]
    fn step_once_is_monotonic() {
        let mut clock = TickClock::new(100, 60, Instant::now());
        assert_eq!(clock.step_once(), 101);
        assert_eq!(clock.step_once(), 102);
        assert!((clock.dt() - 1.0 / 60.0).abs() < 1e-6);
    }
}
