//! Frame pacing and cooldown windows
//!
//! Everything time-related goes through [`Clock`] so tests can drive the
//! state machine on a manual clock instead of wall time.

use std::time::{Duration, Instant};

/// Monotonic time source with sleep-until-deadline
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep_until(&self, deadline: Instant);
}

/// Wall-clock time backed by `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// Paces scan ticks to a target frame rate.
///
/// A late tick reschedules from now, so overruns lower the effective frame
/// rate instead of building a backlog.
#[derive(Debug)]
pub struct FrameTimer {
    period: Duration,
    next_tick: Option<Instant>,
}

impl FrameTimer {
    pub fn new(frame_rate: f64) -> Self {
        Self {
            period: Duration::from_secs_f64(1.0 / frame_rate),
            next_tick: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick and schedule the one after it
    pub fn wait_for_tick(&mut self, clock: &dyn Clock) {
        if let Some(deadline) = self.next_tick {
            if clock.now() < deadline {
                clock.sleep_until(deadline);
            }
        }
        self.next_tick = Some(clock.now() + self.period);
    }
}

/// Minimum spacing between repeated actions
#[derive(Debug)]
pub struct Cooldown {
    interval: Duration,
    ready_at: Option<Instant>,
}

impl Cooldown {
    /// Starts out ready
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ready_at: None,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.ready_at.map_or(true, |t| now >= t)
    }

    pub fn arm(&mut self, now: Instant) {
        self.ready_at = Some(now + self.interval);
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::Clock;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Virtual clock: time only moves on `advance` or `sleep_until`
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<Instant>,
        slept: Mutex<Duration>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
                slept: Mutex::new(Duration::ZERO),
            }
        }

        pub fn advance(&self, by: Duration) {
            *self.now.lock().unwrap() += by;
        }

        /// Total time spent in `sleep_until`
        pub fn slept(&self) -> Duration {
            *self.slept.lock().unwrap()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }

        fn sleep_until(&self, deadline: Instant) {
            let mut now = self.now.lock().unwrap();
            if deadline > *now {
                *self.slept.lock().unwrap() += deadline - *now;
                *now = deadline;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_timer_sleeps_remaining_period() {
        let clock = ManualClock::new();
        let mut timer = FrameTimer::new(100.0);

        timer.wait_for_tick(&clock);
        assert_eq!(clock.slept(), Duration::ZERO);

        clock.advance(Duration::from_millis(4));
        timer.wait_for_tick(&clock);
        assert_eq!(clock.slept(), Duration::from_millis(6));
    }

    #[test]
    fn test_late_tick_reschedules_from_now() {
        let clock = ManualClock::new();
        let mut timer = FrameTimer::new(100.0);

        timer.wait_for_tick(&clock);
        // Overrun by three periods: no catch-up ticks
        clock.advance(Duration::from_millis(35));
        timer.wait_for_tick(&clock);
        assert_eq!(clock.slept(), Duration::ZERO);

        clock.advance(Duration::from_millis(2));
        timer.wait_for_tick(&clock);
        assert_eq!(clock.slept(), Duration::from_millis(8));
    }

    #[test]
    fn test_cooldown_window() {
        let clock = ManualClock::new();
        let mut cooldown = Cooldown::new(Duration::from_secs(10));
        assert!(cooldown.is_ready(clock.now()));

        cooldown.arm(clock.now());
        clock.advance(Duration::from_secs(9));
        assert!(!cooldown.is_ready(clock.now()));

        clock.advance(Duration::from_secs(1));
        assert!(cooldown.is_ready(clock.now()));
    }
}
