// Helpers to handle budgeting subsystems based on time
//
// Austin Shafer - 2024
use std::time::{Duration, Instant};

lazy_static::lazy_static! {
    // All timestamps in the process are expressed relative to this
    // instant. Frame pacing needs a monotonic clock, wall time
    // jumps backwards under NTP and breaks vblank math.
    static ref CLOCK_BASE: Instant = Instant::now();
}

/// Get the current monotonic time
pub fn get_current_time() -> Duration {
    CLOCK_BASE.elapsed()
}

/// The current monotonic time in microseconds
///
/// This is the unit the frame scheduler and the vblank statistics
/// operate in.
pub fn get_current_usec() -> u64 {
    get_current_time().as_micros() as u64
}

// Helper to get the current time in milliseconds
#[allow(dead_code)]
pub fn get_current_millis() -> u32 {
    get_current_time().as_millis() as u32
}

/// A source of monotonic microsecond timestamps
///
/// The compositor core never reads the clock directly, it goes
/// through this trait. Tests hand in a manually advanced clock so
/// animations and scheduling can be stepped deterministically.
pub trait Clock {
    fn now_usec(&self) -> u64;
}

/// The default clock, backed by the process monotonic base
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_usec(&self) -> u64 {
        get_current_usec()
    }
}

// A stopclock for measuring time intervals
//
// The order of use MUST be `new`, `start`, `end`
// after that the recorded duration can be
// got with `get_duration`
#[allow(dead_code)]
pub struct StopWatch {
    sw_start: Duration,
    sw_end: Duration,
}

impl StopWatch {
    // Create an empty stopwatch
    pub fn new() -> StopWatch {
        StopWatch {
            sw_start: Duration::from_millis(0),
            sw_end: Duration::from_millis(0),
        }
    }

    pub fn start(&mut self) {
        self.sw_start = get_current_time();
    }

    pub fn end(&mut self) {
        self.sw_end = get_current_time();
    }

    pub fn get_duration(&mut self) -> Duration {
        self.sw_end - self.sw_start
    }
}

/// Tracks one pending expiry, in microseconds
///
/// The event loop is single threaded so delayed work (like a
/// deferred screen unredirection) can't use a real timer. Instead
/// the pending expiry is kept here and the loop clamps its poll
/// timeout to it.
pub struct Countdown {
    /// expiry timestamp, None when disarmed
    cd_deadline: Option<u64>,
}

impl Countdown {
    pub fn new() -> Countdown {
        Countdown { cd_deadline: None }
    }

    /// Arm the countdown to fire `delay_usec` after `now`
    pub fn arm(&mut self, now: u64, delay_usec: u64) {
        self.cd_deadline = Some(now + delay_usec);
    }

    pub fn disarm(&mut self) {
        self.cd_deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.cd_deadline.is_some()
    }

    /// Returns true if the countdown is armed and `now` has passed it
    pub fn is_expired(&self, now: u64) -> bool {
        match self.cd_deadline {
            Some(d) => now >= d,
            None => false,
        }
    }

    /// Time remaining until expiry, None when disarmed
    pub fn time_remaining(&self, now: u64) -> Option<u64> {
        self.cd_deadline.map(|d| d.saturating_sub(now))
    }
}
