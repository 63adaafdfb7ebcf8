use log::{debug, info};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// A free-running counter ticking at a fixed rate.
pub trait CycleCounter: Send + Sync {
    fn cycles(&self) -> u64;
}

/// The x86 time-stamp counter.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct Tsc;

#[cfg(target_arch = "x86_64")]
impl CycleCounter for Tsc {
    #[inline]
    fn cycles(&self) -> u64 {
        // SAFETY: rdtsc is unprivileged and has no memory side effects
        unsafe { core::arch::x86_64::_rdtsc() }
    }
}

/// Counter derived from the monotonic clock, advancing at `rate_hz`.
///
/// Stands in for the TSC on targets without one, and gives tests a cycle
/// source with a known rate.
#[derive(Debug, Copy, Clone)]
pub struct MonotonicCounter {
    epoch: Instant,
    rate_hz: u64,
}

impl MonotonicCounter {
    #[must_use]
    pub fn new(rate_hz: u64) -> Self {
        Self {
            epoch: Instant::now(),
            rate_hz,
        }
    }
}

impl CycleCounter for MonotonicCounter {
    fn cycles(&self) -> u64 {
        (self.epoch.elapsed().as_nanos() * u128::from(self.rate_hz) / NANOS_PER_SEC) as u64
    }
}

/// The counter used for calibration and busy loops on this target.
#[must_use]
pub fn default_counter() -> Arc<dyn CycleCounter> {
    #[cfg(target_arch = "x86_64")]
    {
        Arc::new(Tsc)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        Arc::new(MonotonicCounter::new(NANOS_PER_SEC as u64))
    }
}

/// Cycles-per-second of the cycle counter, measured once at startup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CalibratedFrequency {
    hz: u64,
}

impl CalibratedFrequency {
    #[must_use]
    pub fn from_hz(hz: u64) -> Self {
        Self { hz }
    }

    #[must_use]
    pub fn hz(&self) -> u64 {
        self.hz
    }

    /// Rounded to the nearest MHz.
    #[must_use]
    pub fn mhz(&self) -> u64 {
        (self.hz + 500_000) / 1_000_000
    }

    /// Number of counter ticks spanning `duration`.
    #[must_use]
    pub fn cycles_in(&self, duration: Duration) -> u64 {
        (u128::from(self.hz) * duration.as_nanos() / NANOS_PER_SEC) as u64
    }
}

impl Display for CalibratedFrequency {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} MHz", self.mhz())
    }
}

/// Sample the counter across a sleep of `window` and derive its rate.
///
/// A single sample with no averaging: a longer window trades startup time for
/// accuracy.
pub fn calibrate(counter: &dyn CycleCounter, window: Duration) -> CalibratedFrequency {
    info!("Calibrating cycle counter over {window:?}");

    let start_cycles = counter.cycles();
    let started = Instant::now();
    thread::sleep(window);
    let end_cycles = counter.cycles();
    let elapsed = started.elapsed();

    let delta = end_cycles.wrapping_sub(start_cycles);
    let hz = u128::from(delta) * NANOS_PER_SEC / elapsed.as_nanos().max(1);
    debug!("Calibration: {delta} cycles in {elapsed:?}");

    CalibratedFrequency::from_hz(hz as u64)
}

/// Spins on the cycle counter for a wall-clock duration.
#[derive(Clone)]
pub struct BusyLoop {
    counter: Arc<dyn CycleCounter>,
    frequency: CalibratedFrequency,
}

impl BusyLoop {
    #[must_use]
    pub fn new(counter: Arc<dyn CycleCounter>, frequency: CalibratedFrequency) -> Self {
        Self { counter, frequency }
    }

    #[must_use]
    pub fn frequency(&self) -> CalibratedFrequency {
        self.frequency
    }

    /// Pure computation until `duration` has elapsed on the counter. Never
    /// blocks and cannot be interrupted.
    pub fn spin(&self, duration: Duration) {
        let start = self.counter.cycles();
        let off = self.frequency.cycles_in(duration);

        // No pause hint: the core must stay fully loaded.
        while self.counter.cycles().wrapping_sub(start) < off {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relative_error(measured: u64, expected: u64) -> f64 {
        (measured as f64 - expected as f64).abs() / expected as f64
    }

    #[test]
    fn test_calibrate_recovers_counter_rate() {
        let rate = 3_000_000_000;
        let counter = MonotonicCounter::new(rate);
        let frequency = calibrate(&counter, Duration::from_millis(100));
        assert!(relative_error(frequency.hz(), rate) < 0.01, "{frequency:?}");
    }

    #[test]
    fn test_calibrate_longer_window_is_at_least_as_tight() {
        let rate = 2_500_000_000;
        let counter = MonotonicCounter::new(rate);
        let short = calibrate(&counter, Duration::from_millis(10));
        let long = calibrate(&counter, Duration::from_millis(200));
        assert!(relative_error(short.hz(), rate) < 0.05);
        assert!(relative_error(long.hz(), rate) < 0.005);
    }

    #[test]
    fn test_mhz_rounds_to_nearest() {
        assert_eq!(CalibratedFrequency::from_hz(3_699_600_000).mhz(), 3700);
        assert_eq!(CalibratedFrequency::from_hz(3_699_400_000).mhz(), 3699);
    }

    #[test]
    fn test_cycles_in() {
        let frequency = CalibratedFrequency::from_hz(4_000_000_000);
        assert_eq!(frequency.cycles_in(Duration::from_millis(20)), 80_000_000);
        assert_eq!(frequency.cycles_in(Duration::ZERO), 0);
    }

    #[test]
    fn test_busy_loop_runs_for_requested_duration() {
        let rate = 1_000_000_000;
        let counter: Arc<dyn CycleCounter> = Arc::new(MonotonicCounter::new(rate));
        let busy = BusyLoop::new(counter, CalibratedFrequency::from_hz(rate));
        let requested = Duration::from_millis(20);

        let started = Instant::now();
        busy.spin(requested);
        let elapsed = started.elapsed();

        assert!(elapsed.as_secs_f64() >= 0.95 * requested.as_secs_f64(), "{elapsed:?}");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_tsc_advances() {
        let first = Tsc.cycles();
        thread::sleep(Duration::from_millis(1));
        assert!(Tsc.cycles() > first);
    }
}
