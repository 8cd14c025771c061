//! Wall-clock estimation for per-track tick counters.
//!
//! Every track carries a tick counter advancing at its clock rate. The
//! estimator anchors a tick to the wall clock once and derives later wall
//! times from elapsed ticks, re-anchoring whenever the derived time drifts
//! too far from what the wall clock says.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

/// Maximum distance between a derived time and the wall clock before resyncing.
pub const DEFAULT_MAX_DRIFT: Duration = Duration::from_secs(1);

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the operating system's realtime clock.
///
/// `DateTime<Utc>` carries no monotonic reading, so clock adjustments made by
/// the operating system show up in the differences between two calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used to replay deterministic
/// sequences of observed times.
#[derive(Debug)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            nanos: AtomicI64::new(to_nanos(start)),
        }
    }

    /// Jump to an arbitrary time, forwards or backwards.
    pub fn set(&self, time: DateTime<Utc>) {
        self.nanos.store(to_nanos(time), Ordering::Relaxed);
    }

    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn rewind(&self, by: Duration) {
        let delta = i64::try_from(by.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_sub(delta, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.nanos.load(Ordering::Relaxed))
    }
}

fn to_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Computes `v * m / d` without overflowing on `v * m`.
///
/// The split form `(v / d) * m + (v % d) * m / d` equals the truncated
/// rational result exactly. Returns `None` only when the result itself does
/// not fit in an `i64`, or when `d` is zero.
pub fn multiply_and_divide(v: i64, m: i64, d: i64) -> Option<i64> {
    let whole = v.checked_div(d)?;
    let rem = v.checked_rem(d)?;
    whole
        .checked_mul(m)?
        .checked_add(rem.checked_mul(m)? / d)
}

/// Maps a track's tick counter to estimated wall-clock times.
///
/// One instance per track. Calls must be serialized by the caller.
pub struct ClockEstimator {
    clock_rate: NonZeroU32,
    max_drift: TimeDelta,
    clock: Arc<dyn Clock>,
    /// Wall time and tick observed together; never updated separately.
    reference: Option<(DateTime<Utc>, i64)>,
}

impl ClockEstimator {
    pub fn new(clock_rate: NonZeroU32, clock: Arc<dyn Clock>) -> Self {
        Self::with_max_drift(clock_rate, clock, DEFAULT_MAX_DRIFT)
    }

    pub fn with_max_drift(clock_rate: NonZeroU32, clock: Arc<dyn Clock>, max_drift: Duration) -> Self {
        Self {
            clock_rate,
            max_drift: TimeDelta::from_std(max_drift).unwrap_or(TimeDelta::MAX),
            clock,
            reference: None,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate.get()
    }

    /// Estimate the wall-clock time of `tick`.
    ///
    /// The first call anchors the estimator to the current wall time. Later
    /// calls derive the time from the ticks elapsed since the anchor, unless
    /// the result lies in the future or more than the allowed drift in the
    /// past, in which case the estimator re-anchors to the current wall time.
    pub fn estimate(&mut self, tick: i64) -> DateTime<Utc> {
        let now = self.clock.now();

        let Some((ref_time, ref_tick)) = self.reference else {
            self.reference = Some((now, tick));
            return now;
        };

        let computed = multiply_and_divide(
            tick.wrapping_sub(ref_tick),
            NANOS_PER_SECOND,
            i64::from(self.clock_rate.get()),
        )
        .and_then(|elapsed| ref_time.checked_add_signed(TimeDelta::nanoseconds(elapsed)));
        let floor = now.checked_sub_signed(self.max_drift);

        match computed {
            Some(computed) if computed <= now && floor.map_or(true, |floor| computed >= floor) => {
                computed
            }
            _ => {
                log::debug!(
                    "clock estimator resync: tick {tick}, computed {computed:?}, observed {now}"
                );
                self.reference = Some((now, tick));
                now
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn estimator(clock: &Arc<ManualClock>, rate: u32) -> ClockEstimator {
        ClockEstimator::new(NonZeroU32::new(rate).unwrap(), clock.clone())
    }

    #[test]
    fn first_call_returns_observed_time() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut est = estimator(&clock, 90_000);
        assert_eq!(est.estimate(123_456_789), start());
    }

    #[test]
    fn steady_ticks_track_wall_time() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut est = estimator(&clock, 90_000);
        est.estimate(0);

        // ticks advance exactly 40ms, wall clock a little more
        for i in 1..=200i64 {
            clock.advance(Duration::from_micros(40_100));
            let now = clock.now();
            let got = est.estimate(i * 3600);
            assert!(got <= now);
            assert!(now - got <= TimeDelta::seconds(1), "frame {i}: {got} vs {now}");
        }
    }

    #[test]
    fn derived_time_is_tick_exact_within_epoch() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut est = estimator(&clock, 90_000);
        est.estimate(1_000);

        clock.advance(Duration::from_millis(500));
        let a = est.estimate(1_000 + 9_000);
        let b = est.estimate(1_000 + 18_000);
        let c = est.estimate(1_000 + 9_000);

        assert_eq!(a, start() + TimeDelta::milliseconds(100));
        assert_eq!(b, start() + TimeDelta::milliseconds(200));
        assert_eq!(a, c);
    }

    #[test]
    fn forward_jump_resyncs() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut est = estimator(&clock, 1_000);
        est.estimate(0);

        clock.advance(Duration::from_secs(5));
        let jumped = clock.now();
        assert_eq!(est.estimate(100), jumped);

        // new reference is (jumped, 100)
        clock.advance(Duration::from_millis(300));
        assert_eq!(est.estimate(350), jumped + TimeDelta::milliseconds(250));
    }

    #[test]
    fn backward_jump_resyncs() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut est = estimator(&clock, 1_000);
        est.estimate(0);

        clock.advance(Duration::from_secs(2));
        est.estimate(2_000);

        clock.rewind(Duration::from_secs(10));
        let rewound = clock.now();
        assert_eq!(est.estimate(2_040), rewound);

        clock.advance(Duration::from_millis(100));
        assert_eq!(est.estimate(2_120), rewound + TimeDelta::milliseconds(80));
    }

    #[test]
    fn tick_discontinuity_resyncs() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut est = estimator(&clock, 48_000);
        est.estimate(i64::MAX - 10);

        clock.advance(Duration::from_millis(20));
        // counter restarted from zero
        assert_eq!(est.estimate(0), clock.now());
    }

    #[test]
    fn threshold_is_per_instance() {
        let clock = Arc::new(ManualClock::new(start()));
        let rate = NonZeroU32::new(1_000).unwrap();
        let mut strict = ClockEstimator::with_max_drift(rate, clock.clone(), Duration::from_millis(50));
        let mut lenient = ClockEstimator::new(rate, clock.clone());
        strict.estimate(0);
        lenient.estimate(0);

        clock.advance(Duration::from_millis(200));
        assert_eq!(strict.estimate(100), clock.now());
        assert_eq!(lenient.estimate(100), start() + TimeDelta::milliseconds(100));
    }

    #[test]
    fn multiply_and_divide_matches_exact_arithmetic() {
        let cases: [(i64, i64, i64); 7] = [
            (0, NANOS_PER_SECOND, 90_000),
            (1, NANOS_PER_SECOND, 90_000),
            (89_999, NANOS_PER_SECOND, 90_000),
            (3_600, NANOS_PER_SECOND, 90_000),
            (-3_601, NANOS_PER_SECOND, 90_000),
            (800_000_000_000_123, NANOS_PER_SECOND, 90_000),
            (-800_000_000_000_123, NANOS_PER_SECOND, 90_000),
        ];
        for (v, m, d) in cases {
            let exact = (i128::from(v) * i128::from(m) / i128::from(d)) as i64;
            assert_eq!(multiply_and_divide(v, m, d), Some(exact), "v={v}");
        }
    }

    #[test]
    fn multiply_and_divide_survives_large_products() {
        // v * m alone would overflow an i64
        let v = 830_000_000_000_000i64;
        assert!(v.checked_mul(NANOS_PER_SECOND).is_none());
        let exact = i128::from(v) * i128::from(NANOS_PER_SECOND) / 90_000;
        let got = multiply_and_divide(v, NANOS_PER_SECOND, 90_000).unwrap();
        assert_eq!(i128::from(got), exact);
    }

    #[test]
    fn multiply_and_divide_reports_unrepresentable_results() {
        assert_eq!(multiply_and_divide(i64::MAX, NANOS_PER_SECOND, 90_000), None);
        assert_eq!(multiply_and_divide(1, 1, 0), None);
    }
}
