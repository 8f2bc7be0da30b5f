// src/trickle.rs
//! Trickle timer (RFC 6206) pacing DIO transmissions.
//!
//! The timer owns two scheduler slots: the transmission point `t`, drawn
//! from `[I/2, I)`, and the end of the interval `I`. The engine forwards the
//! matching callbacks to [`TrickleTimer::on_transmit`] and
//! [`TrickleTimer::on_interval_expiry`].

use std::time::Duration;

use rand::Rng;

use crate::scheduler::{Scheduler, Timer, TimerHandle, TimerSlot};

#[derive(Debug)]
pub struct TrickleTimer {
    i_min: Duration,
    i_max: Duration,
    k: u8,

    interval: Duration,
    t: Duration,
    counter: u8,

    transmit: TimerSlot,
    expiry: TimerSlot,
}

fn uniform<R: Rng>(rng: &mut R, low: Duration, high: Duration, inclusive: bool) -> Duration {
    let lo = low.as_micros() as u64;
    let hi = high.as_micros() as u64;
    let micros = match (inclusive, lo < hi) {
        (_, false) => lo,
        (true, true) => rng.random_range(lo..=hi),
        (false, true) => rng.random_range(lo..hi),
    };
    Duration::from_micros(micros)
}

impl TrickleTimer {
    /// `k == 0` disables suppression: every transmission point fires.
    pub fn new(i_min: Duration, i_max: Duration, k: u8) -> Self {
        TrickleTimer {
            i_min,
            i_max,
            k,
            interval: i_min,
            t: Duration::ZERO,
            counter: 0,
            transmit: TimerSlot::default(),
            expiry: TimerSlot::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn counter(&self) -> u8 {
        self.counter
    }

    pub fn t(&self) -> Duration {
        self.t
    }

    pub fn redundancy_constant(&self) -> u8 {
        self.k
    }

    /// Whether an interval is currently scheduled.
    pub fn is_running(&self) -> bool {
        self.expiry.is_armed()
    }

    /// Start with an interval drawn uniformly from `[i_min, i_max]`.
    pub fn start<S, R>(&mut self, scheduler: &mut S, rng: &mut R)
    where
        S: Scheduler + ?Sized,
        R: Rng,
    {
        self.interval = uniform(rng, self.i_min, self.i_max, true);
        self.begin_interval(scheduler, rng);
    }

    /// Inconsistency heard: shrink back to `i_min`. Does nothing when already
    /// there. Returns whether the timer was restarted.
    pub fn reset<S, R>(&mut self, scheduler: &mut S, rng: &mut R) -> bool
    where
        S: Scheduler + ?Sized,
        R: Rng,
    {
        if self.interval == self.i_min {
            return false;
        }
        self.interval = self.i_min;
        self.begin_interval(scheduler, rng);
        true
    }

    /// Interval callback: double `I` up to `i_max` and begin the next one.
    /// Stale handles are ignored.
    pub fn on_interval_expiry<S, R>(&mut self, handle: TimerHandle, scheduler: &mut S, rng: &mut R) -> bool
    where
        S: Scheduler + ?Sized,
        R: Rng,
    {
        if !self.expiry.fire(handle) {
            return false;
        }
        self.interval = (self.interval * 2).min(self.i_max);
        self.begin_interval(scheduler, rng);
        true
    }

    /// Transmission callback. Returns true when a DIO should go out.
    pub fn on_transmit(&mut self, handle: TimerHandle) -> bool {
        if !self.transmit.fire(handle) {
            return false;
        }
        self.k == 0 || self.counter < self.k
    }

    /// A consistent DIO was heard during this interval.
    pub fn hear_consistent(&mut self) {
        self.counter = self.counter.saturating_add(1);
    }

    /// Cancel both pending callbacks. Safe to call repeatedly.
    pub fn disable<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S) {
        self.transmit.cancel(scheduler);
        self.expiry.cancel(scheduler);
    }

    fn begin_interval<S, R>(&mut self, scheduler: &mut S, rng: &mut R)
    where
        S: Scheduler + ?Sized,
        R: Rng,
    {
        self.counter = 0;
        self.t = uniform(rng, self.interval / 2, self.interval, false);
        self.transmit.arm(scheduler, self.t, Timer::TrickleTransmit);
        self.expiry.arm(scheduler, self.interval, Timer::TrickleInterval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::RecordingScheduler;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const I_MIN: Duration = Duration::from_millis(8);
    const I_MAX: Duration = Duration::from_millis(8 << 4);

    fn timer(k: u8) -> (TrickleTimer, RecordingScheduler, StdRng) {
        (
            TrickleTimer::new(I_MIN, I_MAX, k),
            RecordingScheduler::default(),
            StdRng::seed_from_u64(7),
        )
    }

    fn expire(tt: &mut TrickleTimer, sched: &mut RecordingScheduler, rng: &mut StdRng) {
        let (handle, _) = sched.pending(Timer::TrickleInterval).unwrap();
        assert!(tt.on_interval_expiry(handle, sched, rng));
    }

    #[test]
    fn start_schedules_both_points() {
        let (mut tt, mut sched, mut rng) = timer(10);
        tt.start(&mut sched, &mut rng);

        assert!(tt.is_running());
        assert!(tt.interval() >= I_MIN && tt.interval() <= I_MAX);
        let (_, t) = sched.pending(Timer::TrickleTransmit).unwrap();
        let (_, i) = sched.pending(Timer::TrickleInterval).unwrap();
        assert_eq!(i, tt.interval());
        assert!(t >= tt.interval() / 2 && t <= tt.interval());
    }

    #[test]
    fn expiry_doubles_until_cap() {
        let (mut tt, mut sched, mut rng) = timer(10);
        tt.start(&mut sched, &mut rng);
        for _ in 0..10 {
            expire(&mut tt, &mut sched, &mut rng);
        }
        assert_eq!(tt.interval(), I_MAX);
    }

    #[test]
    fn reset_returns_to_i_min_once() {
        let (mut tt, mut sched, mut rng) = timer(10);
        tt.start(&mut sched, &mut rng);
        expire(&mut tt, &mut sched, &mut rng);
        expire(&mut tt, &mut sched, &mut rng);
        tt.hear_consistent();

        assert!(tt.reset(&mut sched, &mut rng));
        assert_eq!(tt.interval(), I_MIN);
        assert_eq!(tt.counter(), 0);

        let scheduled = sched.scheduled.len();
        assert!(!tt.reset(&mut sched, &mut rng));
        assert_eq!(sched.scheduled.len(), scheduled);
    }

    #[test]
    fn redundancy_suppresses_transmission() {
        let (mut tt, mut sched, mut rng) = timer(2);
        tt.start(&mut sched, &mut rng);
        tt.hear_consistent();
        tt.hear_consistent();

        let (handle, _) = sched.pending(Timer::TrickleTransmit).unwrap();
        assert!(!tt.on_transmit(handle));

        expire(&mut tt, &mut sched, &mut rng);
        let (handle, _) = sched.pending(Timer::TrickleTransmit).unwrap();
        assert!(tt.on_transmit(handle));
    }

    #[test]
    fn zero_redundancy_always_transmits() {
        let (mut tt, mut sched, mut rng) = timer(0);
        tt.start(&mut sched, &mut rng);
        for _ in 0..20 {
            tt.hear_consistent();
        }
        let (handle, _) = sched.pending(Timer::TrickleTransmit).unwrap();
        assert!(tt.on_transmit(handle));
    }

    #[test]
    fn canceled_transmission_does_not_fire() {
        let (mut tt, mut sched, mut rng) = timer(10);
        tt.start(&mut sched, &mut rng);
        let (old, _) = sched.pending(Timer::TrickleTransmit).unwrap();
        expire(&mut tt, &mut sched, &mut rng);

        assert!(sched.canceled.contains(&old));
        assert!(!tt.on_transmit(old));
    }

    #[test]
    fn disable_is_idempotent() {
        let (mut tt, mut sched, mut rng) = timer(10);
        tt.start(&mut sched, &mut rng);
        tt.disable(&mut sched);
        tt.disable(&mut sched);

        assert!(!tt.is_running());
        assert_eq!(sched.canceled.len(), 2);
        assert!(sched.pending(Timer::TrickleInterval).is_none());
    }

    proptest! {
        #[test]
        fn interval_stays_within_bounds(seed in any::<u64>(), ops in proptest::collection::vec(any::<bool>(), 0..40)) {
            let mut tt = TrickleTimer::new(I_MIN, I_MAX, 10);
            let mut sched = RecordingScheduler::default();
            let mut rng = StdRng::seed_from_u64(seed);
            tt.start(&mut sched, &mut rng);

            for reset in ops {
                if reset {
                    tt.reset(&mut sched, &mut rng);
                    prop_assert_eq!(tt.interval(), I_MIN);
                } else {
                    let (handle, _) = sched.pending(Timer::TrickleInterval).unwrap();
                    tt.on_interval_expiry(handle, &mut sched, &mut rng);
                }
                prop_assert!(tt.interval() >= I_MIN && tt.interval() <= I_MAX);
                prop_assert!(tt.t() >= tt.interval() / 2 && tt.t() <= tt.interval());
            }
        }
    }
}
