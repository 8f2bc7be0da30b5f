// src/scheduler.rs
//! Timer scheduling seam.
//!
//! The engine never sleeps or polls a clock of its own. Every delay is a
//! [`Timer`] handed to a [`Scheduler`], which returns a cancelable
//! [`TimerHandle`] and later calls back into `RplNode::on_timer`.
//!
//! Cancellation is exact: a scheduler must never deliver a handle after
//! `cancel` returned for it.

use std::time::Duration;

/// Opaque identifier of one scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/// What a scheduled callback is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Trickle transmission point `t` inside the current interval.
    TrickleTransmit,
    /// End of the current Trickle interval.
    TrickleInterval,
    /// Next multicast DIS while joining.
    DisRetransmit,
    /// Delayed DAO transmission.
    SendDao,
    /// DAO-ACK supervision tick.
    DaoAckCheck,
    /// End of the disjoin hold-down.
    Reboot,
}

pub trait Scheduler {
    /// Current time, measured from an arbitrary epoch.
    fn now(&self) -> Duration;

    /// Fire `timer` after `delay`.
    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle;

    /// Cancel a pending callback. Unknown or already-fired handles are ignored.
    fn cancel(&mut self, handle: TimerHandle);
}

/// Holds at most one pending handle for a single operation.
///
/// Re-arming cancels the previous handle first, so an operation never has
/// two callbacks in flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimerSlot(Option<TimerHandle>);

impl TimerSlot {
    pub fn arm<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S, delay: Duration, timer: Timer) {
        self.cancel(scheduler);
        self.0 = Some(scheduler.schedule(delay, timer));
    }

    pub fn cancel<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S) {
        if let Some(handle) = self.0.take() {
            scheduler.cancel(handle);
        }
    }

    /// Consume a fired handle. Returns false if `handle` is not the one this
    /// slot is waiting for.
    pub fn fire(&mut self, handle: TimerHandle) -> bool {
        if self.0 == Some(handle) {
            self.0 = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.0.is_some()
    }
}

/// Scheduler that only records calls; tests fire timers by hand.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingScheduler {
    pub now: Duration,
    next: u64,
    pub scheduled: Vec<(TimerHandle, Duration, Timer)>,
    pub canceled: Vec<TimerHandle>,
}

#[cfg(test)]
impl RecordingScheduler {
    /// Latest still-pending handle for `timer`.
    pub fn pending(&self, timer: Timer) -> Option<(TimerHandle, Duration)> {
        self.scheduled
            .iter()
            .rev()
            .find(|(h, _, t)| *t == timer && !self.canceled.contains(h))
            .map(|(h, d, _)| (*h, *d))
    }
}

#[cfg(test)]
impl Scheduler for RecordingScheduler {
    fn now(&self) -> Duration {
        self.now
    }

    fn schedule(&mut self, delay: Duration, timer: Timer) -> TimerHandle {
        self.next += 1;
        let handle = TimerHandle(self.next);
        self.scheduled.push((handle, delay, timer));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.canceled.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rearming_cancels_previous_handle() {
        let mut sched = RecordingScheduler::default();
        let mut slot = TimerSlot::default();

        slot.arm(&mut sched, Duration::from_secs(1), Timer::SendDao);
        let (first, _) = sched.pending(Timer::SendDao).unwrap();
        slot.arm(&mut sched, Duration::from_secs(2), Timer::SendDao);
        let (second, delay) = sched.pending(Timer::SendDao).unwrap();

        assert_eq!(sched.canceled, vec![first]);
        assert_ne!(first, second);
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn stale_handle_does_not_fire() {
        let mut sched = RecordingScheduler::default();
        let mut slot = TimerSlot::default();

        slot.arm(&mut sched, Duration::from_secs(1), Timer::Reboot);
        let (first, _) = sched.pending(Timer::Reboot).unwrap();
        slot.arm(&mut sched, Duration::from_secs(1), Timer::Reboot);
        let (second, _) = sched.pending(Timer::Reboot).unwrap();

        assert!(!slot.fire(first));
        assert!(slot.fire(second));
        assert!(!slot.is_armed());
        assert!(!slot.fire(second));
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut sched = RecordingScheduler::default();
        let mut slot = TimerSlot::default();
        slot.cancel(&mut sched);
        slot.arm(&mut sched, Duration::from_secs(1), Timer::DisRetransmit);
        slot.cancel(&mut sched);
        slot.cancel(&mut sched);
        assert_eq!(sched.canceled.len(), 1);
    }
}
