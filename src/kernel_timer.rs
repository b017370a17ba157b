// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! A single outstanding `timerfd(2)` arm, used to wake the [`Backend`](crate::backend::Backend)
//! wait at the next [`Scheduler`](crate::scheduler::Scheduler) deadline.
//!
//! Exactly one `KernelTimer` exists per [`Loop`](crate::event_loop::Loop). It is always
//! either disarmed or armed for a single, one-shot, absolute expiration — the dispatch
//! engine rearms it every iteration from `Scheduler::next_deadline_ns`, it never carries
//! a kernel-side interval.

use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use crate::clock::Deadline;
use crate::error::{LoopError, Result};

/// Wraps one `CLOCK_MONOTONIC` timerfd, armed for at most one absolute expiration.
#[derive(Debug)]
pub struct KernelTimer {
    fd: TimerFd,
}

impl KernelTimer {
    /// Creates a disarmed, non-blocking timerfd on `CLOCK_MONOTONIC`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] if `timerfd_create(2)` fails (typically `EMFILE` or
    /// `ENFILE`).
    pub fn new() -> Result<Self> {
        let fd = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK).map_err(
            |source| LoopError::Kernel {
                operation: "timerfd_create",
                source,
            },
        )?;
        Ok(Self { fd })
    }

    /// Arms the timer to fire once, `from_now_ns` nanoseconds from now. A `from_now_ns`
    /// of `0` or less arms the minimum representable future expiration so the backend
    /// wait returns immediately rather than treating the timer as disarmed.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] if `timerfd_settime(2)` fails.
    pub fn arm_in(&self, from_now_ns: i64) -> Result<()> {
        let ns = from_now_ns.max(1);
        let spec = nix::sys::time::TimeSpec::new(
            ns / 1_000_000_000,
            ns % 1_000_000_000,
        );
        self.fd
            .set(Expiration::OneShot(spec), TimerSetTimeFlags::empty())
            .map_err(|source| LoopError::Kernel {
                operation: "timerfd_settime",
                source,
            })
    }

    /// Disarms the timer. A no-op if already disarmed.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] if `timerfd_settime(2)` fails.
    pub fn disarm(&self) -> Result<()> {
        let spec = nix::sys::time::TimeSpec::new(0, 0);
        self.fd
            .set(Expiration::OneShot(spec), TimerSetTimeFlags::empty())
            .map_err(|source| LoopError::Kernel {
                operation: "timerfd_settime",
                source,
            })
    }

    /// Reads and discards the tick count. Returns `0` if nothing was pending (the read
    /// would block, mapped from `EAGAIN`), or the (normally `1`) expiration count
    /// otherwise.
    ///
    /// The absolute `Deadline` the timer was armed for is tracked by the caller, not
    /// here — `KernelTimer` only knows relative-to-now arming, never the epoch.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] for any failure other than `EAGAIN`.
    pub fn read_ticks(&self) -> Result<u64> {
        match self.fd.wait() {
            Ok(n) => Ok(n),
            Err(nix::Error::EAGAIN) => Ok(0),
            Err(source) => Err(LoopError::Kernel {
                operation: "timerfd_read",
                source,
            }),
        }
    }

    /// The raw descriptor, for registration with the [`Backend`](crate::backend::Backend).
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }

    #[must_use]
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Not reachable from `Deadline` math directly — kept as a marker that this module only
/// deals in relative nanoseconds; absolute-to-relative conversion happens in the
/// dispatch engine via [`crate::clock::Clock::remaining_ns`].
#[allow(dead_code)]
const _: fn(Deadline) = |_| {};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disarmed_timer_read_ticks_is_eagain_zero() {
        let t = KernelTimer::new().expect("timerfd_create");
        assert_eq!(t.read_ticks().expect("read"), 0);
    }

    #[test]
    fn arm_then_disarm_does_not_error() {
        let t = KernelTimer::new().expect("timerfd_create");
        t.arm_in(1_000_000).expect("arm");
        t.disarm().expect("disarm");
    }

    #[test]
    fn arm_in_past_fires_immediately() {
        let t = KernelTimer::new().expect("timerfd_create");
        t.arm_in(-5).expect("arm");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(t.read_ticks().expect("read"), 1);
    }
}
