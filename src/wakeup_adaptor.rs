// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Cross-thread wakeups for a blocked [`Loop`](crate::event_loop::Loop), backed by an
//! `eventfd(2)` counter.
//!
//! `signal()` is the one operation in this crate that is safe to call from any thread
//! or signal handler context — it only touches the kernel counter, never any
//! `Loop`-owned table, matching §5's shared-resource policy.

use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::Arc;

use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::error::{LoopError, Result};

/// A kernel counter used to wake a blocked [`Loop::run_once`](crate::event_loop::Loop::run_once).
///
/// Cheaply [`Clone`] (an `Arc` around the eventfd) so a handle can be handed to other
/// threads without exposing any `Loop`-owned state to them.
#[derive(Debug, Clone)]
pub struct WakeupAdaptor {
    fd: Arc<EventFd>,
}

impl WakeupAdaptor {
    /// Opens the eventfd counter, non-blocking, starting at zero.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] if `eventfd(2)` fails.
    pub fn new() -> Result<Self> {
        let fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).map_err(|source| {
            LoopError::Kernel {
                operation: "eventfd",
                source,
            }
        })?;
        Ok(Self { fd: Arc::new(fd) })
    }

    /// Thread-safe: increments the counter by `n` (minimum 1). Safe to call from any
    /// thread, including one that shares no other state with the `Loop`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::WakeupCounterSaturated`] if the write would overflow the
    /// 64-bit counter (the eventfd contract refuses a write that would make the value
    /// `u64::MAX`), or [`LoopError::Kernel`] for any other write failure.
    pub fn signal(&self, n: u64) -> Result<()> {
        let n = n.max(1);
        match self.fd.write(n) {
            Ok(_) => Ok(()),
            Err(nix::Error::EAGAIN) => Err(LoopError::WakeupCounterSaturated),
            Err(source) => Err(LoopError::Kernel {
                operation: "eventfd_write",
                source,
            }),
        }
    }

    /// Non-blocking: returns the coalesced count since the last drain, or `0` if
    /// nothing was pending.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] for a read failure other than `EAGAIN`.
    pub fn drain(&self) -> Result<u64> {
        match self.fd.read() {
            Ok(n) => Ok(n),
            Err(nix::Error::EAGAIN) => Ok(0),
            Err(source) => Err(LoopError::Kernel {
                operation: "eventfd_read",
                source,
            }),
        }
    }

    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.fd.as_fd().as_raw_fd()
    }

    #[must_use]
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_with_nothing_pending_returns_zero() {
        let w = WakeupAdaptor::new().expect("eventfd");
        assert_eq!(w.drain().expect("drain"), 0);
    }

    #[test]
    fn signal_then_drain_coalesces() {
        let w = WakeupAdaptor::new().expect("eventfd");
        w.signal(1).expect("signal");
        w.signal(2).expect("signal");
        assert_eq!(w.drain().expect("drain"), 3);
        assert_eq!(w.drain().expect("drain"), 0);
    }

    #[test]
    fn signal_clamps_zero_to_one() {
        let w = WakeupAdaptor::new().expect("eventfd");
        w.signal(0).expect("signal");
        assert_eq!(w.drain().expect("drain"), 1);
    }
}
