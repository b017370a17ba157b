// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The readiness-polling seam.
//!
//! [`Backend`] is duck-typed against `epoll(7)` but is not epoll-specific in its
//! signature — [`Loop`](crate::event_loop::Loop) is generic over it so the dispatch
//! engine can be exercised with a fake in unit tests. [`epoll::EpollBackend`] is the
//! only production implementation.

pub mod epoll;

use std::os::fd::RawFd;

use crate::error::Result;
use crate::mask::Mask;

/// One readiness event returned from [`Backend::run_once`]: a descriptor and the bits
/// that became ready for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub mask: Mask,
}

/// A readiness-polling collaborator.
///
/// Implementors own exactly one kernel polling instance. `fd` identity is the only key
/// callers use — [`Backend`] does not need to know about watcher generations or
/// one-shot semantics; that bookkeeping lives entirely in
/// [`Loop`](crate::event_loop::Loop).
pub trait Backend {
    /// Registers `fd` for the interest bits set in `mask` (a subset of
    /// [`Mask::READABLE`], [`Mask::WRITABLE`], [`Mask::PRIO`], [`Mask::RDHUP`],
    /// [`Mask::EDGE`], [`Mask::ONE_SHOT`]; `ERR`/`HUP` are always implicitly
    /// monitored and never need to be requested).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::LoopError::Kernel`] if the underlying registration
    /// syscall fails.
    fn watch(&mut self, fd: RawFd, mask: Mask) -> Result<()>;

    /// Changes the interest bits for an already-watched `fd`. The default
    /// implementation is unwatch-then-watch, which is correct but pays two syscalls;
    /// [`epoll::EpollBackend`] overrides this with a single `EPOLL_CTL_MOD`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::LoopError::Kernel`] if the underlying syscall fails.
    fn modify(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
        self.unwatch(fd)?;
        self.watch(fd, mask)
    }

    /// Deregisters `fd`. Idempotent: unwatching an fd that was never watched, or was
    /// already unwatched, is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::LoopError::Kernel`] for failures other than "not
    /// present".
    fn unwatch(&mut self, fd: RawFd) -> Result<()>;

    /// Blocks for readiness, up to `timeout_ms` (`None` = block indefinitely, `Some(0)`
    /// = poll without blocking), appending ready events to `out`. Returns the number of
    /// events appended.
    ///
    /// A spurious wake (e.g. `EINTR`) returns `Ok(0)` rather than an error — the
    /// dispatch engine treats zero events as "re-tick the clock and recompute the
    /// timeout", which is also correct for a genuine empty timeout expiry.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::LoopError::Kernel`] for failures other than `EINTR`.
    fn run_once(&mut self, timeout_ms: Option<i32>, out: &mut Vec<ReadyEvent>) -> Result<usize>;
}
