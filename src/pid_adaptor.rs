// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Process-exit notification via `pidfd_open(2)`, delivered as ordinary readability.
//!
//! Unlike [`SignalAdaptor`](crate::signal_adaptor::SignalAdaptor) and
//! [`WakeupAdaptor`](crate::wakeup_adaptor::WakeupAdaptor), there is no persistent
//! singleton here: each [`crate::event_loop::Loop::pid`] call opens its own pidfd, owned
//! by the `Loop`'s watcher table for the lifetime of the subscription.

use std::cell::Cell;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};

use crate::error::{LoopError, Result};
use crate::event_loop::Loop;
use crate::watcher::WatcherHandle;

/// `cb(loop, pid, status_or_none, data)`.
pub type PidCallback = Box<dyn FnMut(&mut Loop, u32, Option<ExitStatus>, &mut dyn std::any::Any)>;

/// The terminal status of a reaped child, per §8's "standard wait-status predicates".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

/// Opens a non-blocking pidfd for `pid` via the raw `pidfd_open(2)` syscall (no
/// wrapper exists in `nix` or `libc` beyond the syscall number).
///
/// # Errors
///
/// Returns [`LoopError::Kernel`] if the syscall fails (commonly `ESRCH` for an unknown
/// pid).
pub fn open_pidfd(pid: u32) -> Result<OwnedFd> {
    // SAFETY: `pidfd_open` takes a pid and a flags word (0 here; PIDFD_NONBLOCK
    // requires a kernel new enough that few environments guarantee it, so
    // non-blocking is layered on at the `waitid(WNOHANG)` call site instead) and
    // returns an owned fd or -1/errno.
    let raw = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    if raw < 0 {
        return Err(LoopError::Kernel {
            operation: "pidfd_open",
            source: nix::Error::last(),
        });
    }
    // SAFETY: a non-negative return from pidfd_open is a valid, owned fd.
    Ok(unsafe { OwnedFd::from_raw_fd(raw as RawFd) })
}

/// Attempts a non-blocking reap via `waitid(2)` with `WEXITED | WNOHANG`.
///
/// Returns `Ok(None)` if the child has not exited yet (caller should wait for the next
/// readiness event).
///
/// # Errors
///
/// Returns [`LoopError::NotAChild`] if `pid` is not a waitable child of this process
/// (`ECHILD`), or [`LoopError::Kernel`] for any other `waitid` failure.
pub fn try_reap(pidfd: BorrowedFd<'_>, pid: u32) -> Result<Option<ExitStatus>> {
    match waitid(Id::PIDFd(pidfd), WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG) {
        Ok(WaitStatus::Exited(_, code)) => Ok(Some(ExitStatus::Exited(code))),
        Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(ExitStatus::Signaled(sig as i32))),
        Ok(_) => Ok(None),
        Err(nix::Error::ECHILD) => Err(LoopError::NotAChild { pid }),
        Err(source) => Err(LoopError::Kernel {
            operation: "waitid",
            source,
        }),
    }
}

/// A handle to a one-shot process-exit subscription.
#[derive(Debug, Clone)]
pub struct PidSubscription {
    pub(crate) pid: u32,
    pub(crate) watcher: WatcherHandle,
    pub(crate) active: Rc<Cell<bool>>,
}

impl PidSubscription {
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Idempotent: removes the underlying Watcher (dropping the pidfd) and the
    /// per-pid registry entry (if it still points at this subscription), and returns
    /// whether this call actually transitioned the subscription from active to
    /// inactive.
    pub fn cancel(&self, lp: &mut Loop) -> bool {
        if !self.active.replace(false) {
            return false;
        }
        lp.unwatch(self.watcher);
        lp.remove_pid_subscription_if_current(self.pid, &self.active);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_reap_on_live_self_returns_not_a_child() {
        let pid = std::process::id();
        let pidfd = open_pidfd(pid).expect("pidfd_open");
        let err = try_reap(pidfd.as_fd(), pid);
        assert!(matches!(err, Err(LoopError::NotAChild { .. })));
    }
}
