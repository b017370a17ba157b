// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Signal delivery on the loop via `signalfd(2)`, replacing legacy signal-handler
//! slots entirely.
//!
//! Per §4.7/§9, the blocked-signal mask is process-wide and grows monotonically for
//! the life of the `Loop` — there is no unblocking on [`SignalSubscription::cancel`].
//! Cancelling only stops *this* crate's dispatch for that signum; the kernel keeps
//! queuing (and coalescing) the now-blocked signal regardless.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::rc::Rc;

use nix::sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::error::{LoopError, Result};
use crate::event_loop::Loop;

/// `cb(loop, signum, count_in_batch, data)`.
pub type SignalCallback = Box<dyn FnMut(&mut Loop, i32, u32, &mut dyn std::any::Any)>;

struct Entry {
    cb: Rc<RefCell<SignalCallback>>,
    data: Rc<RefCell<Box<dyn std::any::Any>>>,
    active: Rc<Cell<bool>>,
}

/// Lazily-opened signalfd plus a per-signum handler map.
pub struct SignalAdaptor {
    fd: SignalFd,
    mask: SigSet,
    entries: HashMap<i32, Entry>,
}

impl std::fmt::Debug for SignalAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalAdaptor")
            .field("registered_signums", &self.entries.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SignalAdaptor {
    /// Opens a signalfd with an empty mask and blocks nothing yet; the mask grows as
    /// signals are registered via [`subscribe`](Self::subscribe).
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] if `signalfd(2)` fails.
    pub fn new() -> Result<Self> {
        let mask = SigSet::empty();
        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK).map_err(|source| {
            LoopError::Kernel {
                operation: "signalfd_create",
                source,
            }
        })?;
        Ok(Self {
            fd,
            mask,
            entries: HashMap::new(),
        })
    }

    /// Registers `cb` for every signal number in `sigs`, replacing any previous mapping
    /// for each. Extends the process-wide blocked mask and reapplies it to the
    /// signalfd. Returns a subscription whose `cancel`/`is_active` act on a shared flag
    /// consulted at drain time — the kernel-level block is never reverted.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Usage`] if `sigs` is empty, or [`LoopError::Kernel`] if
    /// `sigprocmask(2)` or the signalfd re-arm fails.
    pub fn subscribe(
        &mut self,
        sigs: &[Signal],
        cb: SignalCallback,
        data: Box<dyn std::any::Any>,
    ) -> Result<SignalSubscription> {
        if sigs.is_empty() {
            return Err(LoopError::Usage("signal() requires at least one signum"));
        }
        for sig in sigs {
            self.mask.add(*sig);
        }
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&self.mask), None).map_err(|source| {
            LoopError::Kernel {
                operation: "sigprocmask",
                source,
            }
        })?;
        self.fd.set_mask(&self.mask).map_err(|source| LoopError::Kernel {
            operation: "signalfd_settime",
            source,
        })?;

        let shared_cb = Rc::new(RefCell::new(cb));
        let shared_data = Rc::new(RefCell::new(data));
        let active = Rc::new(Cell::new(true));
        for sig in sigs {
            self.entries.insert(
                *sig as i32,
                Entry {
                    cb: Rc::clone(&shared_cb),
                    data: Rc::clone(&shared_data),
                    active: Rc::clone(&active),
                },
            );
        }
        Ok(SignalSubscription {
            signums: sigs.iter().map(|s| *s as i32).collect(),
            active,
        })
    }

    /// Drains all pending signalfd records to `EAGAIN`, coalesces per-signum counts,
    /// and dispatches at most one callback per signum in ascending signum order.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] for a read failure other than `EAGAIN`.
    pub fn dispatch(&mut self, lp: &mut Loop) -> Result<()> {
        let mut counts: HashMap<i32, u32> = HashMap::new();
        loop {
            match self.fd.read_signal() {
                Ok(Some(info)) => {
                    *counts.entry(info.ssi_signo as i32).or_insert(0) += 1;
                }
                Ok(None) => break,
                Err(nix::Error::EAGAIN) => break,
                Err(source) => {
                    return Err(LoopError::Kernel {
                        operation: "signalfd_read",
                        source,
                    });
                }
            }
        }
        let mut signums: Vec<i32> = counts.keys().copied().collect();
        signums.sort_unstable();
        for signum in signums {
            let count = counts[&signum];
            let Some(entry) = self.entries.get(&signum) else {
                continue;
            };
            if !entry.active.get() {
                continue;
            }
            let cb = Rc::clone(&entry.cb);
            let data = Rc::clone(&entry.data);
            let mut cb = cb.borrow_mut();
            let mut data = data.borrow_mut();
            (cb)(lp, signum, count, &mut **data);
        }
        Ok(())
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

/// A handle to a per-signum (or multi-signum) signal registration.
///
/// `cancel`/`is_active` act purely on a shared in-process flag; they never touch the
/// process-wide signal mask, which only ever grows (§4.7).
#[derive(Debug, Clone)]
pub struct SignalSubscription {
    signums: Vec<i32>,
    active: Rc<Cell<bool>>,
}

impl SignalSubscription {
    #[must_use]
    pub fn signals(&self) -> &[i32] {
        &self.signums
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Idempotent: returns whether this call actually transitioned the subscription
    /// from active to inactive.
    pub fn cancel(&self) -> bool {
        self.active.replace(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_rejects_empty_signum_list() {
        let mut adaptor = SignalAdaptor::new().expect("signalfd_create");
        let err = adaptor.subscribe(&[], Box::new(|_, _, _, _| {}), Box::new(()));
        assert!(matches!(err, Err(LoopError::Usage(_))));
    }

    #[test]
    fn subscription_cancel_is_idempotent() {
        let mut adaptor = SignalAdaptor::new().expect("signalfd_create");
        let sub = adaptor
            .subscribe(&[Signal::SIGUSR1], Box::new(|_, _, _, _| {}), Box::new(()))
            .expect("subscribe");
        assert!(sub.is_active());
        assert!(sub.cancel());
        assert!(!sub.is_active());
        assert!(!sub.cancel());
    }
}
