// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The dispatch engine: owns the [`Scheduler`], the [`KernelTimer`], the
//! [`Backend`], and the watcher table, and enforces the frozen dispatch contract
//! described on [`Loop::run_once`].

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use nix::sys::signal::Signal;
use tracing::{debug, trace, warn};

use crate::backend::epoll::EpollBackend;
use crate::backend::{Backend, ReadyEvent};
use crate::clock::Clock;
use crate::error::{LoopError, Result};
use crate::kernel_timer::KernelTimer;
use crate::mask::Mask;
use crate::pid_adaptor::{self, PidCallback, PidSubscription};
use crate::scheduler::Scheduler;
use crate::signal_adaptor::{SignalAdaptor, SignalCallback, SignalSubscription};
use crate::wakeup_adaptor::WakeupAdaptor;
use crate::watcher::{Callback, WatchSpec, Watcher, WatcherHandle};

fn seconds_to_ns(seconds: f64) -> i64 {
    (seconds * 1_000_000_000.0) as i64
}

/// The event loop.
///
/// One `Loop` owns one [`Backend`] instance, one [`Clock`], one [`Scheduler`], one
/// [`KernelTimer`], and the watcher table keyed by raw descriptor. It is not `Send` or
/// `Sync` by construction (its collaborators hold raw OS resources meant for a single
/// execution context); cross-thread wakeups go through the separate
/// [`WakeupAdaptor`] handle returned by [`Loop::waker`].
pub struct Loop {
    backend: Box<dyn Backend>,
    clock: Clock,
    scheduler: Scheduler,
    kernel_timer: KernelTimer,
    watchers: HashMap<RawFd, Watcher>,
    /// Descriptors registered through the public `watch()` API, as opposed to the ones
    /// this Loop registers for its own internal bookkeeping (the kernel-timer fd, the
    /// signalfd, per-pid pidfds). Drives [`Loop::watcher_count`]/[`Loop::contains`].
    user_fds: HashSet<RawFd>,
    /// Pidfds opened by [`Loop::pid`], owned here so cancellation/one-shot teardown
    /// closes them.
    pid_fds: HashMap<RawFd, OwnedFd>,
    /// At most one live [`PidSubscription`] per pid (§3/§4.9's replacement-semantics
    /// invariant), mirroring the per-signum `entries` map [`SignalAdaptor`] keeps.
    pid_subscriptions: HashMap<u32, PidSubscription>,
    running: bool,
    next_generation: u64,
    signal_adaptor: Option<SignalAdaptor>,
    wakeup_adaptor: Option<WakeupAdaptor>,
    /// An asynchronous failure (currently only `PidAdaptor`'s "not a child" case, or a
    /// drain-time kernel error from an adaptor) raised from inside a dispatch callback
    /// frame, surfaced from the next `run_once` return per §7.
    pending_error: Option<LoopError>,
    ready_buf: Vec<ReadyEvent>,
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("watcher_count", &self.watcher_count())
            .field("timer_count", &self.timer_count())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Loop {
    /// Builds a `Loop` with the default epoll-backed [`Backend`].
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] if any of the underlying kernel objects
    /// (`epoll_create1`, `timerfd_create`) fail to open.
    pub fn new() -> Result<Self> {
        Self::with_backend(Box::new(EpollBackend::new()?))
    }

    /// Builds a `Loop` over an injected [`Backend`] — the seam unit tests use to
    /// exercise the dispatch contract without real kernel descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] if `timerfd_create` fails, or if registering the
    /// internal kernel-timer watcher with `backend` fails.
    pub fn with_backend(backend: Box<dyn Backend>) -> Result<Self> {
        let kernel_timer = KernelTimer::new()?;
        let mut lp = Self {
            backend,
            clock: Clock::new(),
            scheduler: Scheduler::new(),
            kernel_timer,
            watchers: HashMap::new(),
            user_fds: HashSet::new(),
            pid_fds: HashMap::new(),
            pid_subscriptions: HashMap::new(),
            // `run_once` is usable standalone (embedded in a host loop) without ever
            // calling `run()`; `stop()` is what latches this to `false`, not
            // construction.
            running: true,
            next_generation: 1,
            signal_adaptor: None,
            wakeup_adaptor: None,
            pending_error: None,
            ready_buf: Vec::new(),
        };
        lp.clock.tick();
        let timer_fd = lp.kernel_timer.as_raw_fd();
        let spec = WatchSpec {
            on_read: Some(Box::new(|lp: &mut Loop, _fd, _mask| {
                lp.handle_kernel_timer_tick();
            })),
            ..WatchSpec::default()
        };
        lp.register(timer_fd, spec, false)?;
        Ok(lp)
    }

    // ---- watcher table -------------------------------------------------------

    /// (Re)registers `fd`. If a Watcher already exists for `fd`, it is atomically
    /// cancelled first (replacement semantics per §4.5/§4.6) — its callbacks will
    /// never be invoked again, even for a kernel event already queued against the old
    /// registration.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] if the Backend registration syscall fails; no
    /// partial state is left (the old Watcher, if any, is still gone per replacement
    /// semantics, matching §7's "construction/registration... leave no partial state"
    /// for the new registration specifically).
    pub fn watch(&mut self, fd: RawFd, spec: WatchSpec) -> Result<WatcherHandle> {
        self.register(fd, spec, true)
    }

    fn register(&mut self, fd: RawFd, spec: WatchSpec, track_as_user: bool) -> Result<WatcherHandle> {
        if self.watchers.contains_key(&fd) {
            self.cancel_internal(fd);
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let mut watcher = Watcher::new(fd, spec.edge_triggered, spec.one_shot, generation);
        watcher.on_read = spec.on_read;
        watcher.on_write = spec.on_write;
        watcher.on_error = spec.on_error;
        watcher.read_enabled = watcher.on_read.is_some();
        watcher.write_enabled = watcher.on_write.is_some();
        watcher.error_enabled = watcher.on_error.is_some();
        watcher.data = spec.data;
        watcher.recompute_interest();
        self.backend.watch(fd, watcher.interest)?;
        self.watchers.insert(fd, watcher);
        if track_as_user {
            self.user_fds.insert(fd);
        }
        trace!(fd, track_as_user, "registered watcher");
        Ok(WatcherHandle { fd, generation })
    }

    /// Removes the Watcher for `handle`'s descriptor. Idempotent: a stale handle (the
    /// descriptor was already replaced or unwatched) returns `false`.
    pub fn unwatch(&mut self, handle: WatcherHandle) -> bool {
        match self.watchers.get(&handle.fd) {
            Some(w) if w.generation == handle.generation => {
                self.cancel_internal(handle.fd);
                true
            }
            _ => false,
        }
    }

    /// Removes `fd` from the watcher table and the Backend, swallowing any
    /// backend-removal error per §7's teardown policy, and drops any owned pidfd.
    fn cancel_internal(&mut self, fd: RawFd) {
        if self.watchers.remove(&fd).is_some() {
            if let Err(err) = self.backend.unwatch(fd) {
                debug!(fd, ?err, "backend unwatch failed during teardown, ignoring");
            }
        }
        self.user_fds.remove(&fd);
        self.pid_fds.remove(&fd);
    }

    /// Whether `fd` has a live, user-installed Watcher (internal bookkeeping
    /// descriptors are not counted).
    #[must_use]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.user_fds.contains(&fd)
    }

    /// Alias for [`Loop::contains`]; reads better at some call sites.
    #[must_use]
    pub fn is_watching(&self, fd: RawFd) -> bool {
        self.contains(fd)
    }

    /// Number of live, user-installed watchers.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.user_fds.len()
    }

    /// Number of live (not yet fired, not cancelled) timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.scheduler.live_count()
    }

    // ---- watcher mutators (§4.5) ------------------------------------------------

    /// Installs (or, with `None`, removes) `handle`'s read callback. Removing a
    /// handler disables read dispatch; installing one does not re-enable a direction
    /// that was explicitly disabled via [`Loop::disable_read`].
    ///
    /// Returns `false` if `handle` is stale (already replaced or unwatched).
    pub fn set_on_read(&mut self, handle: WatcherHandle, cb: Option<Callback>) -> bool {
        self.mutate_watcher(handle, |w| {
            if cb.is_none() {
                w.read_enabled = false;
            }
            w.on_read = cb;
        })
    }

    /// See [`Loop::set_on_read`].
    pub fn set_on_write(&mut self, handle: WatcherHandle, cb: Option<Callback>) -> bool {
        self.mutate_watcher(handle, |w| {
            if cb.is_none() {
                w.write_enabled = false;
            }
            w.on_write = cb;
        })
    }

    /// See [`Loop::set_on_read`]. Error readiness is still reported by the Backend
    /// regardless of `error_enabled`; this only gates whether `error_cb` is invoked.
    pub fn set_on_error(&mut self, handle: WatcherHandle, cb: Option<Callback>) -> bool {
        self.mutate_watcher(handle, |w| {
            if cb.is_none() {
                w.error_enabled = false;
            }
            w.on_error = cb;
        })
    }

    /// Enables read dispatch for `handle` (a no-op on the Backend interest set until a
    /// read callback is also installed). Returns `false` if `handle` is stale.
    pub fn enable_read(&mut self, handle: WatcherHandle) -> bool {
        self.mutate_watcher(handle, |w| w.read_enabled = true)
    }

    /// Disables read dispatch for `handle` without removing the callback.
    pub fn disable_read(&mut self, handle: WatcherHandle) -> bool {
        self.mutate_watcher(handle, |w| w.read_enabled = false)
    }

    /// Enables write dispatch for `handle`.
    pub fn enable_write(&mut self, handle: WatcherHandle) -> bool {
        self.mutate_watcher(handle, |w| w.write_enabled = true)
    }

    /// Disables write dispatch for `handle` without removing the callback.
    pub fn disable_write(&mut self, handle: WatcherHandle) -> bool {
        self.mutate_watcher(handle, |w| w.write_enabled = false)
    }

    /// Enables error dispatch for `handle`.
    pub fn enable_error(&mut self, handle: WatcherHandle) -> bool {
        self.mutate_watcher(handle, |w| w.error_enabled = true)
    }

    /// Disables error dispatch for `handle` without removing the callback.
    pub fn disable_error(&mut self, handle: WatcherHandle) -> bool {
        self.mutate_watcher(handle, |w| w.error_enabled = false)
    }

    /// Flips `handle`'s edge-triggered flag. Per §9, this forces a kernel-level
    /// re-arm even when the effective interest bits end up unchanged.
    pub fn set_edge_triggered(&mut self, handle: WatcherHandle, edge_triggered: bool) -> bool {
        self.mutate_watcher(handle, |w| w.edge_triggered = edge_triggered)
    }

    /// Flips `handle`'s one-shot flag.
    pub fn set_one_shot(&mut self, handle: WatcherHandle, one_shot: bool) -> bool {
        self.mutate_watcher(handle, |w| w.one_shot = one_shot)
    }

    /// Replaces `handle`'s user datum.
    pub fn set_watcher_data(&mut self, handle: WatcherHandle, data: Box<dyn Any>) -> bool {
        self.mutate_watcher(handle, |w| w.data = Some(data))
    }

    /// Borrows `handle`'s user datum, if any and if `handle` is still live.
    #[must_use]
    pub fn watcher_data(&self, handle: WatcherHandle) -> Option<&dyn Any> {
        let w = self.watchers.get(&handle.fd)?;
        if w.generation != handle.generation {
            return None;
        }
        w.data.as_deref()
    }

    /// Applies `f` to the live Watcher identified by `handle`, recomputes its
    /// interest mask, and forces a Backend re-arm (toggling through `Mask::NONE`
    /// first) so an update whose effective mask is unchanged still reaches the
    /// kernel — see §9's "One-shot re-arm" design note. Returns `false` if `handle`
    /// is stale.
    fn mutate_watcher<F: FnOnce(&mut Watcher)>(&mut self, handle: WatcherHandle, f: F) -> bool {
        let Some(w) = self.watchers.get_mut(&handle.fd) else {
            return false;
        };
        if w.generation != handle.generation {
            return false;
        }
        f(w);
        w.recompute_interest();
        let fd = w.fd;
        let interest = w.interest;
        if let Err(err) = self.backend.modify(fd, Mask::NONE) {
            debug!(fd, ?err, "forced re-arm (clear) failed, continuing");
        }
        if let Err(err) = self.backend.modify(fd, interest) {
            warn!(fd, ?err, "failed to re-arm watcher after mutation");
        }
        true
    }

    // ---- dispatch --------------------------------------------------------------

    /// Applies the frozen dispatch contract to one `(fd, mask)` readiness event.
    fn dispatch_one(&mut self, fd: RawFd, mask: Mask) {
        // Step 1: resolve by fd; discard if absent. Step 2 (identity validation) has
        // no independent handle->fd oracle in this implementation beyond the table
        // key itself — a closed-then-reused fd is indistinguishable from the original
        // registration unless the user called `unwatch` first, per §9's fallback for
        // implementations without a handle query. Backend-removal errors during any
        // resulting teardown are already swallowed by `cancel_internal`.
        if !self.watchers.contains_key(&fd) {
            return;
        }

        let mut forced = false;
        if mask.contains(Mask::ERR) {
            let (has_error_cb, error_enabled, one_shot) = {
                let w = self.watchers.get(&fd).expect("checked above");
                (w.on_error.is_some(), w.error_enabled, w.one_shot)
            };
            if has_error_cb && error_enabled {
                self.invoke_error(fd, mask);
                if one_shot {
                    self.cancel_internal(fd);
                }
                return;
            }
            forced = true;
        }

        let forced_hup = mask.contains(Mask::HUP);
        let read_trig = mask.contains(Mask::READABLE) || forced || forced_hup;
        let write_trig = mask.contains(Mask::WRITABLE) || forced;

        if read_trig {
            let (has_read_cb, read_enabled) = match self.watchers.get(&fd) {
                Some(w) => (w.on_read.is_some(), w.read_enabled),
                None => return,
            };
            if has_read_cb && read_enabled {
                self.invoke_read(fd, mask);
            }
        }

        // Step 7: re-check the table between read and write — a read callback may
        // have unwatched or replaced this fd.
        if !self.watchers.contains_key(&fd) {
            return;
        }

        if write_trig {
            let (has_write_cb, write_enabled) = {
                let w = self.watchers.get(&fd).expect("checked above");
                (w.on_write.is_some(), w.write_enabled)
            };
            if has_write_cb && write_enabled {
                self.invoke_write(fd, mask);
            }
        }

        if let Some(w) = self.watchers.get(&fd) {
            if w.one_shot {
                self.cancel_internal(fd);
            }
        }
    }

    fn invoke_read(&mut self, fd: RawFd, mask: Mask) {
        self.invoke(fd, mask, |w| &mut w.on_read);
    }

    fn invoke_write(&mut self, fd: RawFd, mask: Mask) {
        self.invoke(fd, mask, |w| &mut w.on_write);
    }

    fn invoke_error(&mut self, fd: RawFd, mask: Mask) {
        self.invoke(fd, mask, |w| &mut w.on_error);
    }

    /// Takes the selected callback slot out of the Watcher (so the callback can freely
    /// mutate `self`, including replacing or cancelling this very Watcher), invokes
    /// it, then puts it back only if a Watcher with the *same generation* is still
    /// present at `fd` — never clobbering a replacement installed mid-callback.
    fn invoke<F>(&mut self, fd: RawFd, mask: Mask, slot: F)
    where
        F: Fn(&mut Watcher) -> &mut Option<Callback>,
    {
        let Some(w) = self.watchers.get_mut(&fd) else {
            return;
        };
        let generation = w.generation;
        let Some(mut cb) = slot(w).take() else {
            return;
        };
        cb(self, fd, mask);
        if let Some(w) = self.watchers.get_mut(&fd) {
            if w.generation == generation {
                *slot(w) = Some(cb);
            }
        }
    }

    // ---- timers ------------------------------------------------------------

    /// Schedules `cb` to run `seconds` from now (clamped to `0` for a negative delta).
    /// Rearms the kernel timer. Returns a strictly positive, never-reused timer id.
    pub fn after(&mut self, seconds: f64, cb: impl FnOnce(&mut Loop) + 'static) -> u64 {
        let deadline = self.clock.deadline_in_ns(seconds_to_ns(seconds));
        let id = self.scheduler.at_ns(deadline, Box::new(cb));
        self.rearm_kernel_timer();
        id
    }

    /// Schedules `cb` to run at the given absolute deadline on this Loop's monotonic
    /// axis (seconds since the Loop was constructed). Rearms the kernel timer.
    pub fn at(&mut self, deadline_seconds: f64, cb: impl FnOnce(&mut Loop) + 'static) -> u64 {
        let id = self.scheduler.at_ns(seconds_to_ns(deadline_seconds), Box::new(cb));
        self.rearm_kernel_timer();
        id
    }

    /// Cancels a pending timer. Idempotent: the second call on the same id returns
    /// `false`.
    pub fn cancel(&mut self, id: u64) -> bool {
        let was_live = self.scheduler.cancel(id);
        self.rearm_kernel_timer();
        was_live
    }

    fn dispatch_due_timers(&mut self) {
        let now = self.clock.now_ns();
        let expired = self.scheduler.pop_expired(now);
        for entry in expired {
            (entry.cb)(self);
        }
    }

    fn rearm_kernel_timer(&mut self) {
        let result = match self.scheduler.next_deadline_ns() {
            Some(deadline) => self.kernel_timer.arm_in(self.clock.remaining_ns(deadline)),
            None => self.kernel_timer.disarm(),
        };
        if let Err(err) = result {
            warn!(?err, "failed to rearm kernel timer");
        }
    }

    fn handle_kernel_timer_tick(&mut self) {
        if let Err(err) = self.kernel_timer.read_ticks() {
            warn!(?err, "failed to read kernel timer ticks");
        }
        self.clock.tick();
        self.dispatch_due_timers();
        self.rearm_kernel_timer();
    }

    // ---- signal adaptor ------------------------------------------------------

    /// Registers `cb` for every signal in `sigs`, lazily opening the signalfd and
    /// extending the process-wide blocked mask on first use of any new signum.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Usage`] if `sigs` is empty, or [`LoopError::Kernel`] if the
    /// signalfd or `sigprocmask` machinery fails.
    pub fn signal(
        &mut self,
        sigs: &[Signal],
        cb: SignalCallback,
        data: Box<dyn Any>,
    ) -> Result<SignalSubscription> {
        if self.signal_adaptor.is_none() {
            let adaptor = SignalAdaptor::new()?;
            let fd = adaptor.as_raw_fd();
            self.signal_adaptor = Some(adaptor);
            let spec = WatchSpec {
                on_read: Some(Box::new(|lp: &mut Loop, _fd, _mask| lp.drain_signals())),
                ..WatchSpec::default()
            };
            self.register(fd, spec, false)?;
        }
        self.signal_adaptor
            .as_mut()
            .expect("just ensured present")
            .subscribe(sigs, cb, data)
    }

    fn drain_signals(&mut self) {
        let Some(mut adaptor) = self.signal_adaptor.take() else {
            return;
        };
        if let Err(err) = adaptor.dispatch(self) {
            warn!(?err, "signal drain failed");
            self.pending_error = Some(err);
        }
        self.signal_adaptor = Some(adaptor);
    }

    // ---- wakeup adaptor ------------------------------------------------------

    /// Returns a cheaply-cloneable handle to this Loop's wakeup counter, creating it
    /// on first call. The Loop does not install a watcher on it automatically — pass
    /// the handle's fd to [`Loop::watch`] yourself if you want read notifications.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] if `eventfd(2)` fails on first call.
    pub fn waker(&mut self) -> Result<WakeupAdaptor> {
        if self.wakeup_adaptor.is_none() {
            self.wakeup_adaptor = Some(WakeupAdaptor::new()?);
        }
        Ok(self.wakeup_adaptor.as_ref().expect("just ensured present").clone())
    }

    // ---- pid adaptor -----------------------------------------------------------

    /// Subscribes to exit notification for `pid`. If `reap` (the default), a
    /// non-blocking wait is attempted on each readiness until a terminal status is
    /// available; otherwise a single notification with `status = None` is delivered
    /// on first readiness. Either way the subscription is one-shot.
    ///
    /// Replacement semantics per §4.9: re-registering for a `pid` that already has a
    /// live subscription atomically cancels the previous one (closing its pidfd and
    /// dropping its Watcher) before installing the new one, mirroring
    /// [`SignalAdaptor::subscribe`](crate::signal_adaptor::SignalAdaptor::subscribe)'s
    /// per-signum replacement.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Usage`] if `pid` is `0`, or [`LoopError::Kernel`] if
    /// `pidfd_open` fails.
    pub fn pid(
        &mut self,
        pid: u32,
        cb: PidCallback,
        data: Box<dyn Any>,
        reap: bool,
    ) -> Result<PidSubscription> {
        if pid == 0 {
            return Err(LoopError::Usage("pid() requires a positive pid"));
        }
        if let Some(previous) = self.pid_subscriptions.remove(&pid) {
            previous.cancel(self);
        }
        let pidfd = pid_adaptor::open_pidfd(pid)?;
        let fd = pidfd.as_raw_fd();
        self.pid_fds.insert(fd, pidfd);

        let active = Rc::new(Cell::new(true));
        let shared_cb: Rc<RefCell<PidCallback>> = Rc::new(RefCell::new(cb));
        let shared_data: Rc<RefCell<Box<dyn Any>>> = Rc::new(RefCell::new(data));

        let read_cb: Callback = {
            let shared_cb = Rc::clone(&shared_cb);
            let shared_data = Rc::clone(&shared_data);
            let active = Rc::clone(&active);
            Box::new(move |lp: &mut Loop, fd: RawFd, _mask: Mask| {
                dispatch_pid_event(lp, fd, pid, reap, &shared_cb, &shared_data, &active);
            })
        };
        let error_cb: Callback = {
            let shared_cb = Rc::clone(&shared_cb);
            let shared_data = Rc::clone(&shared_data);
            let active = Rc::clone(&active);
            Box::new(move |lp: &mut Loop, fd: RawFd, _mask: Mask| {
                dispatch_pid_event(lp, fd, pid, reap, &shared_cb, &shared_data, &active);
            })
        };

        let spec = WatchSpec {
            on_read: Some(read_cb),
            on_error: Some(error_cb),
            ..WatchSpec::default()
        };
        match self.register(fd, spec, false) {
            Ok(handle) => {
                let subscription = PidSubscription { pid, watcher: handle, active };
                self.pid_subscriptions.insert(pid, subscription.clone());
                Ok(subscription)
            }
            Err(err) => {
                self.pid_fds.remove(&fd);
                Err(err)
            }
        }
    }

    /// Drops `pid`'s registry entry if it still points at `active` — guards against a
    /// stale [`PidSubscription`] handle (already superseded by a later `pid()` call for
    /// the same pid) clobbering a newer, unrelated registration on cancel.
    pub(crate) fn remove_pid_subscription_if_current(&mut self, pid: u32, active: &Rc<Cell<bool>>) {
        if let Some(existing) = self.pid_subscriptions.get(&pid) {
            if Rc::ptr_eq(&existing.active, active) {
                self.pid_subscriptions.remove(&pid);
            }
        }
    }

    // ---- run loop --------------------------------------------------------------

    /// Runs one iteration: ticks the clock, dispatches due timers, rearms the kernel
    /// timer, then blocks in the Backend for up to `timeout` seconds (`None` blocks
    /// indefinitely, `Some(0.0)` polls).
    ///
    /// Does not re-enter the Backend wait if `stop()` was called while dispatching
    /// this iteration's due timers.
    ///
    /// # Errors
    ///
    /// Returns any [`LoopError`] raised by the Backend wait, or one surfaced
    /// asynchronously from an adaptor (e.g. `PidAdaptor`'s not-a-child error) during
    /// this iteration's dispatch.
    pub fn run_once(&mut self, timeout: Option<f64>) -> Result<usize> {
        self.clock.tick();
        self.dispatch_due_timers();
        self.rearm_kernel_timer();

        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }
        if !self.running {
            return Ok(0);
        }

        let timeout_ms = timeout.map(|s| (s * 1000.0).max(0.0) as i32);
        self.ready_buf.clear();
        let n = self.backend.run_once(timeout_ms, &mut self.ready_buf)?;
        let events = std::mem::take(&mut self.ready_buf);
        for event in &events {
            self.dispatch_one(event.fd, event.mask);
        }
        self.ready_buf = events;

        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }
        Ok(n)
    }

    /// Runs until [`Loop::stop`] is called.
    ///
    /// # Errors
    ///
    /// Propagates the first error from [`Loop::run_once`].
    pub fn run(&mut self) -> Result<()> {
        while self.running {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Requests that the Loop stop after the current iteration's already-pending
    /// dispatches complete. Does not itself run any callbacks.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Runs `run_once(None)` repeatedly until either [`Loop::stop`] is called or
    /// `stop_when` returns `true`. A thin composition over already-specified
    /// primitives (not a new dispatch mechanism) for embedding this Loop inside a
    /// larger host loop that wants its own exit condition.
    ///
    /// # Errors
    ///
    /// Propagates the first error from [`Loop::run_once`].
    pub fn run_until(&mut self, mut stop_when: impl FnMut() -> bool) -> Result<()> {
        while self.running && !stop_when() {
            self.run_once(None)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// Shared pid-readiness handling for both the read and error callback paths of a
/// [`Loop::pid`] subscription — exit surfaces as readability, "not our child" may
/// surface as error, and both funnel through the same reap/notify/one-shot logic.
fn dispatch_pid_event(
    lp: &mut Loop,
    fd: RawFd,
    pid: u32,
    reap: bool,
    cb: &Rc<RefCell<PidCallback>>,
    data: &Rc<RefCell<Box<dyn Any>>>,
    active: &Rc<Cell<bool>>,
) {
    if !active.get() {
        return;
    }

    if !reap {
        active.set(false);
        {
            let mut cb = cb.borrow_mut();
            let mut data = data.borrow_mut();
            (cb)(lp, pid, None, &mut **data);
        }
        lp.cancel_internal(fd);
        lp.remove_pid_subscription_if_current(pid, active);
        return;
    }

    let status = match lp.pid_fds.get(&fd) {
        Some(owned) => pid_adaptor::try_reap(owned.as_fd(), pid),
        None => return,
    };

    match status {
        Ok(Some(exit_status)) => {
            active.set(false);
            {
                let mut cb = cb.borrow_mut();
                let mut data = data.borrow_mut();
                (cb)(lp, pid, Some(exit_status), &mut **data);
            }
            lp.cancel_internal(fd);
            lp.remove_pid_subscription_if_current(pid, active);
        }
        Ok(None) => {
            // Not yet exited; wait for the next readiness event.
        }
        Err(err) => {
            active.set(false);
            lp.pending_error = Some(err);
            lp.cancel_internal(fd);
            lp.remove_pid_subscription_if_current(pid, active);
        }
    }
}
