// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The error taxonomy for this crate. See [`LoopError`] for the four kinds
//! and when each is returned.

/// Errors produced by [`crate::Loop`] and its adaptors.
///
/// Each variant is one of the four kinds this crate distinguishes:
///
/// | Variant                         | Kind          | Recoverable?                 |
/// | :------------------------------ | :------------ | :---------------------------- |
/// | [`Usage`]                       | `UsageError`  | Yes — fix the call site        |
/// | [`Kernel`]                      | `KernelError` | Maybe — depends on the errno   |
/// | [`NotAChild`]                   | `StateError`  | No — wrong pid for `reap=true` |
/// | [`WakeupCounterSaturated`]       | `ResourceError` | Maybe — drain the counter    |
///
/// Operating on an already-cancelled `Watcher`/subscription/timer-id handle is not a
/// `LoopError` at all: per §4.5/§8's idempotence laws, every such operation
/// (`unwatch`, the `set_on_*`/`enable_*`/`disable_*` mutators, `cancel`) simply returns
/// `false`/is a no-op for a stale handle rather than failing.
///
/// Construction/registration failures ([`Usage`], [`Kernel`] at `watch`/`signal`/`pid`
/// time) leave no partial state: the operation either fully succeeds or the Loop's
/// tables are untouched. Errors raised while tearing down a registration (`unwatch`,
/// backend `modify`) are never turned into a `LoopError` — they are swallowed per
/// spec's teardown policy; see [`crate::event_loop::Loop::unwatch`].
///
/// [`Usage`]: Self::Usage
/// [`Kernel`]: Self::Kernel
/// [`NotAChild`]: Self::NotAChild
/// [`WakeupCounterSaturated`]: Self::WakeupCounterSaturated
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum LoopError {
    /// A caller-supplied argument was missing, unknown, or otherwise malformed.
    #[error("usage error: {0}")]
    #[diagnostic(
        code(evloop::usage),
        help("check the argument against the operation's documented options")
    )]
    Usage(&'static str),

    /// A syscall failed during registration, modification, reaping, or drain.
    #[error("kernel error during {operation}")]
    #[diagnostic(
        code(evloop::kernel),
        help("check the wrapped errno; `ulimit -n`/`-u` are common culprits for EMFILE/EAGAIN")
    )]
    Kernel {
        /// What the Loop was trying to do when the syscall failed.
        operation: &'static str,
        #[source]
        source: nix::Error,
    },

    /// `pid()` was asked to reap a pid that is not a child of this process.
    #[error("pid {pid} is not a waitable child of this process")]
    #[diagnostic(
        code(evloop::not_a_child),
        help("pass reap = false to receive a notification without waiting on the pid")
    )]
    NotAChild {
        /// The pid that could not be reaped.
        pid: u32,
    },

    /// The wakeup counter saturated (approaching `u64::MAX`) while non-blocking.
    #[error("wakeup counter saturated")]
    #[diagnostic(
        code(evloop::wakeup_saturated),
        help("call drain() more often relative to signal()")
    )]
    WakeupCounterSaturated,
}

pub type Result<T> = std::result::Result<T, LoopError>;
