// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll signalfd timerfd eventfd pidfd

//! A single-threaded, level/edge-triggered readiness and timer event loop for Linux.
//!
//! This crate composes five kernel mechanisms — `epoll`, `timerfd`, `signalfd`,
//! `eventfd`, and `pidfd` — behind one [`Watcher`](watcher::Watcher) abstraction with
//! frozen dispatch semantics:
//!
//! - [`event_loop::Loop`] — the dispatch engine. Owns the watcher table, the
//!   [`scheduler::Scheduler`], the [`kernel_timer::KernelTimer`], and the
//!   [`backend::Backend`].
//! - [`clock`] — a monotonic time source with a per-iteration cached "now".
//! - [`scheduler`] — a min-heap of absolute monotonic deadlines with cancellation.
//! - [`kernel_timer`] — the single `timerfd` the loop arms at the next deadline.
//! - [`backend`] — the readiness-polling seam (`epoll` in production).
//! - [`watcher`] — per-descriptor registration state.
//! - [`signal_adaptor`], [`wakeup_adaptor`], [`pid_adaptor`] — signal delivery,
//!   cross-thread wakeups, and process-exit notification, each expressed as an
//!   ordinary readable descriptor registered on the dispatch engine.
//!
//! This crate is Linux-only and deliberately does not abstract over other platforms,
//! does not take ownership of user-supplied descriptors, and does not use legacy
//! signal-handler slots — see the crate's `README.md` for the full design rationale.
//!
//! # Example
//!
//! ```no_run
//! use evloop::Loop;
//!
//! let mut lp = Loop::new().expect("epoll_create1");
//! lp.after(0.02, |lp| lp.stop());
//! lp.run().expect("run");
//! ```

// https://github.com/rust-lang/rust-clippy
// https://rust-lang.github.io/rust-clippy/master/index.html
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![cfg_attr(not(test), deny(clippy::unwrap_in_result))]

pub mod backend;
pub mod clock;
pub mod error;
pub mod event_loop;
pub mod kernel_timer;
pub mod mask;
pub mod pid_adaptor;
pub mod scheduler;
pub mod signal_adaptor;
pub mod wakeup_adaptor;
pub mod watcher;

pub use error::{LoopError, Result};
pub use event_loop::Loop;
pub use mask::Mask;
pub use watcher::{WatchSpec, Watcher, WatcherHandle};
