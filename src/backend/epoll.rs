// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The production [`Backend`] implementation, backed by `epoll(7)`.

use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd, RawFd};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use super::{Backend, ReadyEvent};
use crate::error::{LoopError, Result};
use crate::mask::Mask;

/// Thin wrapper so `nix`'s `Epoll` (which borrows fds for the duration of a call) can be
/// handed `RawFd`s the way the rest of this crate's tables key on.
#[derive(Debug)]
pub struct EpollBackend {
    epoll: Epoll,
    /// `fd -> last-registered mask`, kept only so `modify` can be a single
    /// `EPOLL_CTL_MOD` without the caller having to resupply the previous mask.
    registered: HashMap<RawFd, Mask>,
}

impl EpollBackend {
    /// Creates a new `epoll_create1(2)` instance with `EPOLL_CLOEXEC`.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::Kernel`] if `epoll_create1(2)` fails (typically `EMFILE` or
    /// `ENFILE`).
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|source| {
            LoopError::Kernel {
                operation: "epoll_create1",
                source,
            }
        })?;
        Ok(Self {
            epoll,
            registered: HashMap::new(),
        })
    }

    fn to_epoll_flags(mask: Mask) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if mask.contains(Mask::READABLE) {
            flags |= EpollFlags::EPOLLIN;
        }
        if mask.contains(Mask::WRITABLE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        if mask.contains(Mask::PRIO) {
            flags |= EpollFlags::EPOLLPRI;
        }
        if mask.contains(Mask::RDHUP) {
            flags |= EpollFlags::EPOLLRDHUP;
        }
        if mask.contains(Mask::EDGE) {
            flags |= EpollFlags::EPOLLET;
        }
        if mask.contains(Mask::ONE_SHOT) {
            flags |= EpollFlags::EPOLLONESHOT;
        }
        flags
    }

    fn from_epoll_flags(flags: EpollFlags) -> Mask {
        let mut mask = Mask::NONE;
        if flags.contains(EpollFlags::EPOLLIN) {
            mask |= Mask::READABLE;
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            mask |= Mask::WRITABLE;
        }
        if flags.contains(EpollFlags::EPOLLPRI) {
            mask |= Mask::PRIO;
        }
        if flags.contains(EpollFlags::EPOLLRDHUP) {
            mask |= Mask::RDHUP;
        }
        if flags.contains(EpollFlags::EPOLLERR) {
            mask |= Mask::ERR;
        }
        if flags.contains(EpollFlags::EPOLLHUP) {
            mask |= Mask::HUP;
        }
        mask
    }

    fn borrow(fd: RawFd) -> BorrowedFd<'static> {
        // SAFETY: the caller (Loop) guarantees `fd` outlives this registration; epoll
        // only ever uses the fd number as an opaque key and never dereferences it.
        unsafe { BorrowedFd::borrow_raw(fd) }
    }
}

impl Backend for EpollBackend {
    fn watch(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
        let flags = Self::to_epoll_flags(mask);
        let event = EpollEvent::new(flags, fd as u64);
        self.epoll
            .add(Self::borrow(fd), event)
            .map_err(|source| LoopError::Kernel {
                operation: "epoll_ctl_add",
                source,
            })?;
        self.registered.insert(fd, mask);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
        let flags = Self::to_epoll_flags(mask);
        let event = EpollEvent::new(flags, fd as u64);
        self.epoll
            .modify(Self::borrow(fd), event)
            .map_err(|source| LoopError::Kernel {
                operation: "epoll_ctl_mod",
                source,
            })?;
        self.registered.insert(fd, mask);
        Ok(())
    }

    fn unwatch(&mut self, fd: RawFd) -> Result<()> {
        if self.registered.remove(&fd).is_none() {
            return Ok(());
        }
        match self.epoll.delete(Self::borrow(fd)) {
            Ok(()) | Err(nix::Error::ENOENT) => Ok(()),
            Err(source) => Err(LoopError::Kernel {
                operation: "epoll_ctl_del",
                source,
            }),
        }
    }

    fn run_once(&mut self, timeout_ms: Option<i32>, out: &mut Vec<ReadyEvent>) -> Result<usize> {
        let timeout = match timeout_ms {
            None => EpollTimeout::NONE,
            Some(ms) => EpollTimeout::try_from(ms).unwrap_or(EpollTimeout::MAX),
        };
        let mut events = [EpollEvent::empty(); 256];
        let n = match self.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(nix::Error::EINTR) => 0,
            Err(source) => {
                return Err(LoopError::Kernel {
                    operation: "epoll_wait",
                    source,
                });
            }
        };
        for event in &events[..n] {
            let fd = event.data() as i32;
            let mask = Self::from_epoll_flags(event.events());
            out.push(ReadyEvent { fd, mask });
        }
        Ok(n)
    }
}

impl AsFd for EpollBackend {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.epoll.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{close, pipe};
    use std::os::fd::{AsRawFd, IntoRawFd};

    #[test]
    fn watch_and_detect_readable_pipe() {
        let mut backend = EpollBackend::new().expect("epoll_create1");
        let (rd, wr) = pipe().expect("pipe");
        let rd_fd = rd.into_raw_fd();
        let wr_fd = wr.into_raw_fd();
        backend.watch(rd_fd, Mask::READABLE).expect("watch");
        nix::unistd::write(unsafe { BorrowedFd::borrow_raw(wr_fd) }, b"x").expect("write");
        let mut out = Vec::new();
        let n = backend.run_once(Some(1000), &mut out).expect("run_once");
        assert_eq!(n, 1);
        assert_eq!(out[0].fd, rd_fd);
        assert!(out[0].mask.contains(Mask::READABLE));
        let _ = close(wr_fd);
        let _ = close(rd_fd);
    }

    #[test]
    fn unwatch_is_idempotent() {
        let mut backend = EpollBackend::new().expect("epoll_create1");
        let (rd, wr) = pipe().expect("pipe");
        let rd_fd = rd.as_raw_fd();
        backend.watch(rd_fd, Mask::READABLE).expect("watch");
        backend.unwatch(rd_fd).expect("unwatch");
        backend.unwatch(rd_fd).expect("second unwatch is a no-op");
        drop(rd);
        drop(wr);
    }

    #[test]
    fn run_once_times_out_with_no_events() {
        let mut backend = EpollBackend::new().expect("epoll_create1");
        let mut out = Vec::new();
        let n = backend.run_once(Some(10), &mut out).expect("run_once");
        assert_eq!(n, 0);
        assert!(out.is_empty());
    }
}
