// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! End-to-end scenarios driven against real kernel pipes and timers, mirroring §8 of
//! the dispatch-contract specification this crate implements.

use std::cell::{Cell, RefCell};
use std::os::fd::{BorrowedFd, IntoRawFd, RawFd};
use std::rc::Rc;

use evloop::{Loop, WatchSpec};
use nix::unistd::{close, pipe, read as nix_read, write as nix_write};
use pretty_assertions::assert_eq;

fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    // SAFETY: the fd outlives this borrow for the duration of the single call it's
    // used in; these tests close every fd explicitly once the `Loop` is done with it.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

#[test]
fn timer_order_and_cancel() {
    let mut lp = Loop::new().expect("Loop::new");
    let order = Rc::new(RefCell::new(Vec::new()));

    let o = Rc::clone(&order);
    lp.after(0.010, move |_| o.borrow_mut().push("A"));
    let o = Rc::clone(&order);
    lp.after(0.030, move |_| o.borrow_mut().push("B"));
    let o = Rc::clone(&order);
    let x = lp.after(0.020, move |_| o.borrow_mut().push("X"));
    assert!(lp.cancel(x));
    let o = Rc::clone(&order);
    lp.after(0.060, move |lp| {
        o.borrow_mut().push("stop");
        lp.stop();
    });

    lp.run().expect("run");
    assert_eq!(*order.borrow(), vec!["A", "B", "stop"]);
}

#[test]
fn pipe_readable_reads_and_stops() {
    let mut lp = Loop::new().expect("Loop::new");
    let (rd, wr) = pipe().expect("pipe");
    let rd_fd = rd.into_raw_fd();
    let wr_fd = wr.into_raw_fd();

    let received = Rc::new(RefCell::new(Vec::new()));
    let received_cb = Rc::clone(&received);
    let spec = WatchSpec {
        on_read: Some(Box::new(move |lp: &mut Loop, fd, _mask| {
            let mut buf = [0u8; 4096];
            let n = nix_read(borrow(fd), &mut buf).expect("read");
            received_cb.borrow_mut().extend_from_slice(&buf[..n]);
            lp.stop();
        })),
        one_shot: true,
        ..WatchSpec::default()
    };
    lp.watch(rd_fd, spec).expect("watch");

    lp.after(0.020, move |_| {
        nix_write(borrow(wr_fd), b"hello").expect("write");
    });

    lp.run().expect("run");
    assert_eq!(&*received.borrow(), b"hello");

    let _ = close(rd_fd);
    let _ = close(wr_fd);
}

#[test]
fn one_shot_watcher_fires_at_most_once() {
    let mut lp = Loop::new().expect("Loop::new");
    let (rd, wr) = pipe().expect("pipe");
    let rd_fd = rd.into_raw_fd();
    let wr_fd = wr.into_raw_fd();

    let fire_count = Rc::new(Cell::new(0u32));
    let fire_count_cb = Rc::clone(&fire_count);
    let spec = WatchSpec {
        on_read: Some(Box::new(move |_lp: &mut Loop, fd, _mask| {
            fire_count_cb.set(fire_count_cb.get() + 1);
            let mut buf = [0u8; 1];
            let _ = nix_read(borrow(fd), &mut buf);
        })),
        one_shot: true,
        ..WatchSpec::default()
    };
    lp.watch(rd_fd, spec).expect("watch");

    lp.after(0.020, move |_| {
        nix_write(borrow(wr_fd), b"a").expect("write a");
    });
    lp.after(0.040, move |_| {
        nix_write(borrow(wr_fd), b"b").expect("write b");
    });
    lp.after(0.080, |lp| lp.stop());

    lp.run().expect("run");
    assert_eq!(fire_count.get(), 1);

    let _ = close(rd_fd);
    let _ = close(wr_fd);
}

#[test]
fn replacing_a_watcher_never_invokes_the_old_callbacks() {
    let mut lp = Loop::new().expect("Loop::new");
    let (rd, wr) = pipe().expect("pipe");
    let rd_fd = rd.into_raw_fd();
    let wr_fd = wr.into_raw_fd();

    let old_called = Rc::new(Cell::new(false));
    let new_called = Rc::new(Cell::new(false));

    let old_called_cb = Rc::clone(&old_called);
    lp.watch(
        rd_fd,
        WatchSpec {
            on_read: Some(Box::new(move |_, _, _| old_called_cb.set(true))),
            ..WatchSpec::default()
        },
    )
    .expect("first watch");

    let new_called_cb = Rc::clone(&new_called);
    lp.watch(
        rd_fd,
        WatchSpec {
            on_read: Some(Box::new(move |lp: &mut Loop, fd, _mask| {
                new_called_cb.set(true);
                let mut buf = [0u8; 8];
                let _ = nix_read(borrow(fd), &mut buf);
                lp.stop();
            })),
            ..WatchSpec::default()
        },
    )
    .expect("replacement watch");

    nix_write(borrow(wr_fd), b"x").expect("write");
    lp.run().expect("run");

    assert!(new_called.get());
    assert!(!old_called.get());

    let _ = close(rd_fd);
    let _ = close(wr_fd);
}
