// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Process-exit notification scenarios driven against real child processes: a
//! successful `reap = true` exit-status delivery, `reap = false`'s `status = None`
//! path, `PidSubscription::cancel()` actually stopping dispatch, and the §4.9
//! replacement-semantics contract for re-registering the same pid.

use std::cell::{Cell, RefCell};
use std::process::{Child, Command};
use std::rc::Rc;

use evloop::Loop;
use evloop::pid_adaptor::ExitStatus;
use pretty_assertions::assert_eq;

fn spawn_exit(code: i32) -> Child {
    Command::new("sh")
        .args(["-c", &format!("exit {code}")])
        .spawn()
        .expect("spawn sh -c exit")
}

fn spawn_sleep(seconds: f64) -> Child {
    Command::new("sleep")
        .arg(format!("{seconds}"))
        .spawn()
        .expect("spawn sleep")
}

#[test]
fn reap_true_delivers_exit_status() {
    let mut lp = Loop::new().expect("Loop::new");
    let mut child = spawn_exit(7);
    let pid = child.id();

    let observed: Rc<RefCell<Option<ExitStatus>>> = Rc::new(RefCell::new(None));
    let observed_cb = Rc::clone(&observed);
    lp.pid(
        pid,
        Box::new(move |lp: &mut Loop, _pid, status, _data| {
            *observed_cb.borrow_mut() = status;
            lp.stop();
        }),
        Box::new(()),
        true,
    )
    .expect("pid()");

    lp.after(2.0, |lp| lp.stop());
    lp.run().expect("run");

    assert_eq!(*observed.borrow(), Some(ExitStatus::Exited(7)));
    // waitid() inside the adaptor already reaped the zombie; ignore the ECHILD this
    // would otherwise race against.
    let _ = child.wait();
}

#[test]
fn reap_false_delivers_none_status() {
    let mut lp = Loop::new().expect("Loop::new");
    let mut child = spawn_exit(0);
    let pid = child.id();

    let fired = Rc::new(Cell::new(false));
    let status_was_none = Rc::new(Cell::new(false));
    let fired_cb = Rc::clone(&fired);
    let status_was_none_cb = Rc::clone(&status_was_none);
    lp.pid(
        pid,
        Box::new(move |lp: &mut Loop, _pid, status, _data| {
            fired_cb.set(true);
            status_was_none_cb.set(status.is_none());
            lp.stop();
        }),
        Box::new(()),
        false,
    )
    .expect("pid()");

    lp.after(2.0, |lp| lp.stop());
    lp.run().expect("run");

    assert!(fired.get());
    assert!(status_was_none.get());

    // reap = false never waits on the child; reap it ourselves to avoid a zombie.
    let _ = child.wait();
}

#[test]
fn cancel_prevents_dispatch() {
    let mut lp = Loop::new().expect("Loop::new");
    let mut child = spawn_sleep(0.05);
    let pid = child.id();

    let fired = Rc::new(Cell::new(false));
    let fired_cb = Rc::clone(&fired);
    let sub = lp
        .pid(
            pid,
            Box::new(move |_: &mut Loop, _pid, _status, _data| fired_cb.set(true)),
            Box::new(()),
            true,
        )
        .expect("pid()");

    assert!(sub.is_active());
    assert!(sub.cancel(&mut lp));
    assert!(!sub.is_active());
    assert!(!sub.cancel(&mut lp));

    lp.after(0.3, |lp| lp.stop());
    lp.run().expect("run");

    assert!(!fired.get());
    let _ = child.wait();
}

#[test]
fn replacing_pid_subscription_cancels_previous() {
    let mut lp = Loop::new().expect("Loop::new");
    let mut child = spawn_exit(3);
    let pid = child.id();

    let first_fired = Rc::new(Cell::new(false));
    let first_fired_cb = Rc::clone(&first_fired);
    lp.pid(
        pid,
        Box::new(move |_: &mut Loop, _pid, _status, _data| first_fired_cb.set(true)),
        Box::new(()),
        true,
    )
    .expect("first pid()");

    let second_status: Rc<RefCell<Option<ExitStatus>>> = Rc::new(RefCell::new(None));
    let second_status_cb = Rc::clone(&second_status);
    lp.pid(
        pid,
        Box::new(move |lp: &mut Loop, _pid, status, _data| {
            *second_status_cb.borrow_mut() = status;
            lp.stop();
        }),
        Box::new(()),
        true,
    )
    .expect("replacement pid()");

    lp.after(2.0, |lp| lp.stop());
    lp.run().expect("run");

    assert!(!first_fired.get());
    assert_eq!(*second_status.borrow(), Some(ExitStatus::Exited(3)));
    let _ = child.wait();
}
