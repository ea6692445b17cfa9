// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn spawn_runs_once() {
    let mut sched = weft::Scheduler::new();

    let c = Rc::new(RefCell::new(0));
    {
        let c2 = c.clone();
        let ok = sched.new_task(move |_task| {
            *c2.borrow_mut() += 1;
        });
        assert!(ok);
    }

    while !sched.peek() {}
    assert_eq!(*c.borrow(), 1);
}

#[test]
fn spawn_inside_spawn() {
    // A routine may spawn from its own context; the inner task must not run
    // before the outer routine's next suspension.
    let mut sched = weft::Scheduler::new();

    let log = Rc::new(RefCell::new(Vec::new()));
    {
        let log2 = log.clone();
        sched.new_task(move |task| {
            let log3 = log2.clone();
            task.owner().new_task(move |_task| {
                log3.borrow_mut().push("inner");
            });
            log2.borrow_mut().push("outer");
        });
    }

    while !sched.peek() {}
    assert_eq!(*log.borrow(), vec!["outer", "inner"]);
}

#[test]
fn spawn_ten_thousand() {
    const NUM_TASKS: u32 = 10_000;

    let params = weft::SchedulerParams {
        sq_entries: 4 * 1024,
        cq_entries: 32 * 1024,
        stack_size: 16 * 1024,
    };

    let mut sched = weft::Scheduler::with_params(&params);

    let c = Rc::new(RefCell::new(0_u32));
    for _ in 0..NUM_TASKS {
        let c2 = c.clone();
        let ok = sched.new_task(move |_task| {
            *c2.borrow_mut() += 1;
        });
        assert!(ok);
    }

    while !sched.peek() {}
    assert_eq!(*c.borrow(), NUM_TASKS);
    assert!(sched.peek());
}

#[test]
fn scheduler_inside_scheduler() {
    let mut sched = weft::Scheduler::new();

    let c = Rc::new(RefCell::new(0));
    {
        let c2 = c.clone();
        sched.new_task(move |_task| {
            let mut inner = weft::Scheduler::new();

            let c3 = c2.clone();
            inner.new_task(move |_task| {
                *c3.borrow_mut() += 1;
            });

            while !inner.peek() {}
        });
    }

    while !sched.peek() {}
    assert_eq!(*c.borrow(), 1);
}

#[test]
fn drop_drains_pending_tasks() {
    // A single peek is not enough to run a freshly spawned task; the
    // scheduler's drop must finish the job.
    let c = Rc::new(RefCell::new(0));

    {
        let mut sched = weft::Scheduler::new();
        let c2 = c.clone();
        sched.new_task(move |_task| {
            *c2.borrow_mut() += 1;
        });
        let _ = sched.peek();
    }

    assert_eq!(*c.borrow(), 1);
}
