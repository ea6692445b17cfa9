// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc, clippy::must_use_candidate)]

extern crate generator;
extern crate io_uring;
extern crate nix;
extern crate slotmap;

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;

use generator::{Generator, Gn, Scope};
use io_uring::{opcode, squeue, types, IoUring};
use slotmap::{DefaultKey, Key, KeyData, SlotMap};

pub mod tcp;
mod time;

pub type Result<T> = std::result::Result<T, nix::Error>;

slotmap::new_key_type! {
    pub(crate) struct TaskKey;
}

//-----------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub(crate) enum OpType {
    Timeout,
    TaskSpawn { task: TaskKey, ts: types::Timespec },
    TaskReap { task: TaskKey, ts: types::Timespec },
    TaskWake { task: TaskKey, ts: types::Timespec },
    TcpConnect,
    TcpSend,
    TcpRecv,
    TcpShutdown,
    TcpListen { fd: RawFd },
    TcpCancel,
    TcpClose,
}

pub(crate) struct Op {
    pub(crate) done: bool,
    pub(crate) res: i32,
    pub(crate) task: Option<TaskKey>,
    pub(crate) op_type: OpType,
}

pub(crate) fn make_op(task: Option<TaskKey>, op_type: OpType) -> Op {
    Op {
        done: false,
        res: -1,
        task,
        op_type,
    }
}

//-----------------------------------------------------------------------------

pub(crate) struct Ops {
    entries: SlotMap<DefaultKey, Op>,
}

impl Ops {
    fn with_capacity(n: usize) -> Self {
        Self {
            entries: SlotMap::with_capacity(n),
        }
    }

    // Armed SQEs may point at timespecs stored in this table, which the
    // kernel reads at submission. Flush before the backing storage can
    // reallocate so those pointers stay valid until then.
    pub(crate) fn insert(&mut self, op: Op, ex: &Executor) -> DefaultKey {
        if self.entries.len() == self.entries.capacity() {
            ex.submit();
        }
        self.entries.insert(op)
    }

    pub(crate) fn get_mut(&mut self, key: DefaultKey) -> Option<&mut Op> {
        self.entries.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: DefaultKey) -> Op {
        self.entries.remove(key).unwrap()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//-----------------------------------------------------------------------------

pub(crate) struct TaskRec {
    gen: Option<Generator<'static, (), ()>>,
}

pub(crate) struct SchedulerFrame {
    uring: RefCell<IoUring>,
    pub(crate) io_ops: RefCell<Ops>,
    tasks: RefCell<SlotMap<TaskKey, TaskRec>>,
    pub(crate) sockets: RefCell<HashMap<RawFd, tcp::SocketRec>>,
    stack_size: usize,
}

//-----------------------------------------------------------------------------

#[derive(Clone)]
pub struct Executor {
    pub(crate) p: Rc<SchedulerFrame>,
}

impl Executor {
    pub(crate) fn submit(&self) {
        let ring = self.p.uring.borrow_mut();
        ring.submit().expect("io_uring submit");
    }

    pub(crate) fn push_sqe(&self, entry: &squeue::Entry) {
        let mut ring = self.p.uring.borrow_mut();
        loop {
            let pushed = unsafe { ring.submission().push(entry).is_ok() };
            if pushed {
                break;
            }
            ring.submit().expect("io_uring submit");
        }
    }

    pub(crate) fn take_op_result(&self, key: DefaultKey) -> i32 {
        let op = self.p.io_ops.borrow_mut().remove(key);
        assert!(op.done);
        op.res
    }

    pub fn new_task<F>(&self, routine: F) -> bool
    where
        F: FnOnce(&mut Task) + 'static,
    {
        let ex = self.clone();
        let stack_size = self.p.stack_size;

        let task = self.p.tasks.borrow_mut().insert_with_key(|key| {
            let ex = ex.clone();
            let gen = Gn::<()>::new_scoped_opt(stack_size, move |scope: Scope<'static, (), ()>| {
                let mut task = Task {
                    ex: ex.clone(),
                    key,
                    scope,
                };
                routine(&mut task);
                drop(task);
                ex.reap_task(key);
                generator::done!();
            });
            TaskRec { gen: Some(gen) }
        });

        self.arm_trampoline(make_op(
            None,
            OpType::TaskSpawn {
                task,
                ts: types::Timespec::new(),
            },
        ))
    }

    // The dying context cannot free itself; a zero-delay trampoline runs the
    // removal from the home context on a later pass.
    pub(crate) fn reap_task(&self, task: TaskKey) {
        let armed = self.arm_trampoline(make_op(
            None,
            OpType::TaskReap {
                task,
                ts: types::Timespec::new(),
            },
        ));
        assert!(armed);
    }

    pub(crate) fn wake_task(&self, task: TaskKey) {
        let armed = self.arm_trampoline(make_op(
            None,
            OpType::TaskWake {
                task,
                ts: types::Timespec::new(),
            },
        ));
        assert!(armed);
    }

    fn arm_trampoline(&self, op: Op) -> bool {
        let entry = {
            let mut io_ops = self.p.io_ops.borrow_mut();
            let key = io_ops.insert(op, self);
            let op = io_ops.get_mut(key).unwrap();

            let (OpType::TaskSpawn { ref ts, .. }
            | OpType::TaskReap { ref ts, .. }
            | OpType::TaskWake { ref ts, .. }) = op.op_type
            else {
                unreachable!()
            };

            opcode::Timeout::new(std::ptr::from_ref(ts))
                .build()
                .user_data(key.data().as_ffi())
        };

        self.push_sqe(&entry);
        true
    }

    pub(crate) fn resume_task(&self, task: TaskKey) {
        let mut gen = {
            let mut tasks = self.p.tasks.borrow_mut();
            let Some(rec) = tasks.get_mut(task) else {
                return;
            };
            rec.gen.take().expect("task resumed while running")
        };

        let _ = gen.resume();

        if let Some(rec) = self.p.tasks.borrow_mut().get_mut(task) {
            rec.gen = Some(gen);
        }
    }

    fn dispatch(&self, user_data: u64, res: i32, flags: u32) {
        let key = DefaultKey::from(KeyData::from_ffi(user_data));

        enum Next {
            Nothing,
            Resume(TaskKey),
            Reap(TaskKey),
            Accepted(RawFd),
        }

        let next = {
            let mut io_ops = self.p.io_ops.borrow_mut();
            let Some(op) = io_ops.get_mut(key) else {
                return;
            };

            match op.op_type {
                OpType::Timeout
                | OpType::TcpConnect
                | OpType::TcpSend
                | OpType::TcpRecv
                | OpType::TcpShutdown => {
                    op.res = res;
                    op.done = true;
                    Next::Resume(op.task.expect("completion with no suspended task"))
                }
                OpType::TaskSpawn { task, .. } | OpType::TaskWake { task, .. } => {
                    let _ = io_ops.remove(key);
                    Next::Resume(task)
                }
                OpType::TaskReap { task, .. } => {
                    let _ = io_ops.remove(key);
                    Next::Reap(task)
                }
                OpType::TcpListen { fd } => Next::Accepted(fd),
                OpType::TcpCancel | OpType::TcpClose => {
                    let _ = io_ops.remove(key);
                    Next::Nothing
                }
            }
        };

        match next {
            Next::Resume(task) => self.resume_task(task),
            Next::Reap(task) => {
                let _ = self.p.tasks.borrow_mut().remove(task);
            }
            Next::Accepted(fd) => tcp::on_accept(self, key, fd, res, flags),
            Next::Nothing => {}
        }
    }
}

//-----------------------------------------------------------------------------

pub struct SchedulerParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub stack_size: usize,
}

impl SchedulerParams {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sq_entries: 256,
            cq_entries: 4 * 1024,
            stack_size: 64 * 1024,
        }
    }
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self::new()
    }
}

//-----------------------------------------------------------------------------

pub struct Scheduler {
    ex: Executor,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::with_params(&SchedulerParams::new())
    }

    #[must_use]
    pub fn with_params(params: &SchedulerParams) -> Self {
        let uring = IoUring::builder()
            .setup_cqsize(params.cq_entries)
            .setup_single_issuer()
            .build(params.sq_entries)
            .expect("io_uring queue init");

        let frame = SchedulerFrame {
            uring: RefCell::new(uring),
            io_ops: RefCell::new(Ops::with_capacity(1024)),
            tasks: RefCell::new(SlotMap::with_key()),
            sockets: RefCell::new(HashMap::new()),
            stack_size: params.stack_size,
        };

        Scheduler {
            ex: Executor { p: Rc::new(frame) },
        }
    }

    #[must_use]
    pub fn get_executor(&self) -> Executor {
        self.ex.clone()
    }

    pub fn new_task<F>(&self, routine: F) -> bool
    where
        F: FnOnce(&mut Task) + 'static,
    {
        self.ex.new_task(routine)
    }

    // One non-blocking pass over the ring. Returns whether the scheduler has
    // gone idle: no in-flight operations, no live tasks, no open sockets.
    pub fn peek(&mut self) -> bool {
        let p = &self.ex.p;

        let mut batch = Vec::new();
        {
            let mut ring = p.uring.borrow_mut();
            ring.submit().expect("io_uring submit");

            let mut cq = ring.completion();
            cq.sync();
            for cqe in &mut cq {
                batch.push((cqe.user_data(), cqe.result(), cqe.flags()));
            }
        }

        for (user_data, res, flags) in batch {
            self.ex.dispatch(user_data, res, flags);
        }

        p.io_ops.borrow().is_empty()
            && p.tasks.borrow().is_empty()
            && p.sockets.borrow().is_empty()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Close-cascade: detaching every still-registered socket cancels the
        // waiters parked on them, so the drain below can finish.
        let fds: Vec<RawFd> = self.ex.p.sockets.borrow().keys().copied().collect();
        for fd in fds {
            let _ = self.ex.detach_tcp_socket(fd);
        }

        while !self.peek() {}

        self.ex.p.tasks.borrow_mut().clear();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

//-----------------------------------------------------------------------------

pub struct Task {
    pub(crate) ex: Executor,
    pub(crate) key: TaskKey,
    scope: Scope<'static, (), ()>,
}

impl Task {
    #[must_use]
    pub fn owner(&self) -> Executor {
        self.ex.clone()
    }

    // Switch to the scheduler context until a completion hands control back.
    pub(crate) fn suspend(&mut self) {
        let _ = self.scope.yield_(());
    }
}
