// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, IntoRawFd, RawFd};

use io_uring::{cqueue, opcode, types};
use nix::errno::Errno;
use nix::sys::socket::{
    bind, getsockname, listen, setsockopt, socket,
    sockopt::{ReuseAddr, ReusePort},
    AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn, SockaddrIn6,
    SockaddrStorage,
};
use slotmap::{DefaultKey, Key};

use crate::{make_op, Executor, OpType, Result, Task, TaskKey};

//-----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct SocketOpts {
    pub reuse_addr: bool,
    pub reuse_port: bool,
}

impl Default for SocketOpts {
    fn default() -> Self {
        Self {
            reuse_addr: false,
            reuse_port: false,
        }
    }
}

//-----------------------------------------------------------------------------

// At most one waiter per socket. A recv waiter lives for one in-flight recv;
// a listen waiter lives from listen() until closesocket().
pub(crate) enum Waiter {
    Recv { op: u64 },
    Listen(ListenQueue),
}

pub(crate) struct ListenQueue {
    op: u64,
    pending: VecDeque<RawFd>,
    last_status: i32,
    awaiting: Option<TaskKey>,
}

pub(crate) struct SocketRec {
    pub(crate) waiter: Option<Waiter>,
}

//-----------------------------------------------------------------------------

impl Executor {
    pub(crate) fn create_tcp_socket(&self, af: AddressFamily, opts: &SocketOpts) -> Result<RawFd> {
        let sock = socket(af, SockType::Stream, SockFlag::empty(), SockProtocol::Tcp)?;

        if opts.reuse_addr {
            setsockopt(&sock, ReuseAddr, &true)?;
        }

        if opts.reuse_port {
            setsockopt(&sock, ReusePort, &true)?;
        }

        let fd = sock.into_raw_fd();
        if !self.attach_tcp_socket(fd) {
            self.close_fd(fd);
            return Err(Errno::EEXIST);
        }

        Ok(fd)
    }

    pub(crate) fn attach_tcp_socket(&self, fd: RawFd) -> bool {
        let mut sockets = self.p.sockets.borrow_mut();
        if sockets.contains_key(&fd) {
            return false;
        }
        sockets.insert(fd, SocketRec { waiter: None });
        true
    }

    pub(crate) fn detach_tcp_socket(&self, fd: RawFd) -> Result<()> {
        let rec = self.p.sockets.borrow_mut().remove(&fd).ok_or(Errno::EBADF)?;

        match rec.waiter {
            Some(Waiter::Recv { op }) => self.cancel_op(op),
            Some(Waiter::Listen(lq)) => {
                self.cancel_op(lq.op);
                for pending_fd in lq.pending {
                    self.close_fd(pending_fd);
                }
                if let Some(task) = lq.awaiting {
                    self.wake_task(task);
                }
            }
            None => {}
        }

        self.close_fd(fd);
        Ok(())
    }

    pub(crate) fn query_tcp_socket(&self, fd: RawFd) -> bool {
        self.p.sockets.borrow().contains_key(&fd)
    }

    fn cancel_op(&self, user_data: u64) {
        let key = self
            .p
            .io_ops
            .borrow_mut()
            .insert(make_op(None, OpType::TcpCancel), self);

        let entry = opcode::AsyncCancel::new(user_data)
            .build()
            .user_data(key.data().as_ffi());
        self.push_sqe(&entry);
    }

    pub(crate) fn close_fd(&self, fd: RawFd) {
        let key = self
            .p
            .io_ops
            .borrow_mut()
            .insert(make_op(None, OpType::TcpClose), self);

        let entry = opcode::Close::new(types::Fd(fd))
            .build()
            .user_data(key.data().as_ffi());
        self.push_sqe(&entry);
    }

    // Needed for wildcard-port binds, where the OS picks the port.
    pub fn local_port(&self, fd: RawFd) -> Result<u16> {
        let addr = getsockname::<SockaddrStorage>(fd)?;

        if let Some(sin) = addr.as_sockaddr_in() {
            return Ok(sin.port());
        }

        if let Some(sin6) = addr.as_sockaddr_in6() {
            return Ok(sin6.port());
        }

        Err(Errno::EAFNOSUPPORT)
    }
}

//-----------------------------------------------------------------------------

fn arm_listen(ex: &Executor, fd: RawFd) -> u64 {
    let key = ex
        .p
        .io_ops
        .borrow_mut()
        .insert(make_op(None, OpType::TcpListen { fd }), ex);

    let user_data = key.data().as_ffi();
    let entry = opcode::AcceptMulti::new(types::Fd(fd))
        .build()
        .user_data(user_data);
    ex.push_sqe(&entry);

    user_data
}

pub(crate) fn on_accept(ex: &Executor, key: DefaultKey, fd: RawFd, res: i32, flags: u32) {
    let more = cqueue::more(flags);

    // the terminal CQE retires the multishot op
    if !more {
        let _ = ex.p.io_ops.borrow_mut().remove(key);
    }

    let mut stray = None;
    let mut task = None;
    let mut rearm = false;

    {
        let mut sockets = ex.p.sockets.borrow_mut();
        match sockets.get_mut(&fd).and_then(|rec| rec.waiter.as_mut()) {
            Some(Waiter::Listen(lq)) => {
                if res < 0 {
                    lq.last_status = res;
                } else {
                    lq.pending.push_back(res);
                    rearm = !more;
                }
                task = lq.awaiting.take();
            }
            _ => {
                // listener detached while this completion was in flight
                if res >= 0 {
                    stray = Some(res);
                }
            }
        }
    }

    if let Some(stray_fd) = stray {
        ex.close_fd(stray_fd);
    }

    if rearm {
        let op = arm_listen(ex, fd);
        let mut sockets = ex.p.sockets.borrow_mut();
        if let Some(Waiter::Listen(lq)) = sockets.get_mut(&fd).and_then(|rec| rec.waiter.as_mut()) {
            lq.op = op;
        }
    }

    if let Some(task) = task {
        ex.resume_task(task);
    }
}

//-----------------------------------------------------------------------------

fn sockaddr_storage(addr: SocketAddr) -> SockaddrStorage {
    match addr {
        SocketAddr::V4(v4) => SockaddrStorage::from(v4),
        SocketAddr::V6(v6) => SockaddrStorage::from(v6),
    }
}

fn sockaddr_parts(addr: &SockaddrStorage) -> (*const nix::libc::sockaddr, nix::libc::socklen_t) {
    if let Some(sin) = addr.as_sockaddr_in() {
        let len = std::mem::size_of_val(sin).try_into().unwrap();
        return (std::ptr::from_ref(sin).cast(), len);
    }

    if let Some(sin6) = addr.as_sockaddr_in6() {
        let len = std::mem::size_of_val(sin6).try_into().unwrap();
        return (std::ptr::from_ref(sin6).cast(), len);
    }

    unreachable!()
}

//-----------------------------------------------------------------------------

impl Task {
    pub fn socket(
        &mut self,
        af: AddressFamily,
        ty: SockType,
        protocol: SockProtocol,
    ) -> Result<RawFd> {
        if ty != SockType::Stream || protocol != SockProtocol::Tcp {
            return Err(Errno::EPROTONOSUPPORT);
        }

        self.ex.create_tcp_socket(af, &SocketOpts::default())
    }

    pub fn socket_with_opts(&mut self, af: AddressFamily, opts: &SocketOpts) -> Result<RawFd> {
        self.ex.create_tcp_socket(af, opts)
    }

    pub fn bind(&mut self, s: RawFd, addr: SocketAddr) -> Result<()> {
        if !self.ex.query_tcp_socket(s) {
            return Err(Errno::EBADF);
        }

        match addr {
            SocketAddr::V4(v4) => bind(s, &SockaddrIn::from(v4)),
            SocketAddr::V6(v6) => bind(s, &SockaddrIn6::from(v6)),
        }
    }

    pub fn listen(&mut self, s: RawFd, backlog: i32) -> Result<()> {
        {
            let sockets = self.ex.p.sockets.borrow();
            let rec = sockets.get(&s).ok_or(Errno::EBADF)?;
            if rec.waiter.is_some() {
                return Err(Errno::EBUSY);
            }
        }

        let fd = unsafe { BorrowedFd::borrow_raw(s) };
        listen(&fd, Backlog::new(backlog)?)?;

        let op = arm_listen(&self.ex, s);

        let mut sockets = self.ex.p.sockets.borrow_mut();
        let rec = sockets.get_mut(&s).ok_or(Errno::EBADF)?;
        rec.waiter = Some(Waiter::Listen(ListenQueue {
            op,
            pending: VecDeque::new(),
            last_status: 0,
            awaiting: None,
        }));

        Ok(())
    }

    pub fn accept(&mut self, s: RawFd) -> Result<RawFd> {
        if let Some(fd) = self.accept_stub(s)? {
            return Ok(fd);
        }

        // park until the next arrival, a listener error, or a detach
        {
            let mut sockets = self.ex.p.sockets.borrow_mut();
            let rec = sockets.get_mut(&s).ok_or(Errno::EBADF)?;
            let Some(Waiter::Listen(lq)) = rec.waiter.as_mut() else {
                return Err(Errno::EINVAL);
            };
            if lq.awaiting.is_some() {
                return Err(Errno::EBUSY);
            }
            lq.awaiting = Some(self.key);
        }

        self.suspend();

        // single retry after the wakeup
        match self.accept_stub(s)? {
            Some(fd) => Ok(fd),
            None => Err(Errno::EAGAIN),
        }
    }

    // Drain one entry from the pending queue and register it.
    fn accept_stub(&mut self, s: RawFd) -> Result<Option<RawFd>> {
        loop {
            let fd = {
                let mut sockets = self.ex.p.sockets.borrow_mut();
                let rec = sockets.get_mut(&s).ok_or(Errno::EBADF)?;
                let Some(Waiter::Listen(lq)) = rec.waiter.as_mut() else {
                    return Err(Errno::EINVAL);
                };

                if lq.awaiting == Some(self.key) {
                    lq.awaiting = None;
                }

                if lq.last_status != 0 {
                    return Err(Errno::from_raw(-lq.last_status));
                }

                match lq.pending.pop_front() {
                    Some(fd) => fd,
                    None => return Ok(None),
                }
            };

            if self.ex.attach_tcp_socket(fd) {
                return Ok(Some(fd));
            }

            self.ex.close_fd(fd);
        }
    }

    pub fn connect(&mut self, s: RawFd, addr: SocketAddr) -> Result<()> {
        if !self.ex.query_tcp_socket(s) {
            return Err(Errno::EBADF);
        }

        let addr = sockaddr_storage(addr);
        let (addr_ptr, addr_len) = sockaddr_parts(&addr);

        let ex = self.ex.clone();
        let key = ex
            .p
            .io_ops
            .borrow_mut()
            .insert(make_op(Some(self.key), OpType::TcpConnect), &ex);

        let entry = opcode::Connect::new(types::Fd(s), addr_ptr, addr_len)
            .build()
            .user_data(key.data().as_ffi());
        ex.push_sqe(&entry);

        self.suspend();

        let res = ex.take_op_result(key);
        if res < 0 {
            return Err(Errno::from_raw(-res));
        }
        Ok(())
    }

    // Completion-status semantics: Ok(()) means the single write completed,
    // not that every byte of a short write was retried.
    pub fn send(&mut self, s: RawFd, buf: &[u8]) -> Result<()> {
        if !self.ex.query_tcp_socket(s) {
            return Err(Errno::EBADF);
        }

        let ex = self.ex.clone();
        let key = ex
            .p
            .io_ops
            .borrow_mut()
            .insert(make_op(Some(self.key), OpType::TcpSend), &ex);

        let entry = opcode::Send::new(types::Fd(s), buf.as_ptr(), buf.len().try_into().unwrap())
            .build()
            .user_data(key.data().as_ffi());
        ex.push_sqe(&entry);

        self.suspend();

        let res = ex.take_op_result(key);
        if res < 0 {
            return Err(Errno::from_raw(-res));
        }
        Ok(())
    }

    // One read into the caller's buffer. Ok(0) is EOF. A second recv on the
    // same socket while one is in flight fails with EBUSY.
    pub fn recv(&mut self, s: RawFd, buf: &mut [u8]) -> Result<usize> {
        let ex = self.ex.clone();

        let key = {
            let mut sockets = ex.p.sockets.borrow_mut();
            let rec = sockets.get_mut(&s).ok_or(Errno::EBADF)?;
            if rec.waiter.is_some() {
                return Err(Errno::EBUSY);
            }

            let key = ex
                .p
                .io_ops
                .borrow_mut()
                .insert(make_op(Some(self.key), OpType::TcpRecv), &ex);

            rec.waiter = Some(Waiter::Recv {
                op: key.data().as_ffi(),
            });
            key
        };

        let entry = opcode::Recv::new(types::Fd(s), buf.as_mut_ptr(), buf.len().try_into().unwrap())
            .build()
            .user_data(key.data().as_ffi());
        ex.push_sqe(&entry);

        self.suspend();

        let res = ex.take_op_result(key);

        if let Some(rec) = ex.p.sockets.borrow_mut().get_mut(&s) {
            if matches!(rec.waiter, Some(Waiter::Recv { op }) if op == key.data().as_ffi()) {
                rec.waiter = None;
            }
        }

        if res < 0 {
            return Err(Errno::from_raw(-res));
        }
        Ok(res.try_into().unwrap())
    }

    pub fn shutdown(&mut self, s: RawFd, how: i32) -> Result<()> {
        if !self.ex.query_tcp_socket(s) {
            return Err(Errno::EBADF);
        }

        let ex = self.ex.clone();
        let key = ex
            .p
            .io_ops
            .borrow_mut()
            .insert(make_op(Some(self.key), OpType::TcpShutdown), &ex);

        let entry = opcode::Shutdown::new(types::Fd(s), how)
            .build()
            .user_data(key.data().as_ffi());
        ex.push_sqe(&entry);

        self.suspend();

        let res = ex.take_op_result(key);
        if res < 0 {
            return Err(Errno::from_raw(-res));
        }
        Ok(())
    }

    pub fn closesocket(&mut self, s: RawFd) -> Result<()> {
        self.ex.detach_tcp_socket(s)
    }
}
