// Copyright 2025 Christian Mazakas
// Distributed under the Boost Software License, Version 1.0. (See accompanying
// file LICENSE.txt or copy at http://www.boost.org/LICENSE_1_0.txt)

use std::time::Duration;

use io_uring::{opcode, types};
use nix::errno::Errno;
use nix::libc::ETIME;
use slotmap::Key;

use crate::{make_op, OpType, Result, Task};

impl Task {
    // The timespec stays on this task's stack for the lifetime of the
    // operation; the stack is frozen while the task is suspended.
    pub fn sleep(&mut self, dur: Duration) -> Result<()> {
        let ts = types::Timespec::from(dur);

        let ex = self.ex.clone();
        let key = ex
            .p
            .io_ops
            .borrow_mut()
            .insert(make_op(Some(self.key), OpType::Timeout), &ex);

        let entry = opcode::Timeout::new(&ts)
            .build()
            .user_data(key.data().as_ffi());
        ex.push_sqe(&entry);

        self.suspend();

        let res = ex.take_op_result(key);
        if res < 0 && -res != ETIME {
            return Err(Errno::from_raw(-res));
        }
        Ok(())
    }
}
