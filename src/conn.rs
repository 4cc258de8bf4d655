// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Connection adapter: the caller-facing stream-socket handle. Reads and
//! writes submit IRQs to the worker and block on them; each direction has
//! its own lock and scratch buffer, so a read and a write on the same
//! connection never contend with each other.

use crate::buffer::ScratchBuffer;
use crate::config::Config;
use crate::fail::Fail;
use crate::fd::{Direction, Fd};
use crate::irq::{Handler, IrqResult};
use crate::stack::NetStack;
use crate::timer::Timer;
use crate::worker::Worker;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub struct Connection {
    fd: Arc<Fd>,
    stack: Arc<dyn NetStack>,
    worker: Arc<Worker>,
    timer: Arc<Timer>,
    read_buf: Mutex<ScratchBuffer>,
    write_buf: Mutex<ScratchBuffer>,
    read_seq: AtomicU64,
    write_seq: AtomicU64,
}

impl Connection {
    pub(crate) fn new(
        fd: Arc<Fd>,
        stack: Arc<dyn NetStack>,
        worker: Arc<Worker>,
        timer: Arc<Timer>,
        config: &Config,
    ) -> Self {
        Self {
            fd,
            stack,
            worker,
            timer,
            read_buf: Mutex::new(ScratchBuffer::with_capacity(config.buffer_capacity)),
            write_buf: Mutex::new(ScratchBuffer::with_capacity(config.buffer_capacity)),
            read_seq: AtomicU64::new(0),
            write_seq: AtomicU64::new(0),
        }
    }

    /// Three-phase trap/submit/listen protocol shared by every operation
    /// that needs the worker.
    fn submit_and_listen(&self, handler: Handler) -> Result<Option<IrqResult>, Fail> {
        let sig = handler.signal();
        let (cell, guard) = self.fd.waiters.trap(sig, handler);
        if let Err(e) = self.worker.submit(self.fd.clone(), cell.clone()) {
            self.fd.waiters.untrap(&cell, guard);
            return Err(e);
        }
        self.fd.waiters.listen(&cell, guard)
    }

    pub fn read(&self, dst: &mut [u8]) -> Result<usize, Fail> {
        self.read_seq.fetch_add(1, Ordering::Relaxed);
        let mut buf = self.read_buf.lock().unwrap();
        self.fd.read_refs.fetch_add(1, Ordering::SeqCst);
        let result = self.read_locked(&mut buf, dst);
        self.fd.read_refs.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn read_locked(&self, buf: &mut ScratchBuffer, dst: &mut [u8]) -> Result<usize, Fail> {
        self.fd.read_deadline.prepare(&self.fd, Direction::Read, &self.timer);
        if self.fd.read_deadline.is_exceeded_now() {
            return Err(Fail::DeadlineExceeded);
        }
        let mut total = 0usize;
        while total < dst.len() {
            if !buf.is_empty() {
                total += buf.read(&mut dst[total..]);
                continue;
            }
            match self.submit_and_listen(Handler::Read(buf.free_view())) {
                Ok(Some(IrqResult::Count(n))) => buf.commit(n),
                Ok(_) => unreachable!("read handler always completes with a byte count"),
                Err(e) => {
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    /// Returns `(bytes delivered, error)`. On a short write the error is
    /// still reported alongside the partial count.
    pub fn write(&self, src: &[u8]) -> (usize, Result<(), Fail>) {
        self.write_seq.fetch_add(1, Ordering::Relaxed);
        let mut buf = self.write_buf.lock().unwrap();
        self.fd.write_refs.fetch_add(1, Ordering::SeqCst);
        let result = self.write_locked(&mut buf, src);
        self.fd.write_refs.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn write_locked(&self, buf: &mut ScratchBuffer, src: &[u8]) -> (usize, Result<(), Fail>) {
        self.fd.write_deadline.prepare(&self.fd, Direction::Write, &self.timer);
        if self.fd.write_deadline.is_exceeded_now() {
            return (0, Err(Fail::DeadlineExceeded));
        }
        let mut sent = 0usize;
        while sent < src.len() {
            sent += buf.append(&src[sent..]);
            while !buf.is_empty() {
                match self.submit_and_listen(Handler::Write(buf.data_view())) {
                    Ok(Some(IrqResult::Count(n))) => buf.move_cursor(n),
                    Ok(_) => unreachable!("write handler always completes with a byte count"),
                    Err(e) => return (sent - buf.len(), Err(e)),
                }
            }
        }
        (sent, Ok(()))
    }

    pub fn close(&self) -> Result<(), Fail> {
        self.submit_and_listen(Handler::Close)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Fail> {
        self.stack.local_addr(self.fd.handle)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, Fail> {
        self.stack.peer_addr(self.fd.handle)
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.fd.read_deadline.rebind(deadline, &self.fd, Direction::Read, &self.timer);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.fd.write_deadline.rebind(deadline, &self.fd, Direction::Write, &self.timer);
    }
}
