// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The pinned I/O worker: owns the userspace stack, drains the submission
//! queue, dispatches readiness events, and is the only thread ever allowed
//! to call into [`crate::stack::NetStack`]. The submission queue is an
//! unbounded `crossbeam_channel`.

use crate::config::Config;
use crate::fail::Fail;
use crate::fd::{Direction, Fd, FdStatus};
use crate::irq::{Handler, IrqCell, IrqResult, Signal, Source};
use crate::stack::{Event, EventNotifier, Handle, NetStack, Readiness};
use crate::timer::Timer;
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One unit of work handed to the worker by a caller thread.
pub struct Submission {
    pub fd: Arc<Fd>,
    pub irq: Arc<IrqCell>,
}

fn direction_of(cell: &IrqCell) -> Direction {
    match cell.sig {
        Signal::Output => Direction::Write,
        Signal::Input | Signal::Timeout => Direction::Read,
    }
}

pub struct Worker {
    stack: Arc<dyn NetStack>,
    notifier: Arc<dyn EventNotifier>,
    timer: Arc<Timer>,
    config: Config,
    sender: Sender<Submission>,
    receiver: crossbeam_channel::Receiver<Submission>,
    fd_table: Mutex<HashMap<Handle, Arc<Fd>>>,
    event_buf: Mutex<Vec<Event>>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn spawn(
        stack: Arc<dyn NetStack>,
        notifier: Arc<dyn EventNotifier>,
        timer: Arc<Timer>,
        config: Config,
    ) -> Arc<Self> {
        let (sender, receiver) = unbounded();
        let event_buf = Mutex::new(Vec::with_capacity(config.event_batch));
        let worker = Arc::new(Self {
            stack: stack.clone(),
            notifier,
            timer,
            config,
            sender,
            receiver,
            fd_table: Mutex::new(HashMap::new()),
            event_buf,
            running: AtomicBool::new(true),
            handle: Mutex::new(None),
        });
        let driven = worker.clone();
        let join = thread::Builder::new()
            .name("io-worker".into())
            .spawn(move || {
                stack.run(&mut || driven.run_tick());
                debug!("io-worker thread exiting");
            })
            .expect("failed to spawn io-worker thread");
        *worker.handle.lock().unwrap() = Some(join);
        worker
    }

    pub fn sender(&self) -> Sender<Submission> {
        self.sender.clone()
    }

    pub fn submit(&self, fd: Arc<Fd>, irq: Arc<IrqCell>) -> Result<(), Fail> {
        self.sender
            .send(Submission { fd, irq })
            .map_err(|_| Fail::Invalid)
    }

    pub fn register_fd(&self, fd: Arc<Fd>) {
        self.fd_table.lock().unwrap().insert(fd.handle, fd);
    }

    pub fn unregister_fd(&self, handle: Handle) {
        self.fd_table.lock().unwrap().remove(&handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(join) = self.handle.lock().unwrap().take() {
            let _ = join.join();
        }
    }

    /// One iteration of the outer loop: drain the submission queue, then
    /// either poll the notifier (if anything is registered) or block on
    /// the next submission.
    fn run_tick(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        if !self.drain_submissions() {
            return false;
        }
        if self.has_registrations() {
            self.poll_events();
        } else {
            match self.receiver.recv_timeout(Duration::from_millis(200)) {
                Ok(sub) => self.handle_submission(sub),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        true
    }

    fn has_registrations(&self) -> bool {
        !self.fd_table.lock().unwrap().is_empty()
    }

    fn drain_submissions(&self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(sub) => self.handle_submission(sub),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_submission(&self, sub: Submission) {
        let done = self.dispatch(&sub.fd, &sub.irq);
        if !done {
            sub.fd.push_in_flight(direction_of(&sub.irq), sub.irq);
        }
    }

    fn poll_events(&self) {
        let mut events = self.event_buf.lock().unwrap();
        if let Err(e) = self.notifier.wait(&mut *events, Some(0)) {
            error!("event notifier wait failed, worker thread cannot continue: {}", e);
            panic!("fatal notifier error: {}", e);
        }
        for event in events.drain(..) {
            self.dispatch_event(event);
        }
    }

    fn dispatch_event(&self, event: Event) {
        let fd = match self.fd_table.lock().unwrap().get(&event.handle).cloned() {
            Some(fd) => fd,
            None => {
                trace!("readiness event for unknown handle {}, dropping", event.handle);
                return;
            }
        };
        if event.readiness.contains(Readiness::IN) {
            for cell in fd.drain_in_flight(Direction::Read) {
                let done = self.dispatch(&fd, &cell);
                if !done {
                    fd.push_in_flight(Direction::Read, cell);
                }
            }
        }
        if event.readiness.contains(Readiness::OUT) {
            for cell in fd.drain_in_flight(Direction::Write) {
                let done = self.dispatch(&fd, &cell);
                if !done {
                    fd.push_in_flight(Direction::Write, cell);
                }
            }
        }
        if event.readiness.contains(Readiness::ERR) {
            for cell in fd.drain_all_in_flight() {
                let dir = direction_of(&cell);
                self.complete_error(&fd, &cell, Fail::Invalid, dir);
            }
        }
    }

    /// Runs one handler invocation. Returns `true` if the IRQ is complete,
    /// `false` if it needs to stay in the in-flight set awaiting readiness.
    /// `Close` is checked ahead of the closed-FD gate below so that closing
    /// an already-closed FD completes the second IRQ instead of failing it.
    fn dispatch(&self, fd: &Arc<Fd>, cell: &Arc<IrqCell>) -> bool {
        let mut handler = cell.handler.lock().unwrap();
        if matches!(&*handler, Handler::Close) {
            drop(handler);
            self.do_close(fd, cell);
            return true;
        }
        if fd.is_closed() {
            let dir = direction_of(cell);
            self.complete_error(fd, cell, Fail::Invalid, dir);
            return true;
        }
        match &mut *handler {
            Handler::Read(buf) => self.do_read(fd, cell, buf),
            Handler::Write(buf) => self.do_write(fd, cell, buf),
            Handler::Accept => self.do_accept(fd, cell),
            Handler::Close => unreachable!("handled above"),
        }
    }

    fn precheck(&self, fd: &Fd, dir: Direction) -> Option<Fail> {
        if let Err(e) = fd.is_ok() {
            return Some(e);
        }
        let status = fd.waiters.status();
        let exceeded = match dir {
            Direction::Read => status.contains(FdStatus::READ_DEADLINE_EXCEEDED),
            Direction::Write => status.contains(FdStatus::WRITE_DEADLINE_EXCEEDED),
        };
        if exceeded {
            return Some(Fail::DeadlineExceeded);
        }
        None
    }

    fn do_read(&self, fd: &Arc<Fd>, cell: &Arc<IrqCell>, buf: &mut crate::slice::SharedSlice) -> bool {
        if let Some(err) = self.precheck(fd, Direction::Read) {
            self.complete_error(fd, cell, err, Direction::Read);
            return true;
        }
        match self.stack.read(fd.handle, buf) {
            Ok(Some(0)) => {
                self.complete_error(fd, cell, Fail::Eof, Direction::Read);
                true
            }
            Ok(Some(n)) => {
                self.complete_ok(fd, cell, IrqResult::Count(n), Direction::Read);
                true
            }
            Ok(None) => {
                self.arm_retry(fd, cell, Direction::Read);
                false
            }
            Err(e) => {
                self.complete_error(fd, cell, e, Direction::Read);
                true
            }
        }
    }

    fn do_write(&self, fd: &Arc<Fd>, cell: &Arc<IrqCell>, buf: &mut crate::slice::SharedSlice) -> bool {
        if let Some(err) = self.precheck(fd, Direction::Write) {
            self.complete_error(fd, cell, err, Direction::Write);
            return true;
        }
        match self.stack.write(fd.handle, buf) {
            Ok(Some(0)) => {
                self.complete_error(fd, cell, Fail::UnexpectedEof, Direction::Write);
                true
            }
            Ok(Some(n)) => {
                self.complete_ok(fd, cell, IrqResult::Count(n), Direction::Write);
                true
            }
            Ok(None) => {
                self.arm_retry(fd, cell, Direction::Write);
                false
            }
            Err(e) => {
                self.complete_error(fd, cell, e, Direction::Write);
                true
            }
        }
    }

    fn do_accept(&self, fd: &Arc<Fd>, cell: &Arc<IrqCell>) -> bool {
        if let Some(err) = self.precheck(fd, Direction::Read) {
            self.complete_error(fd, cell, err, Direction::Read);
            return true;
        }
        match self.stack.accept(fd.handle) {
            Ok(Some(handle)) => {
                let new_fd = Fd::new(handle, fd.notifier.clone());
                self.register_fd(new_fd.clone());
                self.complete_ok(fd, cell, IrqResult::Accepted(new_fd), Direction::Read);
                true
            }
            Ok(None) => {
                self.arm_retry(fd, cell, Direction::Read);
                false
            }
            Err(e) => {
                self.complete_error(fd, cell, e, Direction::Read);
                true
            }
        }
    }

    fn do_close(&self, fd: &Arc<Fd>, cell: &Arc<IrqCell>) {
        fd.waiters.complete_one(cell.seq, Source::Poller, Ok(IrqResult::Count(0)), |_| {});
        fd.waiters.untrap_seq(cell.seq);
        if let Err(e) = fd.close(&*self.stack, &self.timer) {
            warn!("close of handle {} reported an error: {}", fd.handle, e);
        }
        self.unregister_fd(fd.handle);
    }

    fn arm_retry(&self, fd: &Arc<Fd>, cell: &Arc<IrqCell>, dir: Direction) {
        let retry = cell.bump_retry();
        if retry == 1 {
            if let Err(e) = fd.register(dir) {
                warn!("failed to register handle {} for {:?} readiness: {}", fd.handle, dir, e);
            }
        }
    }

    fn complete_ok(&self, fd: &Arc<Fd>, cell: &Arc<IrqCell>, result: IrqResult, dir: Direction) {
        if cell.retry() > 0 {
            let _ = fd.unregister(dir);
        }
        fd.waiters.complete_one(cell.seq, Source::Poller, Ok(result), |_| {});
    }

    fn complete_error(&self, fd: &Arc<Fd>, cell: &Arc<IrqCell>, err: Fail, dir: Direction) {
        if cell.retry() > 0 {
            let _ = fd.unregister(dir);
        }
        fd.waiters.complete_one(cell.seq, Source::Poller, Err(err), |_| {});
    }
}
