// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The file-descriptor object: binds a stack-level socket handle to its
//! readiness state, waiter list, reference counts, notifier registration,
//! and per-direction deadline context.

use crate::fail::Fail;
use crate::irq::{IrqCell, Signal, Source};
use crate::stack::{EventNotifier, Handle, Readiness};
use crate::timer::{Job, Timer, TimerHandle};
use crate::waiter_list::WaiterList;
use bitflags::bitflags;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

bitflags! {
    /// Status bits, mutated only inside `WaiterList::interrupt`'s
    /// `before_broadcast` phase.
    pub struct FdStatus: u32 {
        const READABLE               = 0b0000_0001;
        const WRITEABLE              = 0b0000_0010;
        const READY                  = 0b0000_0100;
        const CONNECTED               = 0b0000_1000;
        const ACCEPTED                = 0b0001_0000;
        const ERROR                   = 0b0010_0000;
        const CLOSED                  = 0b0100_0000;
        const READ_DEADLINE_EXCEEDED  = 0b1000_0000;
        const WRITE_DEADLINE_EXCEEDED = 0b1_0000_0000;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

struct DeadlineInner {
    deadline: Option<Instant>,
    seq: u64,
    task: Option<TimerHandle>,
}

/// One per direction per FD. Bound to a timer task only while a deadline is
/// set and the direction is actively in use (ref count > 0); `prepare` on
/// the 0→1 ref-count edge re-reads the deadline and binds it if one is
/// pending.
pub struct DeadlineContext {
    inner: Mutex<DeadlineInner>,
}

impl DeadlineContext {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DeadlineInner {
                deadline: None,
                seq: 0,
                task: None,
            }),
        }
    }

    pub fn is_exceeded_now(&self) -> bool {
        matches!(self.inner.lock().unwrap().deadline, Some(d) if d <= Instant::now())
    }

    fn current_seq(&self) -> u64 {
        self.inner.lock().unwrap().seq
    }

    /// Sets (or, with `None`, clears) the deadline and clears the
    /// direction's sticky `*_DEADLINE_EXCEEDED` bit. Rebinds the timer task
    /// only if `dir`'s ref count is currently non-zero; an idle connection
    /// (no caller presently blocked in `read`/`write`) has its timer armed
    /// lazily by `prepare` on the next call instead. Used directly by
    /// `SetDeadline` and indirectly by `prepare` when a pending deadline
    /// needs to be armed for the first time.
    pub fn rebind(&self, deadline: Option<Instant>, fd: &Arc<Fd>, dir: Direction, timer: &Timer) {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let seq = inner.seq;
        if let Some(task) = inner.task.take() {
            timer.remove(task);
        }
        inner.deadline = deadline;
        let active = match dir {
            Direction::Read => fd.read_refs.load(Ordering::SeqCst) > 0,
            Direction::Write => fd.write_refs.load(Ordering::SeqCst) > 0,
        };
        if let (Some(when), true) = (deadline, active) {
            let fd = fd.clone();
            let job: Job = Box::new(move || fd.on_deadline(dir, seq));
            inner.task = Some(timer.add(when, job));
        }
        drop(inner);
        let status_bit = match dir {
            Direction::Read => FdStatus::READ_DEADLINE_EXCEEDED,
            Direction::Write => FdStatus::WRITE_DEADLINE_EXCEEDED,
        };
        fd.waiters.interrupt(
            Source::Timer,
            |_cell| false,
            true,
            move |status| status.remove(status_bit),
            |_| None,
        );
    }

    /// Arms the timer for the current deadline if one is pending and not
    /// already bound. No-op if there is no deadline or it is already bound.
    pub fn prepare(&self, fd: &Arc<Fd>, dir: Direction, timer: &Timer) {
        let (deadline, already_bound) = {
            let inner = self.inner.lock().unwrap();
            (inner.deadline, inner.task.is_some())
        };
        if deadline.is_some() && !already_bound {
            self.rebind(deadline, fd, dir, timer);
        }
    }

    pub fn unbind(&self, timer: &Timer) {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        if let Some(task) = inner.task.take() {
            timer.remove(task);
        }
        inner.deadline = None;
    }
}

/// Binds a userspace-stack socket handle to its readiness/waiter/deadline
/// state. Always held behind an `Arc`; IRQs themselves carry no reference
/// back to their owning `Fd`, only a `seq` the owning waiter list matches on.
pub struct Fd {
    pub handle: Handle,
    pub waiters: WaiterList,
    in_flight_read: Mutex<VecDeque<Arc<IrqCell>>>,
    in_flight_write: Mutex<VecDeque<Arc<IrqCell>>>,
    event_mask: Mutex<Readiness>,
    pub read_refs: AtomicU64,
    pub write_refs: AtomicU64,
    pub read_waits: AtomicU64,
    pub write_waits: AtomicU64,
    pub read_deadline: DeadlineContext,
    pub write_deadline: DeadlineContext,
    pub notifier: Arc<dyn EventNotifier>,
}

impl Fd {
    pub fn new(handle: Handle, notifier: Arc<dyn EventNotifier>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            waiters: WaiterList::new(),
            in_flight_read: Mutex::new(VecDeque::new()),
            in_flight_write: Mutex::new(VecDeque::new()),
            event_mask: Mutex::new(Readiness::empty()),
            read_refs: AtomicU64::new(0),
            write_refs: AtomicU64::new(0),
            read_waits: AtomicU64::new(0),
            write_waits: AtomicU64::new(0),
            read_deadline: DeadlineContext::new(),
            write_deadline: DeadlineContext::new(),
            notifier,
        })
    }

    pub fn is_ok(&self) -> Result<(), Fail> {
        let status = self.waiters.status();
        if status.contains(FdStatus::CLOSED) || status.contains(FdStatus::ERROR) {
            return Err(Fail::Invalid);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.waiters.status().contains(FdStatus::CLOSED)
    }

    fn in_flight(&self, dir: Direction) -> &Mutex<VecDeque<Arc<IrqCell>>> {
        match dir {
            Direction::Read => &self.in_flight_read,
            Direction::Write => &self.in_flight_write,
        }
    }

    pub fn push_in_flight(&self, dir: Direction, cell: Arc<IrqCell>) {
        self.in_flight(dir).lock().unwrap().push_back(cell);
    }

    /// Removes and returns all in-flight entries for `dir`, dropping any
    /// already satisfied by a close or timeout since they were queued.
    pub fn drain_in_flight(&self, dir: Direction) -> Vec<Arc<IrqCell>> {
        let mut queue = self.in_flight(dir).lock().unwrap();
        let mut out = Vec::with_capacity(queue.len());
        while let Some(cell) = queue.pop_front() {
            if cell.state.lock().unwrap().src == Source::None {
                out.push(cell);
            }
        }
        out
    }

    /// Drains both directions' in-flight sets (used on ERR events and close).
    pub fn drain_all_in_flight(&self) -> Vec<Arc<IrqCell>> {
        let mut out = self.drain_in_flight(Direction::Read);
        out.extend(self.drain_in_flight(Direction::Write));
        out
    }

    fn wait_counter(&self, dir: Direction) -> &AtomicU64 {
        match dir {
            Direction::Read => &self.read_waits,
            Direction::Write => &self.write_waits,
        }
    }

    /// Registers interest in `dir`'s readiness, issuing `ctl_add`/`ctl_mod`
    /// on the 0→1 edge only.
    pub fn register(&self, dir: Direction) -> Result<(), Fail> {
        let prev = self.wait_counter(dir).fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            self.sync_registration()?;
        }
        Ok(())
    }

    /// Drops interest in `dir`, issuing `ctl_mod`/`ctl_del` on the 1→0 edge.
    pub fn unregister(&self, dir: Direction) -> Result<(), Fail> {
        let prev = self.wait_counter(dir).fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.sync_registration()?;
        }
        Ok(())
    }

    fn sync_registration(&self) -> Result<(), Fail> {
        let closed = self.is_closed();
        let mut mask = self.event_mask.lock().unwrap();
        let want = if closed {
            Readiness::empty()
        } else {
            let mut r = Readiness::ERR;
            if self.read_waits.load(Ordering::SeqCst) > 0 {
                r |= Readiness::IN;
            }
            if self.write_waits.load(Ordering::SeqCst) > 0 {
                r |= Readiness::OUT;
            }
            r
        };
        if want.is_empty() {
            if !mask.is_empty() {
                self.notifier.ctl_del(self.handle)?;
            }
            *mask = Readiness::empty();
        } else if mask.is_empty() {
            self.notifier.ctl_add(self.handle, want)?;
            *mask = want;
        } else if *mask != want {
            self.notifier.ctl_mod(self.handle, want)?;
            *mask = want;
        }
        Ok(())
    }

    /// Timer callback. Ignored if superseded by a later
    /// `set_deadline`/`set_read_deadline`/`set_write_deadline` call. The seq
    /// compare runs inside `before_broadcast`, under the same waiter-list
    /// lock that guards the status mutation, so a `rebind` racing this
    /// callback can't leave a stale timeout through: either `rebind`'s seq
    /// bump is visible here and this callback backs off, or it isn't yet and
    /// `rebind`'s own bit-clearing broadcast is still queued behind this one.
    fn on_deadline(&self, dir: Direction, seq: u64) {
        let ctx = match dir {
            Direction::Read => &self.read_deadline,
            Direction::Write => &self.write_deadline,
        };
        let sig = match dir {
            Direction::Read => Signal::Input,
            Direction::Write => Signal::Output,
        };
        let status_bit = match dir {
            Direction::Read => FdStatus::READ_DEADLINE_EXCEEDED,
            Direction::Write => FdStatus::WRITE_DEADLINE_EXCEEDED,
        };
        let stale = Cell::new(false);
        self.waiters.interrupt(
            Source::Timer,
            |cell| !stale.get() && cell.sig == sig,
            true,
            |status| {
                if ctx.current_seq() == seq {
                    status.insert(status_bit);
                } else {
                    stale.set(true);
                }
            },
            |_| Some(Fail::DeadlineExceeded),
        );
    }

    /// Closes the FD: idempotent, unregisters from the notifier, unbinds
    /// both deadline contexts, and wakes every trapped IRQ with `Invalid`.
    pub fn close(
        self: &Arc<Self>,
        stack: &dyn crate::stack::NetStack,
        timer: &Timer,
    ) -> Result<(), Fail> {
        if self.is_closed() {
            return Ok(());
        }
        {
            let mut mask = self.event_mask.lock().unwrap();
            if !mask.is_empty() {
                let _ = self.notifier.ctl_del(self.handle);
                *mask = Readiness::empty();
            }
        }
        self.read_deadline.unbind(timer);
        self.write_deadline.unbind(timer);
        let result = stack.close(self.handle);
        self.waiters.interrupt(
            Source::Poller,
            crate::irq::match_all,
            true,
            |status| status.insert(FdStatus::CLOSED),
            |_| Some(Fail::Invalid),
        );
        result
    }
}
