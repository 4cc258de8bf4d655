// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-FD list of outstanding IRQs with a condition variable. Multiple OS
//! threads can be blocked on the same `Fd` at once, each parked on its own
//! trapped IRQ until the worker, the timer, or a close satisfies it.

use crate::fail::Fail;
use crate::fd::FdStatus;
use crate::irq::{Handler, IrqCell, IrqResult, Signal, Source};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub(crate) struct Inner {
    pub status: FdStatus,
    seq_counter: u64,
    entries: VecDeque<Arc<IrqCell>>,
}

/// Mutex-and-condvar rendezvous list. The status bitset lives here rather
/// than on `Fd` directly because every mutation must happen atomically with
/// the wakeup that observes it.
pub struct WaiterList {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl WaiterList {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: FdStatus::empty(),
                seq_counter: 0,
                entries: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Best-effort snapshot; authoritative checks take the lock directly.
    pub fn status(&self) -> FdStatus {
        self.inner.lock().unwrap().status
    }

    /// Traps `handler` on the list, assigning it a fresh sequence number.
    /// The caller must follow up with exactly one of [`Self::listen`] or
    /// [`Self::untrap`].
    pub(crate) fn trap(&self, sig: Signal, handler: Handler) -> (Arc<IrqCell>, MutexGuard<'_, Inner>) {
        let mut guard = self.inner.lock().unwrap();
        guard.seq_counter += 1;
        let cell = IrqCell::new(guard.seq_counter, sig, handler);
        guard.entries.push_back(cell.clone());
        (cell, guard)
    }

    pub(crate) fn untrap(&self, cell: &Arc<IrqCell>, mut guard: MutexGuard<'_, Inner>) {
        guard.entries.retain(|e| e.seq != cell.seq);
    }

    /// Blocks until `cell` is satisfied, returning its result or error.
    pub(crate) fn listen(
        &self,
        cell: &Arc<IrqCell>,
        mut guard: MutexGuard<'_, Inner>,
    ) -> Result<Option<IrqResult>, Fail> {
        loop {
            let src = cell.state.lock().unwrap().src;
            if src != Source::None {
                guard.entries.retain(|e| e.seq != cell.seq);
                let mut state = cell.state.lock().unwrap();
                return match state.err.take() {
                    Some(err) => Err(err),
                    None => Ok(state.result.take()),
                };
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Wakes every trapped entry matching `pred`, optionally stopping after
    /// the first. `before_broadcast` runs under the lock, before any waiter
    /// observes the new state — the hook status-bit mutations use.
    pub fn interrupt(
        &self,
        src: Source,
        pred: impl Fn(&IrqCell) -> bool,
        all: bool,
        before_broadcast: impl FnOnce(&mut FdStatus),
        set_err: impl Fn(&IrqCell) -> Option<Fail>,
    ) {
        let guard = self.inner.lock().unwrap();
        self.interrupt_locked(guard, src, pred, all, before_broadcast, set_err);
    }

    pub(crate) fn interrupt_locked<'a>(
        &self,
        mut guard: MutexGuard<'a, Inner>,
        src: Source,
        pred: impl Fn(&IrqCell) -> bool,
        all: bool,
        before_broadcast: impl FnOnce(&mut FdStatus),
        set_err: impl Fn(&IrqCell) -> Option<Fail>,
    ) {
        before_broadcast(&mut guard.status);
        for entry in guard.entries.iter() {
            if !pred(entry) {
                continue;
            }
            let mut state = entry.state.lock().unwrap();
            // An entry already completed (by a prior complete_one, still
            // present until `listen` dequeues it) must not be re-completed.
            if state.src == Source::None {
                state.src = src;
                if let Some(err) = set_err(entry) {
                    state.err = Some(err);
                }
            }
            drop(state);
            if !all {
                break;
            }
        }
        drop(guard);
        self.cond.notify_all();
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Removes `seq` from the waiter list without touching its state or
    /// waking anyone — used once a completion has already been posted
    /// directly to the entry, so later broad sweeps (e.g. a close) don't
    /// revisit it.
    pub fn untrap_seq(&self, seq: u64) {
        let mut guard = self.inner.lock().unwrap();
        guard.entries.retain(|e| e.seq != seq);
    }

    /// Completes exactly one trapped entry, matched by `seq`. Locks the
    /// same mutex the waiter checks under before sleeping, so the wakeup
    /// can never be lost.
    pub fn complete_one(
        &self,
        seq: u64,
        src: Source,
        outcome: Result<IrqResult, Fail>,
        before_broadcast: impl FnOnce(&mut FdStatus),
    ) {
        let mut guard = self.inner.lock().unwrap();
        before_broadcast(&mut guard.status);
        let mut outcome = Some(outcome);
        for entry in guard.entries.iter() {
            if entry.seq != seq {
                continue;
            }
            let mut state = entry.state.lock().unwrap();
            // A close or deadline timeout may have already completed this
            // entry out from under the worker; don't clobber that result.
            if state.src == Source::None {
                state.src = src;
                match outcome.take().expect("complete_one matched twice") {
                    Ok(result) => state.result = Some(result),
                    Err(err) => state.err = Some(err),
                }
            }
            break;
        }
        drop(guard);
        self.cond.notify_all();
    }
}
