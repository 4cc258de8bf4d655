// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The IRQ: a one-shot rendezvous a caller thread traps on a [`crate::fd::Fd`]'s
//! waiter list and blocks on until the worker, the timer, or a close satisfies
//! it.

use crate::fail::Fail;
use crate::fd::Fd;
use crate::slice::SharedSlice;
use std::sync::{Arc, Mutex};

/// Who satisfied the IRQ. `None` while still waiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    None,
    Timer,
    Poller,
}

/// What the caller is waiting for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Input,
    Output,
    Timeout,
}

/// The outcome of a completed read/write/accept.
pub enum IrqResult {
    Count(usize),
    Accepted(Arc<Fd>),
}

/// Per-operation data, dispatched by `match` rather than dynamic dispatch.
pub enum Handler {
    Read(SharedSlice),
    Write(SharedSlice),
    Accept,
    Close,
}

impl Handler {
    /// The readiness direction this handler retries on. `Close` has none.
    pub fn signal(&self) -> Signal {
        match self {
            Handler::Read(_) => Signal::Input,
            Handler::Write(_) => Signal::Output,
            Handler::Accept => Signal::Input,
            Handler::Close => Signal::Input,
        }
    }
}

/// Mutable state of a trapped IRQ, guarded by the owning waiter list's mutex.
pub(crate) struct IrqState {
    pub src: Source,
    pub err: Option<Fail>,
    pub result: Option<IrqResult>,
    pub retry: u32,
}

impl IrqState {
    fn new() -> Self {
        Self {
            src: Source::None,
            err: None,
            result: None,
            retry: 0,
        }
    }
}

/// A trapped IRQ, shared between the caller thread blocked in `listen` and
/// the worker/timer threads that may satisfy it. `seq` is assigned by the
/// owning waiter list at trap time and never changes afterwards.
pub struct IrqCell {
    pub seq: u64,
    pub sig: Signal,
    pub handler: Mutex<Handler>,
    pub(crate) state: Mutex<IrqState>,
}

impl IrqCell {
    pub(crate) fn new(seq: u64, sig: Signal, handler: Handler) -> Arc<Self> {
        Arc::new(Self {
            seq,
            sig,
            handler: Mutex::new(handler),
            state: Mutex::new(IrqState::new()),
        })
    }

    /// Number of times the worker has re-armed this IRQ on EAGAIN.
    pub fn retry(&self) -> u32 {
        self.state.lock().unwrap().retry
    }

    pub fn bump_retry(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.retry += 1;
        state.retry
    }
}

/// Predicate family used by `WaiterList::interrupt` to pick which trapped
/// IRQs to wake. Matching by signal is the common case; timeout injection
/// additionally rewrites the error on the entries it wakes.
pub fn match_signal(sig: Signal) -> impl Fn(&IrqCell) -> bool {
    move |cell| cell.sig == sig
}

pub fn match_seq(seq: u64) -> impl Fn(&IrqCell) -> bool {
    move |cell| cell.seq == seq
}

pub fn match_all(_cell: &IrqCell) -> bool {
    true
}
