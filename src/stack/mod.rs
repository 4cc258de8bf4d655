// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Downstream collaborator interface: the wrapper over the kernel-bypass
//! stack and its edge-triggered readiness notifier. This module defines the
//! contract as two traits and ships one concrete, runnable implementation
//! ([`libc_stack::LibcStack`]) over raw `libc` sockets and Linux `epoll`. A
//! real DPDK/f-stack binding is out of scope here; see `DESIGN.md`.

pub mod libc_stack;

use crate::fail::Fail;
use crate::slice::{OwnedSharedSlice, SharedSlice};
use bitflags::bitflags;
use std::os::unix::io::RawFd;

/// Opaque socket handle.
pub type Handle = RawFd;

bitflags! {
    /// Readiness bitmask carried by a notifier event and by registration
    /// calls.
    pub struct Readiness: u32 {
        const IN  = 0b001;
        const OUT = 0b010;
        const ERR = 0b100;
    }
}

/// One readiness event drained from the notifier.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub handle: Handle,
    pub readiness: Readiness,
}

/// Address family a socket is created for, since a kernel-bypass stack needs
/// to know this up front rather than inferring it from the address passed to
/// a later `bind`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    pub fn of(addr: std::net::SocketAddr) -> Self {
        if addr.is_ipv4() {
            Family::Inet
        } else {
            Family::Inet6
        }
    }
}

/// The non-blocking socket primitives the core requires of the userspace
/// stack.
pub trait NetStack: Send + Sync {
    fn socket(&self, family: Family) -> Result<Handle, Fail>;
    fn bind(&self, handle: Handle, addr: std::net::SocketAddr) -> Result<(), Fail>;
    fn listen(&self, handle: Handle, backlog: i32) -> Result<(), Fail>;

    /// Non-blocking accept. `Ok(None)` means EAGAIN (no pending connection).
    fn accept(&self, handle: Handle) -> Result<Option<Handle>, Fail>;

    /// Non-blocking read. `Ok(None)` means EAGAIN.
    fn read(&self, handle: Handle, buf: &mut SharedSlice) -> Result<Option<usize>, Fail>;

    /// Non-blocking write. `Ok(None)` means EAGAIN.
    fn write(&self, handle: Handle, buf: &SharedSlice) -> Result<Option<usize>, Fail>;

    fn close(&self, handle: Handle) -> Result<(), Fail>;

    fn local_addr(&self, handle: Handle) -> Result<std::net::SocketAddr, Fail>;
    fn peer_addr(&self, handle: Handle) -> Result<std::net::SocketAddr, Fail>;

    /// Allocates a shared-memory region the stack can DMA to/from. On
    /// `LibcStack` this is a plain heap allocation (see module docs).
    fn alloc_shared(&self, cap: usize) -> OwnedSharedSlice {
        OwnedSharedSlice::zeroed(cap)
    }

    /// Enters the stack's run loop, invoking `tick` once per iteration until
    /// it returns `false`. `tick` must never block except in the single
    /// "wait on the submission queue" step the worker performs internally.
    /// Takes a `&mut dyn FnMut` rather than `impl FnMut` so the trait stays
    /// object-safe — the worker only ever holds `Arc<dyn NetStack>`.
    fn run(&self, tick: &mut dyn FnMut() -> bool) {
        while tick() {}
    }
}

/// Thin wrapper over the stack's edge-triggered readiness API, keyed by
/// socket handle.
pub trait EventNotifier: Send + Sync {
    fn ctl_add(&self, handle: Handle, mask: Readiness) -> Result<(), Fail>;
    fn ctl_mod(&self, handle: Handle, mask: Readiness) -> Result<(), Fail>;
    fn ctl_del(&self, handle: Handle) -> Result<(), Fail>;

    /// Waits up to `timeout_ms` (`None` = block forever, `Some(0)` = return
    /// immediately) for readiness events, appending at most `events.capacity()`
    /// of them to `events`.
    fn wait(&self, events: &mut Vec<Event>, timeout_ms: Option<i32>) -> Result<(), Fail>;

    fn close(&self) -> Result<(), Fail>;
}
