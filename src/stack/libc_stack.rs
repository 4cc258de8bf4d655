// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Concrete [`NetStack`]/[`EventNotifier`] backend over raw `libc` sockets
//! and Linux `epoll`.

use super::{Event, EventNotifier, Family, Handle, NetStack, Readiness};
use crate::fail::Fail;
use crate::slice::SharedSlice;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

fn is_eagain(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK
    )
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(last_os_error());
        }
    }
    Ok(())
}

fn sockaddr_from(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::new(ip.into(), port))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {}", family),
        )),
    }
}

/// Userspace-stack stand-in built directly on raw sockets.
#[derive(Default)]
pub struct LibcStack;

impl LibcStack {
    pub fn new() -> Self {
        Self
    }
}

impl NetStack for LibcStack {
    fn socket(&self, family: Family) -> Result<Handle, Fail> {
        let af = match family {
            Family::Inet => libc::AF_INET,
            Family::Inet6 => libc::AF_INET6,
        };
        let fd = unsafe { libc::socket(af, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(Fail::transport(last_os_error()));
        }
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of_val(&one) as libc::socklen_t,
            );
        }
        set_nonblocking(fd).map_err(Fail::transport)?;
        Ok(fd)
    }

    fn bind(&self, handle: Handle, addr: SocketAddr) -> Result<(), Fail> {
        let (storage, len) = sockaddr_from(addr);
        let rc = unsafe { libc::bind(handle, &storage as *const _ as *const libc::sockaddr, len) };
        if rc < 0 {
            return Err(Fail::transport(last_os_error()));
        }
        Ok(())
    }

    fn listen(&self, handle: Handle, backlog: i32) -> Result<(), Fail> {
        let rc = unsafe { libc::listen(handle, backlog) };
        if rc < 0 {
            return Err(Fail::transport(last_os_error()));
        }
        Ok(())
    }

    fn accept(&self, handle: Handle) -> Result<Option<Handle>, Fail> {
        let fd = unsafe { libc::accept(handle, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            let e = last_os_error();
            if is_eagain(&e) {
                return Ok(None);
            }
            return Err(Fail::transport(e));
        }
        set_nonblocking(fd).map_err(Fail::transport)?;
        Ok(Some(fd))
    }

    fn read(&self, handle: Handle, buf: &mut SharedSlice) -> Result<Option<usize>, Fail> {
        loop {
            let cap = buf.capacity();
            let n = unsafe {
                libc::read(handle, buf.as_mut_slice().as_mut_ptr() as *mut libc::c_void, cap)
            };
            if n >= 0 {
                return Ok(Some(n as usize));
            }
            let e = last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if is_eagain(&e) {
                return Ok(None);
            }
            return Err(Fail::transport(e));
        }
    }

    fn write(&self, handle: Handle, buf: &SharedSlice) -> Result<Option<usize>, Fail> {
        loop {
            let n = unsafe {
                libc::write(
                    handle,
                    buf.as_slice().as_ptr() as *const libc::c_void,
                    buf.len(),
                )
            };
            if n >= 0 {
                return Ok(Some(n as usize));
            }
            let e = last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if is_eagain(&e) {
                return Ok(None);
            }
            return Err(Fail::transport(e));
        }
    }

    fn close(&self, handle: Handle) -> Result<(), Fail> {
        let rc = unsafe { libc::close(handle) };
        if rc < 0 {
            return Err(Fail::transport(last_os_error()));
        }
        Ok(())
    }

    fn local_addr(&self, handle: Handle) -> Result<SocketAddr, Fail> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(handle, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc < 0 {
            return Err(Fail::transport(last_os_error()));
        }
        sockaddr_to_std(&storage).map_err(Fail::transport)
    }

    fn peer_addr(&self, handle: Handle) -> Result<SocketAddr, Fail> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(handle, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc < 0 {
            return Err(Fail::transport(last_os_error()));
        }
        sockaddr_to_std(&storage).map_err(Fail::transport)
    }
}

fn readiness_to_epoll(mask: Readiness) -> u32 {
    let mut bits = libc::EPOLLET as u32;
    if mask.contains(Readiness::IN) {
        bits |= libc::EPOLLIN as u32;
    }
    if mask.contains(Readiness::OUT) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits |= libc::EPOLLERR as u32;
    bits
}

fn epoll_to_readiness(bits: u32) -> Readiness {
    let mut r = Readiness::empty();
    if bits & (libc::EPOLLIN as u32) != 0 {
        r |= Readiness::IN;
    }
    if bits & (libc::EPOLLOUT as u32) != 0 {
        r |= Readiness::OUT;
    }
    if bits & (libc::EPOLLERR as u32) != 0 || bits & (libc::EPOLLHUP as u32) != 0 {
        r |= Readiness::ERR;
    }
    r
}

/// Edge-triggered `epoll` notifier, keyed by socket handle.
///
/// `ctl_mod` always issues `EPOLL_CTL_MOD` rather than falling back to
/// `EPOLL_CTL_ADD` for a handle not yet registered; see `DESIGN.md`.
pub struct LibcNotifier {
    epfd: RawFd,
    registered: Mutex<std::collections::HashSet<RawFd>>,
}

impl LibcNotifier {
    pub fn new() -> Result<Self, Fail> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(Fail::notifier(last_os_error()));
        }
        Ok(Self {
            epfd,
            registered: Mutex::new(std::collections::HashSet::new()),
        })
    }

    fn ctl(&self, op: libc::c_int, handle: Handle, mask: Readiness) -> Result<(), Fail> {
        let mut ev = libc::epoll_event {
            events: readiness_to_epoll(mask),
            u64: handle as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, handle, &mut ev) };
        if rc < 0 {
            return Err(Fail::notifier(last_os_error()));
        }
        Ok(())
    }
}

impl EventNotifier for LibcNotifier {
    fn ctl_add(&self, handle: Handle, mask: Readiness) -> Result<(), Fail> {
        self.ctl(libc::EPOLL_CTL_ADD, handle, mask)?;
        self.registered.lock().unwrap().insert(handle);
        Ok(())
    }

    fn ctl_mod(&self, handle: Handle, mask: Readiness) -> Result<(), Fail> {
        self.ctl(libc::EPOLL_CTL_MOD, handle, mask)
    }

    fn ctl_del(&self, handle: Handle) -> Result<(), Fail> {
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, handle, std::ptr::null_mut())
        };
        self.registered.lock().unwrap().remove(&handle);
        if rc < 0 {
            return Err(Fail::notifier(last_os_error()));
        }
        Ok(())
    }

    fn wait(&self, events: &mut Vec<Event>, timeout_ms: Option<i32>) -> Result<(), Fail> {
        events.clear();
        let cap = events.capacity().max(64);
        let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; cap];
        let timeout = timeout_ms.unwrap_or(-1);
        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), raw.len() as i32, timeout)
        };
        if n < 0 {
            let e = last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Fail::notifier(e));
        }
        for ev in &raw[..n as usize] {
            events.push(Event {
                handle: ev.u64 as RawFd,
                readiness: epoll_to_readiness(ev.events),
            });
        }
        Ok(())
    }

    fn close(&self) -> Result<(), Fail> {
        let rc = unsafe { libc::close(self.epfd) };
        if rc < 0 {
            return Err(Fail::notifier(last_os_error()));
        }
        Ok(())
    }
}
