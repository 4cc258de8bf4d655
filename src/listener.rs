// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Listener adapter and `listen()` entry point.

use crate::conn::Connection;
use crate::config::Config;
use crate::fail::Fail;
use crate::fd::Fd;
use crate::irq::{Handler, IrqResult};
use crate::stack::{EventNotifier, Family, NetStack};
use crate::timer::Timer;
use crate::worker::Worker;
use log::info;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

pub struct Listener {
    fd: Arc<Fd>,
    stack: Arc<dyn NetStack>,
    worker: Arc<Worker>,
    timer: Arc<Timer>,
    notifier: Arc<dyn EventNotifier>,
    config: Config,
}

impl Listener {
    fn submit_and_listen(&self, handler: Handler) -> Result<Option<IrqResult>, Fail> {
        let sig = handler.signal();
        let (cell, guard) = self.fd.waiters.trap(sig, handler);
        if let Err(e) = self.worker.submit(self.fd.clone(), cell.clone()) {
            self.fd.waiters.untrap(&cell, guard);
            return Err(e);
        }
        self.fd.waiters.listen(&cell, guard)
    }

    pub fn accept(&self) -> Result<Connection, Fail> {
        match self.submit_and_listen(Handler::Accept)? {
            Some(IrqResult::Accepted(new_fd)) => Ok(Connection::new(
                new_fd,
                self.stack.clone(),
                self.worker.clone(),
                self.timer.clone(),
                &self.config,
            )),
            _ => unreachable!("accept handler always completes with a new connection"),
        }
    }

    pub fn close(&self) -> Result<(), Fail> {
        self.submit_and_listen(Handler::Close)?;
        self.notifier.close()
    }

    pub fn addr(&self) -> Result<SocketAddr, Fail> {
        self.stack.local_addr(self.fd.handle)
    }
}

/// Parses `network` (`tcp`/`tcp4`/`tcp6`) and `address` (`host:port`), then
/// creates, binds, and listens a socket on `stack`, registering it with the
/// worker.
pub fn listen(
    network: &str,
    address: &str,
    stack: Arc<dyn NetStack>,
    notifier: Arc<dyn EventNotifier>,
    worker: Arc<Worker>,
    timer: Arc<Timer>,
    config: Config,
) -> Result<Listener, Fail> {
    match network {
        "tcp" | "tcp4" | "tcp6" => {}
        other => {
            return Err(Fail::UnsupportedNetwork {
                details: other.to_string(),
            })
        }
    }

    let resolved: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(|e| Fail::AddressParse {
            details: e.to_string(),
        })?
        .collect();
    let addr = match network {
        "tcp4" => resolved.iter().find(|a| a.is_ipv4()).copied(),
        "tcp6" => resolved.iter().find(|a| a.is_ipv6()).copied(),
        _ => resolved.first().copied(),
    }
    .ok_or_else(|| Fail::AddressParse {
        details: format!("no {} address resolved for {}", network, address),
    })?;

    let handle = stack.socket(Family::of(addr))?;
    stack.bind(handle, addr)?;
    stack.listen(handle, config.backlog)?;
    info!("listening on {} ({})", addr, network);

    let fd = Fd::new(handle, notifier.clone());
    worker.register_fd(fd.clone());

    Ok(Listener {
        fd,
        stack,
        worker,
        timer,
        notifier,
        config,
    })
}
