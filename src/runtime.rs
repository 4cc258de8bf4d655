// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Top-level wiring: owns the worker, timer, and event notifier, and is the
//! entry point callers use to listen on an address. One `Runtime` owns
//! exactly one worker thread, one timer thread, and one `EventNotifier`
//! instance — every `Listener`/`Connection` it produces shares that
//! notifier, since a single pinned worker thread can only usefully drive
//! one readiness loop.

use crate::config::Config;
use crate::fail::Fail;
use crate::listener::{self, Listener};
use crate::stack::{EventNotifier, NetStack};
use crate::timer::Timer;
use crate::worker::Worker;
use std::sync::Arc;

pub struct Runtime {
    stack: Arc<dyn NetStack>,
    notifier: Arc<dyn EventNotifier>,
    worker: Arc<Worker>,
    timer: Arc<Timer>,
    config: Config,
}

impl Runtime {
    pub fn new(stack: Arc<dyn NetStack>, notifier: Arc<dyn EventNotifier>, config: Config) -> Arc<Self> {
        let timer = Timer::start();
        let worker = Worker::spawn(stack.clone(), notifier.clone(), timer.clone(), config.clone());
        Arc::new(Self {
            stack,
            notifier,
            worker,
            timer,
            config,
        })
    }

    /// Convenience constructor wiring up the bundled [`crate::stack::libc_stack::LibcStack`].
    pub fn with_libc_stack(config: Config) -> Result<Arc<Self>, Fail> {
        let stack: Arc<dyn NetStack> = Arc::new(crate::stack::libc_stack::LibcStack::new());
        let notifier: Arc<dyn EventNotifier> = Arc::new(crate::stack::libc_stack::LibcNotifier::new()?);
        Ok(Self::new(stack, notifier, config))
    }

    pub fn listen(&self, network: &str, address: &str) -> Result<Listener, Fail> {
        listener::listen(
            network,
            address,
            self.stack.clone(),
            self.notifier.clone(),
            self.worker.clone(),
            self.timer.clone(),
            self.config.clone(),
        )
    }

    pub fn shutdown(&self) {
        self.worker.stop();
        self.timer.shutdown();
    }
}
