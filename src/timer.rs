// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deadline timer: a min-heap of absolute-time jobs driven by one thread.
//! `BinaryHeap` is a max-heap, so `Ord` is implemented in reverse to get a
//! min-heap. Cancelling or rescheduling a job doesn't remove its heap entry
//! in place — `BinaryHeap` has no such operation — instead the job's slot in
//! the `Slab` is marked dead (or rebound to a new deadline with a bumped
//! generation) and the stale heap entry is discarded when the driver walks
//! past it.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use slab::Slab;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type Job = Box<dyn FnOnce() + Send>;

/// Opaque handle to a pending timer job, returned by [`Timer::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerHandle(usize);

struct Entry {
    deadline: Instant,
    job: Option<Job>,
    alive: bool,
}

#[derive(Clone, Copy)]
struct HeapKey {
    deadline: Instant,
    key: usize,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.key == other.key
    }
}
impl Eq for HeapKey {}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so that `BinaryHeap` (a max-heap) pops the earliest deadline first.
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline).then_with(|| other.key.cmp(&self.key))
    }
}

struct Inner {
    slab: Slab<Entry>,
    heap: BinaryHeap<HeapKey>,
}

fn drain_due(inner: &mut Inner, now: Instant) -> Vec<Job> {
    let mut due = Vec::new();
    while let Some(&HeapKey { deadline, key }) = inner.heap.peek() {
        let alive = inner.slab.get(key).map(|e| e.alive).unwrap_or(false);
        if !alive {
            inner.heap.pop();
            if inner.slab.contains(key) {
                inner.slab.remove(key);
            }
            continue;
        }
        if deadline > now {
            break;
        }
        inner.heap.pop();
        let entry = inner.slab.remove(key);
        if let Some(job) = entry.job {
            due.push(job);
        }
    }
    due
}

fn next_sleep(inner: &Inner, now: Instant) -> Duration {
    match inner.heap.peek() {
        Some(top) if top.deadline > now => top.deadline - now,
        Some(_) => Duration::from_millis(0),
        None => Duration::from_secs(3600),
    }
}

struct Shared {
    inner: Mutex<Inner>,
    shutdown: AtomicBool,
}

/// A running deadline-timer driver. Dropping the last `Arc` does not stop
/// the thread; call [`Timer::shutdown`] explicitly.
pub struct Timer {
    shared: Arc<Shared>,
    wake_tx: Sender<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn start() -> Arc<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                slab: Slab::new(),
                heap: BinaryHeap::new(),
            }),
            shutdown: AtomicBool::new(false),
        });
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let driver_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("deadline-timer".into())
            .spawn(move || Self::drive(driver_shared, wake_rx))
            .expect("failed to spawn deadline-timer thread");
        Arc::new(Self {
            shared,
            wake_tx,
            driver: Mutex::new(Some(handle)),
        })
    }

    fn drive(shared: Arc<Shared>, wake_rx: Receiver<()>) {
        loop {
            if shared.shutdown.load(AtomicOrdering::Acquire) {
                return;
            }
            let now = Instant::now();
            let due = {
                let mut inner = shared.inner.lock().unwrap();
                drain_due(&mut inner, now)
            };
            for job in due {
                job();
            }
            let sleep_for = {
                let inner = shared.inner.lock().unwrap();
                next_sleep(&inner, Instant::now())
            };
            match wake_rx.recv_timeout(sleep_for) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Schedules `job` to run at `deadline`.
    pub fn add(&self, deadline: Instant, job: Job) -> TimerHandle {
        let key = {
            let mut inner = self.shared.inner.lock().unwrap();
            let key = inner.slab.insert(Entry {
                deadline,
                job: Some(job),
                alive: true,
            });
            inner.heap.push(HeapKey { deadline, key });
            key
        };
        let _ = self.wake_tx.try_send(());
        TimerHandle(key)
    }

    /// Cancels a pending job. A no-op if it already fired.
    pub fn remove(&self, handle: TimerHandle) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(entry) = inner.slab.get_mut(handle.0) {
            entry.alive = false;
        }
    }

    /// Cancels `handle` and schedules `job` at the new deadline.
    pub fn update(&self, handle: TimerHandle, deadline: Instant, job: Job) -> TimerHandle {
        self.remove(handle);
        self.add(deadline, job)
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        let _ = self.wake_tx.try_send(());
        if let Some(handle) = self.driver.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn fires_job_at_deadline() {
        let timer = Timer::start();
        let (tx, rx) = mpsc::channel();
        timer.add(Instant::now() + Duration::from_millis(20), Box::new(move || {
            tx.send(()).unwrap();
        }));
        rx.recv_timeout(Duration::from_millis(500)).expect("job did not fire");
        timer.shutdown();
    }

    #[test]
    fn removed_job_never_fires() {
        let timer = Timer::start();
        let (tx, rx) = mpsc::channel::<()>();
        let handle = timer.add(Instant::now() + Duration::from_millis(20), Box::new(move || {
            tx.send(()).unwrap();
        }));
        timer.remove(handle);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        timer.shutdown();
    }

    #[test]
    fn update_reschedules_to_latest_job() {
        let timer = Timer::start();
        let (tx, rx) = mpsc::channel();
        let handle = timer.add(Instant::now() + Duration::from_millis(500), Box::new(|| {
            panic!("stale job fired");
        }));
        let handle = timer.update(handle, Instant::now() + Duration::from_millis(20), Box::new(move || {
            tx.send("fresh").unwrap();
        }));
        let _ = handle;
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)).unwrap(), "fresh");
        timer.shutdown();
    }
}
