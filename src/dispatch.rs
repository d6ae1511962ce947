//! Delivery of completion callbacks onto the thread that owns the UI.
//!
//! Background workers never run user callbacks themselves. They post boxed
//! tasks through a [`MainThreadHandle`]; the owning thread drains the
//! [`MainQueue`] from its event loop (`run_pending` on every tick, or
//! `run_for` when it has nothing else to do).

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable sender side, handed to background workers.
#[derive(Clone)]
pub struct MainThreadHandle {
    tx: Sender<Task>,
}

impl MainThreadHandle {
    /// Queue `task` for the main thread. Returns false if the queue is gone.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }
}

/// Receiver side, owned by the main/UI thread.
pub struct MainQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl Default for MainQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MainQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    pub fn handle(&self) -> MainThreadHandle {
        MainThreadHandle {
            tx: self.tx.clone(),
        }
    }

    /// Run every task already queued, without blocking. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Block up to `timeout` for one task, then drain whatever else is queued.
    /// Returns how many tasks ran.
    pub fn run_for(&self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                task();
                1 + self.run_pending()
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Keep running tasks until `done()` holds or `timeout` elapses.
    /// Returns whether `done()` became true.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.run_for(deadline - now);
        }
    }
}
