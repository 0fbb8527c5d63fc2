//! Worker threads that run handler callbacks.
//!
//! Each connection is pinned to one worker through a [`Lane`], so its
//! callbacks run one at a time in the order they were queued while the
//! connection thread keeps reading. Workers exit once every lane and the
//! executor itself are dropped.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct HandlerExecutor {
    senders: Vec<Sender<Job>>,
    next: AtomicUsize,
}

impl HandlerExecutor {
    /// Spawn `num_threads` workers (at least one). When `dispatch` is set,
    /// workers log through it.
    pub fn new(num_threads: usize, dispatch: Option<tracing::Dispatch>) -> io::Result<Self> {
        let num_threads = num_threads.max(1);
        let mut senders = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let (tx, rx) = crossbeam_channel::unbounded::<Job>();
            let dispatch = dispatch.clone();
            thread::Builder::new()
                .name(format!("ripple-handler-{}", i))
                .spawn(move || crate::with_dispatch(dispatch.as_ref(), || worker_loop(i, rx)))?;
            senders.push(tx);
        }

        Ok(HandlerExecutor {
            senders,
            next: AtomicUsize::new(0),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.senders.len()
    }

    /// Pick the next worker, round-robin.
    pub fn lane(&self) -> Lane {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        Lane {
            tx: self.senders[i].clone(),
        }
    }
}

/// An ordered queue onto one worker thread.
#[derive(Clone)]
pub struct Lane {
    tx: Sender<Job>,
}

impl Lane {
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        // Only fails once the worker is gone, i.e. during teardown.
        if self.tx.send(Box::new(job)).is_err() {
            trace!("handler worker gone, dropping callback");
        }
    }
}

fn worker_loop(index: usize, rx: Receiver<Job>) {
    for job in rx.iter() {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
        if let Err(panic) = result {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(worker = index, panic = %msg, "handler callback panicked");
        }
    }
    trace!(worker = index, "handler worker exiting");
}
