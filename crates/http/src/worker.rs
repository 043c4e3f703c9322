//! The bounded worker pool that runs handlers and TLS handshakes off the I/O thread.
//!
//! Tasks are handed over through a zero-capacity channel, so a task is only accepted when
//! a worker is already waiting for one. When every worker is busy and the pool is at its
//! maximum size, the task is queued for a single auxiliary thread which blocks until a
//! worker frees up. Submitting therefore never blocks the caller and never rejects work
//! while the pool is open.
//!
//! Workers above the minimum retire after sitting idle for the keep-alive duration.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select, unbounded};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, trace};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("worker pool is closed")]
    Closed,

    #[error("failed to spawn worker thread: {source}")]
    Spawn {
        #[from]
        source: io::Error,
    },
}

#[derive(Debug)]
struct Shared {
    min: usize,
    max: usize,
    keep_alive: Duration,
    workers: AtomicUsize,
    next_id: AtomicUsize,
    tasks: Receiver<Task>,
    shutdown: Receiver<()>,
}

impl Shared {
    /// Claims a worker slot if fewer than `limit` workers are alive.
    fn reserve(&self, limit: usize) -> bool {
        self.workers.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1)).is_ok()
    }

    /// Gives up a worker slot if more than `min` workers are alive.
    fn retire(&self) -> bool {
        self.workers.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > self.min).then(|| n - 1)).is_ok()
    }
}

pub struct ReactorWorker {
    shared: Arc<Shared>,
    tasks: Sender<Task>,
    backlog: Mutex<Option<Sender<Task>>>,
    shutdown: Mutex<Option<Sender<()>>>,
    aux: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ReactorWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorWorker")
            .field("min", &self.shared.min)
            .field("max", &self.shared.max)
            .field("workers", &self.workers())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ReactorWorker {
    /// Creates a pool keeping at least `min` and at most `max` workers.
    pub fn new(min: usize, max: usize, keep_alive: Duration) -> Result<Self, ReactorError> {
        let max = max.max(1);
        let min = min.min(max);
        let (tasks_tx, tasks_rx) = bounded::<Task>(0);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (backlog_tx, backlog_rx) = unbounded::<Task>();

        let aux = {
            let tasks = tasks_tx.clone();
            let shutdown = shutdown_rx.clone();
            thread::Builder::new().name("sprout-worker-backlog".into()).spawn(move || run_backlog(&backlog_rx, &tasks, &shutdown))?
        };

        let shared = Arc::new(Shared {
            min,
            max,
            keep_alive,
            workers: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            tasks: tasks_rx,
            shutdown: shutdown_rx,
        });

        Ok(Self {
            shared,
            tasks: tasks_tx,
            backlog: Mutex::new(Some(backlog_tx)),
            shutdown: Mutex::new(Some(shutdown_tx)),
            aux: Mutex::new(Some(aux)),
            closed: AtomicBool::new(false),
        })
    }

    /// Runs `task` on a worker as soon as one is free.
    pub fn submit<F>(&self, task: F) -> Result<(), ReactorError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return Err(ReactorError::Closed);
        }
        let task: Task = Box::new(task);

        if self.shared.reserve(self.shared.min) {
            return self.spawn_worker(task);
        }

        let task = match self.tasks.try_send(task) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(task)) => task,
            Err(TrySendError::Disconnected(_)) => return Err(ReactorError::Closed),
        };

        if self.shared.reserve(self.shared.max) {
            return self.spawn_worker(task);
        }

        trace!("all workers busy, queueing task");
        let backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
        match backlog.as_ref() {
            Some(sender) => sender.send(task).map_err(|_closed| ReactorError::Closed),
            None => Err(ReactorError::Closed),
        }
    }

    fn spawn_worker(&self, first: Task) -> Result<(), ReactorError> {
        let shared = Arc::clone(&self.shared);
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);

        let spawned = thread::Builder::new().name(format!("sprout-worker-{id}")).spawn(move || {
            run_task(first);
            run_worker(&shared);
        });

        if let Err(e) = spawned {
            self.shared.workers.fetch_sub(1, Ordering::AcqRel);
            error!(cause = %e, "failed to spawn worker");
            return Err(e.into());
        }
        debug!(worker = id, "worker started");
        Ok(())
    }

    /// The number of live workers.
    pub fn workers(&self) -> usize {
        self.shared.workers.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting tasks, lets workers exit after their current task and drops queued tasks.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        drop(self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take());
        drop(self.backlog.lock().unwrap_or_else(PoisonError::into_inner).take());

        let aux = self.aux.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(aux) = aux
            && aux.join().is_err()
        {
            error!("worker backlog thread panicked");
        }
        debug!("worker pool closed");
    }
}

impl Drop for ReactorWorker {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_worker(shared: &Shared) {
    loop {
        select! {
            recv(shared.tasks) -> task => match task {
                Ok(task) => run_task(task),
                Err(_) => break,
            },
            recv(shared.shutdown) -> _ => break,
            default(shared.keep_alive) => {
                if shared.retire() {
                    trace!("idle worker retired");
                    return;
                }
            }
        }
    }
    shared.workers.fetch_sub(1, Ordering::AcqRel);
}

fn run_backlog(backlog: &Receiver<Task>, tasks: &Sender<Task>, shutdown: &Receiver<()>) {
    loop {
        select! {
            recv(backlog) -> task => {
                let Ok(task) = task else { return };
                select! {
                    send(tasks, task) -> sent => if sent.is_err() { return },
                    recv(shutdown) -> _ => return,
                }
            },
            recv(shutdown) -> _ => return,
        }
    }
}

fn run_task(task: Task) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!(cause = panic_message(&*panic), "worker task panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
