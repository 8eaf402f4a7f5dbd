use std::fmt;
use std::io;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub enum PoolError {
    Spawn { pool: String, source: io::Error },
    JoinFailed { pool: String, failed: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { pool, source } => {
                write!(f, "failed to spawn worker thread for pool '{pool}': {source}")
            }
            Self::JoinFailed { pool, failed } => {
                write!(f, "{failed} worker thread(s) of pool '{pool}' failed to join")
            }
        }
    }
}

impl std::error::Error for PoolError {}

/// Why a job was handed back instead of being run.
pub enum Rejected<F> {
    /// Every worker is busy and every backlog slot is taken.
    Saturated(F),
    /// The pool has been shut down.
    Closed(F),
}

impl<F> Rejected<F> {
    pub fn is_saturated(&self) -> bool {
        matches!(self, Self::Saturated(_))
    }
}

impl<F> fmt::Debug for Rejected<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Saturated(_) => f.write_str("Rejected::Saturated"),
            Self::Closed(_) => f.write_str("Rejected::Closed"),
        }
    }
}

/// Fixed set of named worker threads. Admission is bounded by
/// `workers + backlog` jobs in flight (running or waiting); `try_execute`
/// never blocks the caller.
pub struct WorkerPool {
    name: String,
    workers: usize,
    capacity: usize,
    sender: Sender<Job>,
    in_flight: Arc<AtomicUsize>,
    abort: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        name: &str,
        workers: usize,
        backlog: usize,
        thread_ids: &AtomicUsize,
        panics: Arc<AtomicU64>,
    ) -> Result<Self, PoolError> {
        let workers = workers.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let abort = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let thread_name = format!("{name}-{}", thread_ids.fetch_add(1, Ordering::Relaxed));
            let receiver = receiver.clone();
            let in_flight = Arc::clone(&in_flight);
            let worker_abort = Arc::clone(&abort);
            let panics = Arc::clone(&panics);
            let spawned = thread::Builder::new()
                .name(thread_name)
                .spawn(move || run_worker(receiver, in_flight, worker_abort, panics));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    abort.store(true, Ordering::SeqCst);
                    drop(sender);
                    return Err(PoolError::Spawn {
                        pool: name.to_owned(),
                        source,
                    });
                }
            }
        }

        Ok(Self {
            name: name.to_owned(),
            workers,
            capacity: workers + backlog,
            sender,
            in_flight,
            abort,
            handles,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn try_execute<F>(&self, job: F) -> Result<(), Rejected<F>>
    where
        F: FnOnce() + Send + 'static,
    {
        let capacity = self.capacity;
        let admitted = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < capacity).then_some(current + 1)
            });
        if admitted.is_err() {
            return Err(Rejected::Saturated(job));
        }

        // Receivers live as long as the workers, which outlive `self.sender`.
        if self.sender.send(Box::new(job)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Stops admission, lets queued and running jobs finish, joins every worker.
    pub fn shutdown(self) -> Result<(), PoolError> {
        let Self {
            name,
            sender,
            handles,
            ..
        } = self;
        drop(sender);

        let failed = handles
            .into_iter()
            .map(JoinHandle::join)
            .filter(Result::is_err)
            .count();
        if failed > 0 {
            return Err(PoolError::JoinFailed { pool: name, failed });
        }
        Ok(())
    }

    /// Stops admission and discards queued jobs without waiting. Jobs already
    /// running cannot be preempted and finish on their detached threads.
    pub fn shutdown_now(self) {
        self.abort.store(true, Ordering::SeqCst);
        drop(self.sender);
    }
}

fn run_worker(
    receiver: Receiver<Job>,
    in_flight: Arc<AtomicUsize>,
    abort: Arc<AtomicBool>,
    panics: Arc<AtomicU64>,
) {
    while let Ok(job) = receiver.recv() {
        if !abort.load(Ordering::SeqCst) && catch_unwind(AssertUnwindSafe(job)).is_err() {
            panics.fetch_add(1, Ordering::Relaxed);
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The current pool for one stage of the server. Swapping in a resized pool
/// happens under the slot lock; the outgoing pool drains after the lock is
/// released so submitters are never held up by the drain.
pub struct PoolSlot {
    name: String,
    backlog_setting: usize,
    current: Mutex<Option<WorkerPool>>,
    thread_ids: AtomicUsize,
    panics: Arc<AtomicU64>,
}

impl PoolSlot {
    /// A `backlog` of zero means one waiting slot per worker.
    pub fn new(
        name: impl Into<String>,
        workers: usize,
        backlog: usize,
        panics: Arc<AtomicU64>,
    ) -> Result<Self, PoolError> {
        let name = name.into();
        let thread_ids = AtomicUsize::new(0);
        let pool = WorkerPool::spawn(
            &name,
            workers,
            effective_backlog(backlog, workers),
            &thread_ids,
            Arc::clone(&panics),
        )?;

        Ok(Self {
            name,
            backlog_setting: backlog,
            current: Mutex::new(Some(pool)),
            thread_ids,
            panics,
        })
    }

    pub fn try_execute<F>(&self, job: F) -> Result<(), Rejected<F>>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.lock().as_ref() {
            Some(pool) => pool.try_execute(job),
            None => Err(Rejected::Closed(job)),
        }
    }

    pub fn workers(&self) -> usize {
        self.lock().as_ref().map(WorkerPool::workers).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.lock().as_ref().map(WorkerPool::capacity).unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().as_ref().map(WorkerPool::in_flight).unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Replaces the current pool with one of `workers` threads and waits for
    /// the outgoing pool to finish everything it had accepted.
    pub fn replace(&self, workers: usize) -> Result<(), PoolError> {
        let fresh = WorkerPool::spawn(
            &self.name,
            workers,
            effective_backlog(self.backlog_setting, workers),
            &self.thread_ids,
            Arc::clone(&self.panics),
        )?;

        let outgoing = {
            let mut current = self.lock();
            if current.is_none() {
                fresh.shutdown_now();
                return Ok(());
            }
            mem::replace(&mut *current, Some(fresh))
        };

        match outgoing {
            Some(pool) => pool.shutdown(),
            None => Ok(()),
        }
    }

    pub fn shutdown(&self) -> Result<(), PoolError> {
        let outgoing = self.lock().take();
        match outgoing {
            Some(pool) => pool.shutdown(),
            None => Ok(()),
        }
    }

    pub fn shutdown_now(&self) {
        if let Some(pool) = self.lock().take() {
            pool.shutdown_now();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<WorkerPool>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn effective_backlog(setting: usize, workers: usize) -> usize {
    if setting == 0 {
        workers.max(1)
    } else {
        setting
    }
}
