use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on a single sleep, so a long interval still notices `stop` quickly.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub enum ScheduleError {
    ZeroInterval { name: String },
    Spawn { name: String, source: io::Error },
    JoinFailed { name: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroInterval { name } => {
                write!(f, "scheduled task '{name}' needs a non-zero interval")
            }
            Self::Spawn { name, source } => {
                write!(f, "failed to spawn scheduled task '{name}': {source}")
            }
            Self::JoinFailed { name } => {
                write!(f, "scheduled task '{name}' thread join failed")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// A background task run with a fixed delay between the end of one run and
/// the start of the next. Runs never overlap; the first run happens one
/// interval after `start`.
pub struct FixedDelayTask {
    name: String,
    interval: Duration,
    stop_signal: Arc<AtomicBool>,
    runs: Arc<AtomicU64>,
    panics: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl FixedDelayTask {
    pub fn start<F>(
        name: impl Into<String>,
        interval: Duration,
        mut task: F,
    ) -> Result<Self, ScheduleError>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        if interval.is_zero() {
            return Err(ScheduleError::ZeroInterval { name });
        }

        let stop_signal = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicU64::new(0));
        let panics = Arc::new(AtomicU64::new(0));

        let worker = {
            let stop_signal = Arc::clone(&stop_signal);
            let runs = Arc::clone(&runs);
            let panics = Arc::clone(&panics);
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || loop {
                    if !sleep_unless_stopped(interval, &stop_signal) {
                        break;
                    }
                    if catch_unwind(AssertUnwindSafe(&mut task)).is_err() {
                        panics.fetch_add(1, Ordering::Relaxed);
                    }
                    runs.fetch_add(1, Ordering::Relaxed);
                })
                .map_err(|source| ScheduleError::Spawn {
                    name: name.clone(),
                    source,
                })?
        };

        Ok(Self {
            name,
            interval,
            stop_signal,
            runs,
            panics,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stops scheduling and waits for a run in progress to complete.
    pub fn stop(&mut self) -> Result<(), ScheduleError> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| ScheduleError::JoinFailed {
                name: self.name.clone(),
            });
        }

        Ok(())
    }

    /// Stops scheduling without waiting for a run in progress.
    pub fn cancel(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        self.worker.take();
    }
}

impl Drop for FixedDelayTask {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Returns `false` when the stop signal was raised during the sleep.
fn sleep_unless_stopped(total: Duration, stop_signal: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop_signal.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(MAX_SLEEP_SLICE));
    }
}
