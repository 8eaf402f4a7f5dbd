use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Something a long-running computation updates while its drawer is still
/// empty, so withdrawals can report how far along it is.
pub trait ProgressIndicator: Send + Sync {
    /// `(done_so_far, to_be_done)`; either side is -1 when unknown.
    fn completion_ratio(&self) -> Option<(i64, i64)>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    Idle,
    Running,
    Done,
}

/// Lock-free unit counter shared between the worker and the store.
#[derive(Debug)]
pub struct UnitCounter {
    to_be_done: AtomicI64,
    done: AtomicI64,
    started: AtomicBool,
    finished: AtomicBool,
}

impl UnitCounter {
    pub fn new() -> Self {
        Self::with_total(-1)
    }

    pub fn with_total(to_be_done: i64) -> Self {
        Self {
            to_be_done: AtomicI64::new(to_be_done),
            done: AtomicI64::new(0),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub fn set_to_be_done(&self, to_be_done: i64) {
        self.to_be_done.store(to_be_done, Ordering::SeqCst);
    }

    pub fn to_be_done(&self) -> i64 {
        self.to_be_done.load(Ordering::SeqCst)
    }

    pub fn mark_start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn mark_end(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    /// Counts finished units, starting the counter if needed.
    pub fn inc(&self, units: i64) -> i64 {
        self.mark_start();
        self.done.fetch_add(units, Ordering::SeqCst) + units
    }

    /// -1 until the counter is started.
    pub fn done_so_far(&self) -> i64 {
        if self.started.load(Ordering::SeqCst) {
            self.done.load(Ordering::SeqCst)
        } else {
            -1
        }
    }

    pub fn status(&self) -> UnitStatus {
        if self.finished.load(Ordering::SeqCst) {
            UnitStatus::Done
        } else if self.started.load(Ordering::SeqCst) {
            UnitStatus::Running
        } else {
            UnitStatus::Idle
        }
    }
}

impl Default for UnitCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressIndicator for UnitCounter {
    fn completion_ratio(&self) -> Option<(i64, i64)> {
        Some((self.done_so_far(), self.to_be_done()))
    }
}

#[cfg(test)]
mod tests {
    use super::{ProgressIndicator, UnitCounter, UnitStatus};

    #[test]
    fn reports_unknowns_until_started() {
        let counter = UnitCounter::new();
        assert_eq!(counter.completion_ratio(), Some((-1, -1)));
        assert_eq!(counter.status(), UnitStatus::Idle);
    }

    #[test]
    fn counts_units_towards_total() {
        let counter = UnitCounter::with_total(10);
        counter.inc(3);
        assert_eq!(counter.inc(2), 5);
        assert_eq!(counter.status(), UnitStatus::Running);
        assert_eq!(counter.completion_ratio(), Some((5, 10)));

        counter.mark_end();
        assert_eq!(counter.status(), UnitStatus::Done);
    }
}
