use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Running count/min/max/mean/stddev/sum over scalar samples. `add` takes
/// `&self` so one accumulator can be shared between pool workers.
#[derive(Debug)]
pub struct StatsAccumulator {
    label: String,
    state: Mutex<Moments>,
}

#[derive(Clone, Copy, Debug, Default)]
struct Moments {
    n: u64,
    sum: f64,
    sum_of_squares: f64,
    min: f64,
    max: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub label: String,
    pub n: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub sum: f64,
}

impl StatsAccumulator {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(Moments::default()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn add(&self, value: f64) {
        let mut moments = self.lock();
        if moments.n == 0 {
            moments.min = value;
            moments.max = value;
        } else {
            moments.min = moments.min.min(value);
            moments.max = moments.max.max(value);
        }
        moments.n += 1;
        moments.sum += value;
        moments.sum_of_squares += value * value;
    }

    /// Adds a duration sample measured in (fractional) milliseconds.
    pub fn add_duration(&self, duration: Duration) {
        self.add(duration.as_secs_f64() * 1_000.0);
    }

    pub fn clear(&self) {
        *self.lock() = Moments::default();
    }

    pub fn n(&self) -> u64 {
        self.lock().n
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let moments = *self.lock();
        let mean = if moments.n == 0 {
            0.0
        } else {
            moments.sum / moments.n as f64
        };
        StatsSnapshot {
            label: self.label.clone(),
            n: moments.n,
            min: moments.min,
            max: moments.max,
            mean,
            stddev: moments.variance().sqrt(),
            sum: moments.sum,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Moments> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Moments {
    /// Sample variance; zero until two samples exist.
    fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        let n = self.n as f64;
        let mean = self.sum / n;
        ((self.sum_of_squares - n * mean * mean) / (n - 1.0)).max(0.0)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: n={} mean={:.3} stddev={:.3} min={:.3} max={:.3} sum={:.3}",
            self.label, self.n, self.mean, self.stddev, self.min, self.max, self.sum
        )
    }
}

pub fn format_duration_human_friendly(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    if total_ms < 1_000.0 {
        return format!("{total_ms:.2} ms");
    }

    let total_seconds = duration.as_secs();
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = duration.as_secs_f64() - (total_seconds - total_seconds % 60) as f64;

    match (days, hours, minutes) {
        (0, 0, 0) => format!("{seconds:.2}s"),
        (0, 0, _) => format!("{minutes}m {seconds:.2}s"),
        (0, _, _) => format!("{hours}h {minutes}m {seconds:.0}s"),
        _ => format!("{days}d {hours}h {minutes}m"),
    }
}
