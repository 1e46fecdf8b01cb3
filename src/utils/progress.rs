// mongodumper/src/utils/progress.rs
use std::time::Duration;

/// Minimum gain in percentage points before another progress line is logged.
pub const PROGRESS_LOG_STEP: u8 = 10;

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Decides which percentage observations are worth logging.
///
/// A value is reported when it is at least `PROGRESS_LOG_STEP` points above the
/// last reported value, or when 100 is reached and completion has not been
/// reported yet. Reported values are non-decreasing and always within `0..=100`.
#[derive(Debug, Clone, Default)]
pub struct ProgressThrottle {
    last_logged: u8,
    completed: bool,
}

impl ProgressThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, percent: u64) -> Option<u8> {
        let percent = percent.min(100) as u8;
        let step_reached = percent >= self.last_logged.saturating_add(PROGRESS_LOG_STEP);
        let first_completion = percent == 100 && !self.completed;

        if !(step_reached || first_completion) {
            return None;
        }

        self.last_logged = percent;
        if percent == 100 {
            self.completed = true;
        }
        Some(percent)
    }

    #[cfg(test)]
    pub fn last_logged(&self) -> u8 {
        self.last_logged
    }

    /// Lets the next 100 be reported again without lowering the step baseline.
    pub fn rearm_completion(&mut self) {
        self.completed = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Whole percentage of `done` over `total`. An empty total counts as complete.
pub fn percent_of(done: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    ((done as u128 * 100) / total as u128).min(100) as u64
}

/// Renders a byte count the way the run summary shows it: KB below 1 MiB,
/// MB below 1 GiB, GB with the MB figure alongside above that.
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < MIB {
        format!("{:.2} KB", bytes / KIB)
    } else if bytes < GIB {
        format!("{:.2} MB", bytes / MIB)
    } else {
        format!("{:.2} GB ({:.2} MB)", bytes / GIB, bytes / MIB)
    }
}

/// Bytes per second over `elapsed`; zero when no time has passed.
pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { bytes as f64 / secs } else { 0.0 }
}

pub fn bytes_to_mb(bytes: f64) -> f64 {
    bytes / MIB
}
