use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Byte counter plus a rolling window of samples for speed and ETA.
///
/// Workers only ever `try_lock` the sample window, so a slow reader can cost
/// a sample but never stalls a download.
pub struct ProgressTracker {
    completed: AtomicU64,
    window: Duration,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl ProgressTracker {
    pub fn new(window: Duration, completed: u64) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((Instant::now(), completed));
        Self {
            completed: AtomicU64::new(completed),
            window,
            samples: Mutex::new(samples),
        }
    }

    pub fn add(&self, bytes: u64) -> u64 {
        let total = self.completed.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if let Ok(mut samples) = self.samples.try_lock() {
            samples.push_back((Instant::now(), total));
            prune(&mut samples, Instant::now(), self.window);
        }
        total
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Forget samples from an earlier run so idle time is not averaged in.
    pub fn restart_window(&self) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.clear();
            samples.push_back((Instant::now(), self.completed()));
        }
    }

    /// Bytes per second over the window.
    pub fn speed_bps(&self) -> f64 {
        self.speed_at(Instant::now())
    }

    fn speed_at(&self, now: Instant) -> f64 {
        let completed = self.completed();
        let Ok(mut samples) = self.samples.lock() else {
            return 0.0;
        };
        prune(&mut samples, now, self.window);
        let Some(&(since, base)) = samples.front() else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(since).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        completed.saturating_sub(base) as f64 / elapsed
    }

    pub fn eta(&self, total_expected: Option<u64>) -> Option<Duration> {
        eta_for(self.completed(), total_expected, self.speed_bps())
    }
}

// Keeps the newest sample at or before the window edge as the baseline.
fn prune(samples: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
    let Some(edge) = now.checked_sub(window) else {
        return;
    };
    while samples.len() > 1 && samples[1].0 <= edge {
        samples.pop_front();
    }
}

pub fn eta_for(completed: u64, total_expected: Option<u64>, speed_bps: f64) -> Option<Duration> {
    let total = total_expected?;
    if speed_bps <= 0.0 || !speed_bps.is_finite() {
        return None;
    }
    let remaining = total.saturating_sub(completed) as f64;
    Duration::try_from_secs_f64(remaining / speed_bps).ok()
}

/// Expected size of the whole selection. Exact when every segment carries a
/// byte-range hint, otherwise the mean finished segment size times the count.
pub fn estimate_total(
    hinted: Option<u64>,
    segment_count: usize,
    done_count: usize,
    done_bytes: u64,
) -> Option<u64> {
    if hinted.is_some() {
        return hinted;
    }
    if done_count == 0 {
        return None;
    }
    if done_count >= segment_count {
        return Some(done_bytes);
    }
    let mean = done_bytes as f64 / done_count as f64;
    Some((mean * segment_count as f64).round() as u64)
}
