//! Rolling publish statistics.
//!
//! Each delivery (successful or exhausted) is one sample. A summary line is
//! logged once `sample_every` samples have accumulated or `interval` has
//! passed since the last one, whichever comes first; the window then starts
//! over. [`PublishStats::flush`] forces a summary, e.g. on shutdown.

use crate::config::{env_parse, env_secs};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// One logged summary window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishSummary {
    pub count: u64,
    pub success: u64,
    pub failure: u64,
    /// Percent, 0–100.
    pub success_rate: f64,
    pub avg_duration: Duration,
    pub avg_size: f64,
    pub avg_retries: f64,
    pub window: Duration,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u64,
    success: u64,
    total_duration: Duration,
    total_size: u64,
    total_retries: u64,
}

impl Window {
    fn new(started: Instant) -> Self {
        Self {
            started,
            count: 0,
            success: 0,
            total_duration: Duration::ZERO,
            total_size: 0,
            total_retries: 0,
        }
    }

    fn summarize(&self, now: Instant) -> PublishSummary {
        let n = self.count.max(1) as f64;
        PublishSummary {
            count: self.count,
            success: self.success,
            failure: self.count - self.success,
            success_rate: self.success as f64 / n * 100.0,
            avg_duration: self.total_duration.div_f64(n),
            avg_size: self.total_size as f64 / n,
            avg_retries: self.total_retries as f64 / n,
            window: now.saturating_duration_since(self.started),
        }
    }
}

/// Aggregates delivery samples into periodic log summaries.
#[derive(Debug)]
pub struct PublishStats {
    window: Mutex<Window>,
    sample_every: u64,
    interval: Duration,
}

impl Default for PublishStats {
    fn default() -> Self {
        Self::new(50, Duration::from_secs(60))
    }
}

impl PublishStats {
    pub fn new(sample_every: u64, interval: Duration) -> Self {
        Self {
            window: Mutex::new(Window::new(Instant::now())),
            sample_every: sample_every.max(1),
            interval: if interval.is_zero() {
                Duration::from_secs(60)
            } else {
                interval
            },
        }
    }

    /// Reads `PUBLISH_STATS_SAMPLE` and `PUBLISH_STATS_INTERVAL` (seconds).
    pub fn from_env() -> Self {
        Self::new(
            env_parse("PUBLISH_STATS_SAMPLE", 50u64),
            env_secs("PUBLISH_STATS_INTERVAL", Duration::from_secs(60)),
        )
    }

    /// Add one delivery. Returns the summary if this sample closed a window.
    pub fn record(
        &self,
        ok: bool,
        duration: Duration,
        retries: u32,
        size_bytes: usize,
    ) -> Option<PublishSummary> {
        let now = Instant::now();
        let mut w = self.lock();
        w.count += 1;
        if ok {
            w.success += 1;
        }
        w.total_duration += duration;
        w.total_size += size_bytes as u64;
        w.total_retries += u64::from(retries);

        let due = w.count >= self.sample_every
            || now.saturating_duration_since(w.started) >= self.interval;
        due.then(|| emit(&mut w, now))
    }

    /// Log and reset the current window if it holds any samples.
    pub fn flush(&self) -> Option<PublishSummary> {
        let mut w = self.lock();
        (w.count > 0).then(|| emit(&mut w, Instant::now()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn emit(w: &mut Window, now: Instant) -> PublishSummary {
    let s = w.summarize(now);
    info!(
        count = s.count,
        success = s.success,
        failure = s.failure,
        success_rate = %format!("{:.1}%", s.success_rate),
        avg_duration = %format!("{:.3}s", s.avg_duration.as_secs_f64()),
        avg_size = %format_size(s.avg_size),
        avg_retries = %format!("{:.2}", s.avg_retries),
        window = %format!("{:.1}s", s.window.as_secs_f64()),
        "Publish summary"
    );
    *w = Window::new(now);
    s
}

/// Human-readable byte size.
pub fn format_size(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{bytes:.0}B")
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.1}KB", bytes / 1024.0)
    } else {
        format!("{:.1}MB", bytes / (1024.0 * 1024.0))
    }
}
