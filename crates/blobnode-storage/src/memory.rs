//! Memory-pressure monitor
//!
//! Samples OS memory usage in the background. While usage is above the
//! configured percentage, reads call [`MemoryMonitor::backoff`] and are
//! delayed; nothing is rejected.

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Source of the current memory usage percentage
pub type Sampler = Box<dyn Fn() -> Option<f64> + Send + 'static>;

/// OS memory in use, as a percentage of total
#[must_use]
pub fn os_memory_used_percent() -> Option<f64> {
    let info = sys_info::mem_info().ok()?;
    if info.total == 0 {
        return None;
    }
    let used = info.total.saturating_sub(info.avail);
    Some(used as f64 * 100.0 / info.total as f64)
}

/// Background sampler plus the read backoff valve
pub struct MemoryMonitor {
    over_limit: Arc<AtomicBool>,
    /// Last sample, percent * 100
    last_sample: Arc<AtomicU64>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    /// Monitor that never reports pressure
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            over_limit: Arc::new(AtomicBool::new(false)),
            last_sample: Arc::new(AtomicU64::new(0)),
            shutdown_tx: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Sample OS memory every `interval` against `limit_percent`
    pub fn start(limit_percent: u8, interval: Duration) -> std::io::Result<Self> {
        Self::with_sampler(limit_percent, interval, Box::new(os_memory_used_percent))
    }

    /// Sample with a custom source
    pub fn with_sampler(
        limit_percent: u8,
        interval: Duration,
        sampler: Sampler,
    ) -> std::io::Result<Self> {
        let over_limit = Arc::new(AtomicBool::new(false));
        let last_sample = Arc::new(AtomicU64::new(0));
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);

        let sample = {
            let over_limit = Arc::clone(&over_limit);
            let last_sample = Arc::clone(&last_sample);
            move || match sampler() {
                Some(used) => {
                    last_sample.store((used * 100.0) as u64, Ordering::Relaxed);
                    let over = used > f64::from(limit_percent);
                    if over_limit.swap(over, Ordering::Relaxed) != over {
                        if over {
                            warn!(
                                "Memory usage {:.1}% is above {}%, delaying reads",
                                used, limit_percent
                            );
                        } else {
                            info!("Memory usage {:.1}% is back under {}%", used, limit_percent);
                        }
                    }
                }
                None => debug!("Memory sample unavailable"),
            }
        };
        // first sample before any read can run
        sample();

        let handle = thread::Builder::new()
            .name("blobnode-memory".into())
            .spawn(move || {
                debug!("Memory monitor started");
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => sample(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Memory monitor stopped");
            })?;

        Ok(Self {
            over_limit,
            last_sample,
            shutdown_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Whether the last sample was above the limit
    pub fn is_over_limit(&self) -> bool {
        self.over_limit.load(Ordering::Relaxed)
    }

    /// Last sampled usage in percent
    pub fn last_sample(&self) -> f64 {
        self.last_sample.load(Ordering::Relaxed) as f64 / 100.0
    }

    /// Delay the caller while memory is over the limit
    ///
    /// Waits 1/100 s, then 1/99 s, and so on up to a full second, stopping
    /// as soon as pressure clears. The total delay is bounded (about 5 s).
    pub fn backoff(&self) {
        for over in (1..=100u32).rev() {
            if !self.is_over_limit() {
                return;
            }
            thread::sleep(Duration::from_secs(1) / over);
        }
    }

    /// Stop sampling
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_disabled_never_delays() {
        let monitor = MemoryMonitor::disabled();
        let start = Instant::now();
        monitor.backoff();
        assert!(!monitor.is_over_limit());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_pressure_flag_follows_samples() {
        let level = Arc::new(AtomicU64::new(95));
        let sampler_level = Arc::clone(&level);
        let monitor = MemoryMonitor::with_sampler(
            80,
            Duration::from_millis(10),
            Box::new(move || Some(sampler_level.load(Ordering::Relaxed) as f64)),
        )
        .unwrap();
        assert!(monitor.is_over_limit());
        assert!((monitor.last_sample() - 95.0).abs() < 0.01);

        level.store(40, Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.is_over_limit() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!monitor.is_over_limit());
        monitor.stop();
    }

    #[test]
    fn test_backoff_is_bounded() {
        let sampler: Sampler = Box::new(|| Some(99.0));
        let monitor = MemoryMonitor::with_sampler(1, Duration::from_secs(60), sampler).unwrap();
        let start = Instant::now();
        monitor.backoff();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_secs(8));
    }

    #[test]
    fn test_os_sample_is_a_percentage() {
        if let Some(used) = os_memory_used_percent() {
            assert!((0.0..=100.0).contains(&used));
        }
    }
}
