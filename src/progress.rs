use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};

/// Progress callback: (message, percentage)
pub type ProgressCallback = Arc<Mutex<dyn FnMut(String, f32) + Send>>;

/// Coarse-grained progress reporting and cancellation for long operations.
/// Callbacks fire per unit of work; the cancel flag is only checked between
/// rounds, so a running parallel round always completes once started.
#[derive(Clone, Default)]
pub struct Progress {
    callback: Option<ProgressCallback>,
    cancel_flag: Option<Arc<AtomicBool>>,
    total: usize,
    current: usize,
}

impl Progress {
    pub fn new(callback: Option<ProgressCallback>, cancel_flag: Option<Arc<AtomicBool>>) -> Self {
        Self { callback, cancel_flag, total: 0, current: 0 }
    }

    /// Progress sink that reports nowhere and never cancels.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn set_total(&mut self, total: usize) {
        self.total = total;
        self.current = 0;
    }

    pub fn set_current(&mut self, current: usize) {
        self.current = current.min(self.total);
    }

    pub fn add(&mut self, amount: usize) {
        self.set_current(self.current + amount);
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Send a status message with the current percentage to the callback.
    pub fn report(&self, msg: &str) {
        if let Some(ref cb) = self.callback {
            if let Ok(mut cb_lock) = cb.lock() {
                let pct = if self.total > 0 {
                    self.current as f32 / self.total as f32 * 100.0
                } else {
                    0.0
                };
                cb_lock(msg.to_string(), pct);
            }
        }
    }

    /// Error out when the cancel flag has been raised.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.should_cancel() {
            log::info!("Operation cancelled by user");
            bail!("Operation cancelled by user");
        }
        Ok(())
    }

    pub fn should_cancel(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let progress = Progress::new(None, Some(flag.clone()));
        assert!(!progress.should_cancel());
        flag.store(true, Ordering::Relaxed);
        assert!(progress.should_cancel());
    }

    #[test]
    fn test_report_percentage() {
        let seen: Arc<Mutex<Vec<(String, f32)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback =
            Arc::new(Mutex::new(move |msg: String, pct: f32| sink.lock().unwrap().push((msg, pct))));

        let mut progress = Progress::new(Some(cb), None);
        progress.set_total(4);
        progress.add(1);
        progress.report("quarter");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "quarter");
        assert!((seen[0].1 - 25.0).abs() < 1e-6);
    }
}
