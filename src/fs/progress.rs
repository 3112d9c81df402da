//! Progress reporting and cooperative cancellation for transfers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Snapshot of a running transfer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// Name of the file being transferred
    pub file_name: String,
    /// Bytes done for the current file
    pub done: u64,
    /// Size of the current file
    pub total: u64,
    /// Position of the current item in the batch (0-based)
    pub file_index: usize,
    /// Number of items in the batch
    pub file_count: usize,
}

impl Progress {
    /// Percentage of the current file; 100 when the file is empty
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.done.min(self.total) * 100 / self.total) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.done >= self.total
    }
}

/// Where the transfer engine reports progress.
///
/// The engine emits after every chunk; throttling is the receiver's business
/// (see [`ProgressThrottle`]).
pub struct ProgressSink<'a> {
    report: &'a dyn Fn(&Progress),
    file_index: usize,
    file_count: usize,
}

impl<'a> ProgressSink<'a> {
    pub fn new(report: &'a dyn Fn(&Progress)) -> Self {
        Self {
            report,
            file_index: 0,
            file_count: 1,
        }
    }

    /// Position of the current item within a batch, forwarded in every update
    pub fn with_batch(mut self, file_index: usize, file_count: usize) -> Self {
        self.file_index = file_index;
        self.file_count = file_count;
        self
    }

    pub(crate) fn emit(&self, file_name: &str, done: u64, total: u64) {
        (self.report)(&Progress {
            file_name: file_name.to_string(),
            done,
            total,
            file_index: self.file_index,
            file_count: self.file_count,
        });
    }
}

/// One-way cancellation signal shared between the UI and a background task
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Rate limiter for progress updates.
///
/// Lets through at most one update per interval, plus every update that
/// completes a file so the final state is never dropped.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_emit(&mut self, progress: &Progress) -> bool {
        let now = Instant::now();
        let due = match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if due || progress.is_complete() {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(done: u64, total: u64) -> Progress {
        Progress {
            file_name: "f".into(),
            done,
            total,
            ..Default::default()
        }
    }

    #[test]
    fn test_percent() {
        assert_eq!(progress(0, 0).percent(), 100);
        assert_eq!(progress(50, 200).percent(), 25);
        assert_eq!(progress(300, 200).percent(), 100);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_throttle_drops_intermediate_but_keeps_final() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(3600));
        assert!(throttle.should_emit(&progress(1, 10)));
        assert!(!throttle.should_emit(&progress(2, 10)));
        assert!(!throttle.should_emit(&progress(9, 10)));
        assert!(throttle.should_emit(&progress(10, 10)));
    }

    #[test]
    fn test_sink_forwards_batch_position() {
        let seen = std::sync::Mutex::new(Vec::new());
        let report = |p: &Progress| seen.lock().unwrap().push(p.clone());
        let sink = ProgressSink::new(&report).with_batch(2, 5);
        sink.emit("a.txt", 4, 8);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].file_name, "a.txt");
        assert_eq!((seen[0].file_index, seen[0].file_count), (2, 5));
        assert_eq!(seen[0].percent(), 50);
    }
}
