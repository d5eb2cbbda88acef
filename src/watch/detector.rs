//! Wake-up sources for the watch loop.
use anyhow::{anyhow, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::warn;

pub trait ChangeDetector: Send {
    /// Block until a change is reported or `timeout` passes. Returns whether
    /// a change was reported.
    fn wait(&mut self, timeout: Duration) -> Result<bool>;

    fn name(&self) -> &'static str;
}

/// Filesystem notifications for the drop folders.
pub struct NotifyDetector {
    rx: Receiver<()>,
    /// Keeps the OS watch registered.
    _watcher: RecommendedWatcher,
}

impl NotifyDetector {
    pub fn new(dirs: &[PathBuf]) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        let _ = tx.send(());
                    }
                }
            })?;
        for dir in dirs {
            watcher.watch(dir, RecursiveMode::Recursive)?;
        }
        Ok(Self {
            rx,
            _watcher: watcher,
        })
    }
}

impl ChangeDetector for NotifyDetector {
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => {
                // Collapse a burst of events into one wake-up.
                while self.rx.try_recv().is_ok() {}
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("file watcher disconnected")),
        }
    }

    fn name(&self) -> &'static str {
        "notify"
    }
}

/// Fixed-interval rescans.
pub struct PollDetector;

impl ChangeDetector for PollDetector {
    fn wait(&mut self, timeout: Duration) -> Result<bool> {
        thread::sleep(timeout);
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

/// Prefer notifications; fall back to polling where the platform refuses them.
pub fn open_detector(dirs: &[PathBuf], force_poll: bool) -> Box<dyn ChangeDetector> {
    if force_poll {
        return Box::new(PollDetector);
    }
    match NotifyDetector::new(dirs) {
        Ok(detector) => Box::new(detector),
        Err(err) => {
            warn!(error = %err, "file notifications unavailable; polling");
            Box::new(PollDetector)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_detector_times_out_without_change() {
        let mut detector = PollDetector;
        assert!(!detector.wait(Duration::from_millis(1)).unwrap());
        assert_eq!(detector.name(), "poll");
    }

    #[test]
    fn forced_polling_skips_notifications() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(open_detector(&[dir.path().to_path_buf()], true).name(), "poll");
    }

    #[test]
    fn notify_detector_wakes_on_new_file() {
        let incoming = tempfile::tempdir().expect("tempdir");
        let uploads = tempfile::tempdir().expect("tempdir");
        let dirs = [incoming.path().to_path_buf(), uploads.path().to_path_buf()];
        let mut detector = NotifyDetector::new(&dirs).expect("notify watcher");
        assert_eq!(detector.name(), "notify");

        let run_dir = uploads.path().join("acme-Q2");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("fixed.csv"), "a\n").unwrap();
        assert!(detector.wait(Duration::from_secs(5)).unwrap());
    }
}
