//! Transfer progress reporting
//!
//! The client reports raw-body progress through a `TransferObserver`. Each
//! callback gets an explicit `TransferProgress` snapshot, so observers never
//! need process-wide state to work out how far a transfer has come.

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn verb(self) -> &'static str {
        match self {
            Direction::Upload => "Uploading",
            Direction::Download => "Downloading",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    pub direction: Direction,
    pub name: String,
    pub transferred: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.transferred as f64 / self.total as f64
        }
    }
}

pub trait TransferObserver: Send + Sync {
    fn started(&self, _progress: &TransferProgress) {}
    fn advanced(&self, _progress: &TransferProgress) {}
    fn finished(&self, _progress: &TransferProgress) {}
    fn failed(&self, _progress: &TransferProgress, _error: &str) {}
}

pub struct NoopObserver;
impl TransferObserver for NoopObserver {}

/// Terminal progress bar for the command-line client.
pub struct BarObserver {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarObserver {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl Default for BarObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferObserver for BarObserver {
    fn started(&self, progress: &TransferProgress) {
        let bar = ProgressBar::new(progress.total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:30.green}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(format!("{} {}", progress.direction.verb(), progress.name));
        *self.bar.lock() = Some(bar);
    }

    fn advanced(&self, progress: &TransferProgress) {
        if let Some(bar) = self.bar.lock().as_ref() {
            bar.set_position(progress.transferred);
        }
    }

    fn finished(&self, progress: &TransferProgress) {
        if let Some(bar) = self.bar.lock().take() {
            bar.set_position(progress.transferred);
            bar.finish();
        }
    }

    fn failed(&self, _progress: &TransferProgress, error: &str) {
        if let Some(bar) = self.bar.lock().take() {
            bar.abandon_with_message(format!("failed: {}", error));
        }
    }
}
