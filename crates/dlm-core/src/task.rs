//! One URL→file download: state machine, byte accounting, pause/resume/cancel.
//!
//! A task is shared as `Arc<DownloadTask>` between the registry, the worker
//! running it, and the control connection observing it. All counters and the
//! status live in atomics; `pause`/`cancel` only raise the cancel flag and
//! flip the status, and the in-flight transfer notices at its next write or
//! progress tick and unwinds cooperatively.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::fetch::{self, FetchError};

/// Lifecycle states. Completed and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Idle = 0,
    Downloading = 1,
    Paused = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

impl TaskStatus {
    fn from_u8(v: u8) -> TaskStatus {
        match v {
            1 => TaskStatus::Downloading,
            2 => TaskStatus::Paused,
            3 => TaskStatus::Completed,
            4 => TaskStatus::Failed,
            5 => TaskStatus::Cancelled,
            _ => TaskStatus::Idle,
        }
    }

    /// True for states that accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Idle => "Idle",
            TaskStatus::Downloading => "Downloading",
            TaskStatus::Paused => "Paused",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Invoked on every progress tick with `(downloaded_size, total_size)`,
/// synchronously on the worker thread driving the download.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

pub struct DownloadTask {
    url: String,
    output_path: PathBuf,

    range_start: AtomicU64,
    range_end: AtomicU64,
    timeout_secs: AtomicU64,

    status: AtomicU8,
    downloaded: AtomicU64,
    total: AtomicU64,
    cancel_requested: AtomicBool,
    error_message: Mutex<String>,
    progress_callback: Mutex<Option<ProgressCallback>>,
    last_logged_percent: AtomicI32,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        let url = url.into();
        tracing::info!("created download task for {}", url);
        Self {
            url,
            output_path: output_path.into(),
            range_start: AtomicU64::new(0),
            range_end: AtomicU64::new(0),
            timeout_secs: AtomicU64::new(30),
            status: AtomicU8::new(TaskStatus::Idle as u8),
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(0),
            cancel_requested: AtomicBool::new(false),
            error_message: Mutex::new(String::new()),
            progress_callback: Mutex::new(None),
            last_logged_percent: AtomicI32::new(-1),
        }
    }

    pub fn set_range_start(&self, start: u64) {
        self.range_start.store(start, Ordering::Release);
    }

    pub fn set_range_end(&self, end: u64) {
        self.range_end.store(end, Ordering::Release);
    }

    pub fn set_timeout(&self, secs: u64) {
        self.timeout_secs.store(secs, Ordering::Release);
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.progress_callback.lock().unwrap() = Some(callback);
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn downloaded_size(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn total_size(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Percentage complete, 0.0 while the total is still unknown.
    pub fn progress(&self) -> f64 {
        let total = self.total_size();
        if total == 0 {
            return 0.0;
        }
        self.downloaded_size() as f64 / total as f64 * 100.0
    }

    pub fn error_message(&self) -> String {
        self.error_message.lock().unwrap().clone()
    }

    fn transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Runs the download to a terminal transition. Blocking; must run on a
    /// worker. Returns true iff the task ended Completed.
    ///
    /// Permitted from Idle and Failed; a Failed task retries from its current
    /// `range_start`.
    pub fn start(&self) -> bool {
        loop {
            let current = self.status();
            if current != TaskStatus::Idle && current != TaskStatus::Failed {
                tracing::warn!("cannot start {}: task is {}", self.url, current);
                return false;
            }
            if self.transition(current, TaskStatus::Downloading) {
                break;
            }
        }
        self.cancel_requested.store(false, Ordering::Release);
        self.error_message.lock().unwrap().clear();
        self.perform_download()
    }

    /// Requests a pause. Returns promptly; the in-flight transfer aborts at
    /// its next write or progress tick, so `downloaded_size` may still
    /// advance briefly after this returns.
    pub fn pause(&self) -> bool {
        if !self.transition(TaskStatus::Downloading, TaskStatus::Paused) {
            tracing::warn!("cannot pause {}: task is not downloading", self.url);
            return false;
        }
        tracing::info!("pausing download: {}", self.url);
        self.cancel_requested.store(true, Ordering::Release);
        true
    }

    /// Continues a paused download with a fresh ranged GET from the bytes
    /// already on disk. Blocking like [`start`](Self::start); must run on a
    /// worker.
    pub fn resume(&self) -> bool {
        if !self.transition(TaskStatus::Paused, TaskStatus::Downloading) {
            tracing::warn!("cannot resume {}: task is not paused", self.url);
            return false;
        }
        let offset = self.downloaded.load(Ordering::Acquire);
        tracing::info!("resuming download from byte {}: {}", offset, self.url);
        self.range_start.store(offset, Ordering::Release);
        self.cancel_requested.store(false, Ordering::Release);
        self.error_message.lock().unwrap().clear();
        self.perform_download()
    }

    /// Idempotent; a no-op on Completed and Cancelled (terminal states are
    /// absorbing). Safe to call from any thread in any state.
    pub fn cancel(&self) -> bool {
        loop {
            let current = self.status();
            if current.is_terminal() {
                return true;
            }
            if self.transition(current, TaskStatus::Cancelled) {
                tracing::info!("cancelling download: {}", self.url);
                self.cancel_requested.store(true, Ordering::Release);
                return true;
            }
        }
    }

    fn open_output(&self, resume: bool) -> io::Result<fs::File> {
        let file = if resume {
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.output_path)?
        } else {
            fs::File::create(&self.output_path)?
        };
        tracing::debug!(
            "opened output file {} ({})",
            self.output_path.display(),
            if resume { "append" } else { "truncate" }
        );
        Ok(file)
    }

    /// Drives one GET from the current `range_start` to a terminal
    /// transition. Expects the status to already be Downloading.
    fn perform_download(&self) -> bool {
        let range_start = self.range_start.load(Ordering::Acquire);
        let range_end = self.range_end.load(Ordering::Acquire);
        let timeout = Duration::from_secs(self.timeout_secs.load(Ordering::Acquire));

        self.downloaded.store(range_start, Ordering::Release);
        self.last_logged_percent.store(-1, Ordering::Relaxed);
        tracing::info!("starting download: {}", self.url);

        // Output file state is per transfer, opened lazily on the first byte:
        // append when continuing a range, truncate for a fresh download.
        let mut file: Option<fs::File> = None;
        let mut written: u64 = 0;

        let result = fetch::fetch(
            &self.url,
            range_start,
            range_end,
            timeout,
            |data| {
                if self.cancel_requested.load(Ordering::Acquire) {
                    tracing::debug!("download stopped during write: {}", self.url);
                    return Ok(0);
                }
                if file.is_none() {
                    file = Some(self.open_output(range_start > 0)?);
                }
                if let Some(out) = file.as_mut() {
                    out.write_all(data)?;
                }
                written += data.len() as u64;
                self.downloaded.store(range_start + written, Ordering::Release);
                Ok(data.len())
            },
            |body_total, body_received| {
                if self.cancel_requested.load(Ordering::Acquire) {
                    tracing::debug!("download stopped during progress tick: {}", self.url);
                    return false;
                }
                if body_total > 0 {
                    self.total.store(range_start + body_total, Ordering::Release);
                }
                if body_received > 0 {
                    self.downloaded
                        .store(range_start + body_received, Ordering::Release);
                }
                if let Some(cb) = self.progress_callback.lock().unwrap().as_ref() {
                    cb(self.downloaded_size(), self.total_size());
                }
                self.log_progress_boundary();
                true
            },
        );

        match result {
            Ok(()) => {
                if self.cancel_requested.load(Ordering::Acquire) {
                    // pause/cancel landed after the final tick; their state stands
                    return false;
                }
                let total = self.total_size();
                if total > 0 {
                    self.downloaded.store(total, Ordering::Release);
                } else {
                    // no Content-Length; the body we wrote is the whole resource
                    self.total
                        .store(self.downloaded_size(), Ordering::Release);
                }
                if !self.transition(TaskStatus::Downloading, TaskStatus::Completed) {
                    return false;
                }
                tracing::info!("download completed: {}", self.url);
                true
            }
            Err(FetchError::Aborted) => {
                // pause() or cancel() already moved the status
                false
            }
            Err(e) => {
                if self.transition(TaskStatus::Downloading, TaskStatus::Failed) {
                    *self.error_message.lock().unwrap() = e.to_string();
                    tracing::error!("download failed: {}: {}", self.url, e);
                }
                false
            }
        }
    }

    fn log_progress_boundary(&self) {
        let percent = self.progress() as i32;
        let last = self.last_logged_percent.load(Ordering::Relaxed);
        if percent / 10 > last / 10 {
            self.last_logged_percent.store(percent, Ordering::Relaxed);
            tracing::info!(
                "download progress for {}: {}% ({}/{} bytes)",
                self.url,
                percent,
                self.downloaded_size(),
                self.total_size()
            );
        }
    }
}
