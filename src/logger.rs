//! Append-only sample logs.
//!
//! A [`LogSession`] owns one open file and writes one line per sample:
//!
//! ```text
//! <t_ns>,<x>,<y>,<z>,<norm>
//! ```
//!
//! `t_ns` is the sample's monotonic timestamp in nanoseconds since the
//! connection started; the axes and norm are in g with six decimals. Lines go
//! through a `LineWriter`, so every completed line reaches the OS before the
//! next sample is taken.
//!
//! [`Recorder`] is the slot shared between the control thread (start/stop)
//! and the acquisition thread (append). A sample is written if and only if a
//! session occupies the slot when the sample is recorded.

use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local};
use log::{debug, info, warn};

use crate::errors::LogError;
use crate::sink::Sample;

const LOG_EXTENSION: &str = "txt";
const DEFAULT_NAME_FORMAT: &str = "%d %m %Y %H-%M-%S";

/// Format one log line, newline included.
pub fn format_line(sample: &Sample) -> String {
    let a = &sample.acceleration;
    format!(
        "{},{:.6},{:.6},{:.6},{:.6}\n",
        sample.timestamp.as_nanos(),
        a.x,
        a.y,
        a.z,
        sample.norm
    )
}

/// Pick a log file path inside `dir` for the operator-supplied `name`.
///
/// An empty name becomes the current local time. If `<name>.txt` already
/// exists, the current Unix time in milliseconds is appended to the name.
pub fn resolve_log_path(dir: &Path, name: &str) -> PathBuf {
    let now = Local::now();
    let mut stem = name.trim().to_string();
    if stem.is_empty() {
        stem = now.format(DEFAULT_NAME_FORMAT).to_string();
    }
    let candidate = dir.join(format!("{stem}.{LOG_EXTENSION}"));
    if candidate.exists() {
        debug!("{} exists, appending time", candidate.display());
        dir.join(format!("{stem}_{}.{LOG_EXTENSION}", now.timestamp_millis()))
    } else {
        candidate
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogState {
    Active,
    Stopped,
    /// A write or flush failed; the file has been closed.
    Failed(String),
}

/// Final counters of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSummary {
    pub path: PathBuf,
    pub line_count: u64,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    /// Set when the session ended because of an I/O failure.
    pub failure: Option<String>,
}

#[derive(Debug)]
pub struct LogSession {
    path: PathBuf,
    writer: Option<LineWriter<File>>,
    started_at: DateTime<Local>,
    ended_at: Option<DateTime<Local>>,
    line_count: u64,
    state: LogState,
}

impl LogSession {
    /// Create `path` and open it for appending. Never truncates an existing file.
    pub fn start(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => LogError::AlreadyExists(path.clone()),
                _ => LogError::Io(e),
            })?;

        info!("logging to {}", path.display());
        Ok(Self::over(path, file))
    }

    fn over(path: PathBuf, file: File) -> Self {
        Self {
            path,
            writer: Some(LineWriter::new(file)),
            started_at: Local::now(),
            ended_at: None,
            line_count: 0,
            state: LogState::Active,
        }
    }

    /// Write one line for `sample`.
    ///
    /// A failed write closes the file and moves the session to
    /// [`LogState::Failed`]; later appends are rejected.
    pub fn append(&mut self, sample: &Sample) -> Result<(), LogError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(LogError::Io(io::Error::other(format!(
                "log session for {} is closed",
                self.path.display()
            ))));
        };

        if let Err(e) = writer.write_all(format_line(sample).as_bytes()) {
            warn!("log write to {} failed: {e}", self.path.display());
            self.close(LogState::Failed(e.to_string()));
            return Err(LogError::Io(e));
        }
        self.line_count += 1;
        Ok(())
    }

    /// Flush and close the file. Calling it again returns the same summary.
    pub fn stop(&mut self) -> LogSummary {
        if let Some(writer) = self.writer.as_mut() {
            match writer.flush() {
                Ok(()) => self.close(LogState::Stopped),
                Err(e) => {
                    warn!("final flush of {} failed: {e}", self.path.display());
                    self.close(LogState::Failed(e.to_string()));
                }
            }
        }
        self.summary()
    }

    fn close(&mut self, state: LogState) {
        // Dropping the LineWriter flushes what it can and closes the handle.
        self.writer = None;
        self.ended_at = Some(Local::now());
        self.state = state;
        debug!(
            "closed {} after {} lines",
            self.path.display(),
            self.line_count
        );
    }

    pub fn summary(&self) -> LogSummary {
        LogSummary {
            path: self.path.clone(),
            line_count: self.line_count,
            started_at: self.started_at,
            ended_at: self.ended_at.unwrap_or_else(Local::now),
            failure: match &self.state {
                LogState::Failed(reason) => Some(reason.clone()),
                _ => None,
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line_count(&self) -> u64 {
        self.line_count
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn state(&self) -> &LogState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == LogState::Active
    }
}

impl Drop for LogSession {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.stop();
        }
    }
}

/// Logging status as seen by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogStatus {
    Idle,
    Logging { path: PathBuf, lines: u64 },
    /// The last session ended on an I/O failure. Cleared by the next start.
    Failed { path: PathBuf, reason: String },
}

#[derive(Debug, Default)]
struct Slot {
    active: Option<LogSession>,
    last: Option<LogSummary>,
}

/// Holder of the single active [`LogSession`].
#[derive(Debug, Default)]
pub struct Recorder {
    slot: Mutex<Slot>,
    logging: AtomicBool,
    lines: AtomicU64,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self, path: impl Into<PathBuf>) -> Result<(), LogError> {
        let mut slot = self.slot();
        if slot.active.is_some() {
            return Err(LogError::AlreadyLogging);
        }
        slot.active = Some(LogSession::start(path)?);
        slot.last = None;
        self.lines.store(0, Ordering::Release);
        self.logging.store(true, Ordering::Release);
        Ok(())
    }

    /// Append `sample` to the active session, if any. Returns whether a line
    /// was written. A write failure ends the session.
    pub fn record(&self, sample: &Sample) -> bool {
        let mut slot = self.slot();
        let Some(session) = slot.active.as_mut() else {
            return false;
        };
        match session.append(sample) {
            Ok(()) => {
                self.lines.store(session.line_count(), Ordering::Release);
                true
            }
            Err(e) => {
                warn!("log session ended: {e}");
                self.finish(&mut slot);
                false
            }
        }
    }

    /// Stop the active session. Without one, returns the summary of the
    /// previous session (if any) so repeated calls are harmless.
    pub fn stop(&self) -> Option<LogSummary> {
        let mut slot = self.slot();
        if slot.active.is_some() {
            self.finish(&mut slot);
        }
        slot.last.clone()
    }

    fn finish(&self, slot: &mut Slot) {
        if let Some(mut session) = slot.active.take() {
            let summary = session.stop();
            info!(
                "log {} closed: {} lines",
                summary.path.display(),
                summary.line_count
            );
            self.lines.store(summary.line_count, Ordering::Release);
            self.logging.store(false, Ordering::Release);
            slot.last = Some(summary);
        }
    }

    pub fn is_logging(&self) -> bool {
        self.logging.load(Ordering::Acquire)
    }

    /// Lines written by the active session, or by the last one once stopped.
    pub fn line_count(&self) -> u64 {
        self.lines.load(Ordering::Acquire)
    }

    pub fn status(&self) -> LogStatus {
        let slot = self.slot();
        if let Some(session) = &slot.active {
            return LogStatus::Logging {
                path: session.path().to_path_buf(),
                lines: session.line_count(),
            };
        }
        match &slot.last {
            Some(LogSummary {
                path,
                failure: Some(reason),
                ..
            }) => LogStatus::Failed {
                path: path.clone(),
                reason: reason.clone(),
            },
            _ => LogStatus::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Vector3;
    use crate::testutil::ScratchDir;
    use std::fs;
    use std::time::Duration;

    fn sample(i: u64) -> Sample {
        Sample::new(
            Duration::from_millis(i),
            Vector3::new(0.5, -0.25, i as f64),
        )
    }

    #[test]
    fn line_format() {
        let s = Sample::new(Duration::from_micros(1500), Vector3::new(0.0, 3.0, 4.0));
        assert_eq!(
            format_line(&s),
            "1500000,0.000000,3.000000,4.000000,5.000000\n"
        );
    }

    #[test]
    fn k_appends_give_k_lines() {
        let dir = ScratchDir::new("k_lines");
        let path = dir.path().join("run.txt");
        let mut session = LogSession::start(&path).unwrap();
        for i in 0..25 {
            session.append(&sample(i)).unwrap();
        }
        let summary = session.stop();
        assert_eq!(summary.line_count, 25);
        assert!(summary.ended_at >= summary.started_at);
        assert_eq!(summary.failure, None);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 25);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn stop_is_idempotent_and_rejects_appends() {
        let dir = ScratchDir::new("idempotent");
        let mut session = LogSession::start(dir.path().join("a.txt")).unwrap();
        session.append(&sample(1)).unwrap();
        let first = session.stop();
        let second = session.stop();
        assert_eq!(first, second);
        assert!(session.append(&sample(2)).is_err());
        assert_eq!(session.line_count(), 1);
        assert_eq!(session.state(), &LogState::Stopped);
    }

    #[test]
    fn existing_file_is_not_truncated() {
        let dir = ScratchDir::new("exists");
        let path = dir.path().join("taken.txt");
        fs::write(&path, "keep me\n").unwrap();
        let err = LogSession::start(&path).unwrap_err();
        assert!(matches!(err, LogError::AlreadyExists(p) if p == path));
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep me\n");
    }

    #[test]
    fn missing_directory_is_io_error() {
        let dir = ScratchDir::new("missing");
        let err = LogSession::start(dir.path().join("nope").join("x.txt")).unwrap_err();
        assert!(matches!(err, LogError::Io(_)));
    }

    #[test]
    fn recorder_rejects_second_session() {
        let dir = ScratchDir::new("second");
        let recorder = Recorder::new();
        recorder.start(dir.path().join("one.txt")).unwrap();
        assert!(recorder.record(&sample(0)));

        let err = recorder.start(dir.path().join("two.txt")).unwrap_err();
        assert!(matches!(err, LogError::AlreadyLogging));
        assert!(!dir.path().join("two.txt").exists());

        assert!(recorder.record(&sample(1)));
        let summary = recorder.stop().unwrap();
        assert_eq!(summary.line_count, 2);
        assert_eq!(recorder.line_count(), 2);
        assert!(!recorder.is_logging());
        assert_eq!(recorder.status(), LogStatus::Idle);
    }

    #[test]
    fn recorder_without_session_drops_samples() {
        let recorder = Recorder::new();
        assert!(!recorder.record(&sample(0)));
        assert_eq!(recorder.stop(), None);
        assert_eq!(recorder.line_count(), 0);
    }

    #[test]
    fn recorder_stop_twice_returns_last_summary() {
        let dir = ScratchDir::new("stop_twice");
        let recorder = Recorder::new();
        recorder.start(dir.path().join("s.txt")).unwrap();
        recorder.record(&sample(0));
        let a = recorder.stop();
        let b = recorder.stop();
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    /// A session whose writes fail with ENOSPC.
    #[cfg(target_os = "linux")]
    fn session_on_full_device() -> LogSession {
        let file = OpenOptions::new().write(true).open("/dev/full").unwrap();
        LogSession::over(PathBuf::from("/dev/full"), file)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn write_failure_closes_session() {
        let mut session = session_on_full_device();
        assert!(matches!(session.append(&sample(0)), Err(LogError::Io(_))));
        assert!(matches!(session.state(), LogState::Failed(_)));
        assert!(!session.is_active());
        assert_eq!(session.line_count(), 0);

        assert!(session.append(&sample(1)).is_err());
        let summary = session.stop();
        assert!(summary.failure.is_some());
        assert_eq!(summary.line_count, 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn recorder_reports_write_failure_until_next_start() {
        let dir = ScratchDir::new("write_failure");
        let recorder = Recorder::new();
        {
            let mut slot = recorder.slot();
            slot.active = Some(session_on_full_device());
        }
        recorder.logging.store(true, Ordering::Release);

        assert!(!recorder.record(&sample(0)));
        assert!(!recorder.is_logging());
        assert!(matches!(
            recorder.status(),
            LogStatus::Failed { ref path, .. } if path == Path::new("/dev/full")
        ));
        assert!(!recorder.record(&sample(1)));

        // Stopping with nothing active leaves the failure visible.
        let summary = recorder.stop().unwrap();
        assert!(summary.failure.is_some());
        assert!(matches!(recorder.status(), LogStatus::Failed { .. }));

        recorder.start(dir.path().join("next.txt")).unwrap();
        assert!(matches!(recorder.status(), LogStatus::Logging { lines: 0, .. }));
        recorder.stop();
    }

    #[test]
    fn resolve_path_disambiguates() {
        let dir = ScratchDir::new("resolve");
        let fresh = resolve_log_path(dir.path(), "walk");
        assert_eq!(fresh, dir.path().join("walk.txt"));

        fs::write(&fresh, "").unwrap();
        let next = resolve_log_path(dir.path(), " walk ");
        assert_ne!(next, fresh);
        let name = next.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("walk_") && name.ends_with(".txt"));

        let stamped = resolve_log_path(dir.path(), "");
        assert_eq!(stamped.extension().unwrap(), "txt");
    }
}
