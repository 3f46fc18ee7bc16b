use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the serial link. Surfaced to the caller of the operation that
/// triggered them; never fatal to the process.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open {port} at {baud_rate} baud: {reason}")]
    OpenFailed {
        port: String,
        baud_rate: u32,
        reason: String,
    },
    #[error("command write failed: {0}")]
    WriteFailed(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("serial read failed: {0}")]
    ReadFailed(String),
    #[error("link is not connected")]
    NotConnected,
    #[error("already connected to {0}; disconnect first")]
    AlreadyConnected(String),
}

impl LinkError {
    /// Classify an I/O error raised while writing a command.
    pub(crate) fn from_write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                LinkError::Timeout(format!("command write: {err}"))
            }
            _ => LinkError::WriteFailed(err.to_string()),
        }
    }
}

/// Recoverable irregularities in the telemetry stream.
///
/// These never escape the decoder as errors: the decoder counts them and
/// resynchronises on the next start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeAnomaly {
    #[error("checksum mismatch (expected {expected:#04X}, got {actual:#04X})")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("unknown frame type {0:#04X}")]
    UnknownType(u8),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("a log session is already active")]
    AlreadyLogging,
    #[error("cannot log while the device is not connected")]
    NotConnected,
    #[error("log io error: {0}")]
    Io(#[from] io::Error),
}

/// Either side of the session's error taxonomy, for callers that drive
/// link and log commands through one code path.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Log(#[from] LogError),
}
