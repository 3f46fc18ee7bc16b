//! Session engine for WitMotion-style wearable IMUs.
//!
//! The crate connects to the sensor over a serial port, decodes its 11-byte
//! telemetry frames, keeps the latest acceleration and a bounded history for
//! live display, and logs samples to text files on request.
//!
//! # Threads
//!
//! A [`Session`] runs one background acquisition thread per connection. The
//! caller's thread issues commands (connect, calibrate, start logging, ...)
//! and polls status on its own schedule:
//!
//! ```no_run
//! use std::time::Duration;
//! use imu_session::{Endpoint, ReturnRate, Session, SessionConfig};
//!
//! let mut session = Session::new(SessionConfig::default());
//! session.connect(Endpoint::new("/dev/rfcomm0", 115200))?;
//! session.set_return_rate(ReturnRate::Hz100)?;
//! session.start_logging("walk.txt")?;
//! for _ in 0..100 {
//!     if let Some(sample) = session.latest_sample() {
//!         println!("|a| = {:.3} g", sample.norm);
//!     }
//!     std::thread::sleep(Duration::from_millis(50));
//! }
//! let summary = session.stop_logging();
//! session.disconnect();
//! # Ok::<(), imu_session::SessionError>(())
//! ```
//!
//! # Timing
//!
//! The device does not timestamp frames. Each sample carries the monotonic
//! time at which its bytes were read from the port, relative to the start of
//! the connection; frames delivered in the same read share a timestamp.

pub mod acquisition;
pub mod config;
pub mod errors;
pub mod link;
pub mod logger;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod sink;

#[cfg(test)]
mod testutil;

pub use acquisition::{AcquisitionLoop, LoopState};
pub use config::{Endpoint, SessionConfig, COMMON_BAUD_RATES, DEFAULT_BAUD_RATE};
pub use errors::*;
pub use link::{available_ports, ConnectionState, DeviceLink, Transport};
pub use logger::{resolve_log_path, LogSession, LogStatus, LogSummary, Recorder};
pub use protocol::{DecodeStats, FrameDecoder, Reading, ReadingKind, ReturnRate, Vector3};
pub use session::Session;
pub use sink::{Sample, SampleSink, SinkSnapshot};
