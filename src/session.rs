//! The session engine: one device, its acquisition thread, the live sample
//! buffer and the log recorder, behind the operations a presentation layer
//! needs.
//!
//! Commands are issued from a single control thread and either complete or
//! fail with an explicit error. Status readers never fail and never block for
//! longer than a short lock hold, so a UI can poll them on a timer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use crate::acquisition::{AcquisitionLoop, LoopState};
use crate::config::{Endpoint, SessionConfig};
use crate::errors::{LinkError, LogError};
use crate::link::{self, ConnectionState, DeviceLink, Transport};
use crate::logger::{resolve_log_path, LogStatus, LogSummary, Recorder};
use crate::protocol::{DecodeStats, ReturnRate};
use crate::sink::{Sample, SampleSink};

pub struct Session {
    endpoint: Endpoint,
    link: Arc<DeviceLink>,
    sink: Arc<SampleSink>,
    recorder: Arc<Recorder>,
    acquisition: AcquisitionLoop,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            endpoint: Endpoint::default(),
            sink: Arc::new(SampleSink::new(config.plot_capacity)),
            link: Arc::new(DeviceLink::new(config)),
            recorder: Arc::new(Recorder::new()),
            acquisition: AcquisitionLoop::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Endpoint used by the current or next connection.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Change the endpoint. Rejected while connected.
    pub fn set_endpoint(&mut self, endpoint: Endpoint) -> Result<(), LinkError> {
        self.ensure_disconnected()?;
        self.endpoint = endpoint;
        Ok(())
    }

    /// Open `endpoint` and start streaming.
    pub fn connect(&mut self, endpoint: Endpoint) -> Result<ConnectionState, LinkError> {
        self.ensure_disconnected()?;
        self.retire_previous_connection();
        self.endpoint = endpoint;
        self.link.connect(&self.endpoint)?;
        self.start_acquisition()
    }

    /// Start streaming over an already-open transport instead of a serial port.
    pub fn attach(
        &mut self,
        endpoint: Endpoint,
        transport: Box<dyn Transport>,
    ) -> Result<ConnectionState, LinkError> {
        self.ensure_disconnected()?;
        self.retire_previous_connection();
        self.endpoint = endpoint;
        self.link.attach(&self.endpoint, transport);
        self.start_acquisition()
    }

    /// Join a loop that ended on its own and close any log it left behind,
    /// so samples from the next connection never land in an old file.
    fn retire_previous_connection(&mut self) {
        self.acquisition.stop();
        if let Some(summary) = self.stop_logging_if_active() {
            info!(
                "log {} closed before reconnecting ({} lines)",
                summary.path.display(),
                summary.line_count
            );
        }
    }

    fn start_acquisition(&mut self) -> Result<ConnectionState, LinkError> {
        self.sink.clear();
        let started = self.acquisition.start(
            Arc::clone(&self.link),
            Arc::clone(&self.sink),
            Arc::clone(&self.recorder),
        );
        match started {
            Ok(()) => {
                info!("streaming from {}", self.endpoint.port);
                Ok(self.link.state())
            }
            Err(e) => {
                let reason = format!("failed to start acquisition thread: {e}");
                self.link.mark_failed(reason.clone());
                Err(LinkError::ReadFailed(reason))
            }
        }
    }

    /// Stop streaming, close any log session, then close the port.
    /// Always succeeds.
    pub fn disconnect(&mut self) {
        self.acquisition.stop();
        if let Some(summary) = self.stop_logging_if_active() {
            info!(
                "log {} closed on disconnect ({} lines)",
                summary.path.display(),
                summary.line_count
            );
        }
        self.link.disconnect();
    }

    fn stop_logging_if_active(&self) -> Option<LogSummary> {
        if self.recorder.is_logging() {
            self.recorder.stop()
        } else {
            None
        }
    }

    pub fn set_return_rate(&self, rate: ReturnRate) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.link.set_return_rate(rate)
    }

    pub fn calibrate_acceleration(&self) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.link.calibrate_acceleration()
    }

    /// Begin logging to `path`, which must not exist yet.
    pub fn start_logging(&self, path: impl Into<PathBuf>) -> Result<(), LogError> {
        if !self.link.state().is_connected() {
            warn!("cannot start logging: not connected");
            return Err(LogError::NotConnected);
        }
        self.recorder.start(path)?;
        // The acquisition thread may have failed the link while the file was
        // being opened. It closes the recorder only after marking the link,
        // so either it saw this session or the check below does.
        if !self.link.state().is_connected() {
            warn!("link failed while starting the log; closing it");
            self.recorder.stop();
            return Err(LogError::NotConnected);
        }
        Ok(())
    }

    /// Begin logging to `<dir>/<name>.txt`, choosing a fresh name when
    /// `name` is empty or taken. Returns the path actually used.
    pub fn start_logging_in(&self, dir: &Path, name: &str) -> Result<PathBuf, LogError> {
        let path = resolve_log_path(dir, name);
        self.start_logging(&path)?;
        Ok(path)
    }

    /// Close the log session. Returns the summary of the session just closed,
    /// or of the previous one when nothing was active.
    pub fn stop_logging(&self) -> Option<LogSummary> {
        self.recorder.stop()
    }

    pub fn set_plot_capacity(&self, capacity: usize) {
        self.sink.set_capacity(capacity);
    }

    fn ensure_connected(&self) -> Result<(), LinkError> {
        if self.link.state().is_connected() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    fn ensure_disconnected(&self) -> Result<(), LinkError> {
        match self.link.state() {
            ConnectionState::Connected | ConnectionState::Connecting => {
                Err(LinkError::AlreadyConnected(self.endpoint.port.clone()))
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn latest_sample(&self) -> Option<Sample> {
        self.sink.latest()
    }

    /// Samples retained for display, oldest first.
    pub fn recent_samples(&self) -> Vec<Sample> {
        self.sink.recent()
    }

    pub fn plot_capacity(&self) -> usize {
        self.sink.capacity()
    }

    pub fn is_logging(&self) -> bool {
        self.recorder.is_logging()
    }

    pub fn line_count(&self) -> u64 {
        self.recorder.line_count()
    }

    pub fn log_status(&self) -> LogStatus {
        self.recorder.status()
    }

    pub fn decode_stats(&self) -> DecodeStats {
        self.acquisition.decode_stats()
    }

    pub fn acquisition_state(&self) -> LoopState {
        self.acquisition.state()
    }

    pub fn available_ports(&self) -> Vec<String> {
        link::available_ports()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
