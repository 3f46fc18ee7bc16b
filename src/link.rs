//! Serial link to the IMU.
//!
//! The acquisition thread and the control thread share one byte channel. A
//! single mutex serialises access per exchange: one read poll, or one command
//! sequence including its settle delay. Neither side holds it across more
//! than that, so streaming and commands interleave at exchange granularity
//! and a command's bytes are never mixed into the telemetry read path.

use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{Endpoint, SessionConfig};
use crate::errors::LinkError;
use crate::protocol::{command, ReturnRate};

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Byte channel the link drives: a serial port, or anything else that reads
/// and writes bytes with a short read timeout.
pub trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Connection lifecycle as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Names of the serial ports currently present, sorted.
///
/// Enumeration failures are logged and yield an empty list.
pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => {
            let mut names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
            names.sort();
            names
        }
        Err(e) => {
            warn!("serial port enumeration failed: {e}");
            Vec::new()
        }
    }
}

// ============================================================================
// DeviceLink
// ============================================================================

pub struct DeviceLink {
    channel: Mutex<Option<Box<dyn Transport>>>,
    state: RwLock<ConnectionState>,
    endpoint: RwLock<Option<Endpoint>>,
    config: SessionConfig,
}

impl DeviceLink {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            channel: Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            endpoint: RwLock::new(None),
            config,
        }
    }

    fn channel(&self) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Endpoint of the current (or most recent) connection.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open the serial port named by `endpoint`.
    ///
    /// Success only means bytes can be exchanged; nothing is sent to check
    /// that the peer is an IMU. Opening is bounded by
    /// `SessionConfig::connect_timeout`, since some Bluetooth serial drivers
    /// hang in `open`.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<ConnectionState, LinkError> {
        self.disconnect();
        self.set_state(ConnectionState::Connecting);
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.clone());
        info!(
            "opening {} at {} baud",
            endpoint.port, endpoint.baud_rate
        );

        let (tx, rx) = mpsc::channel();
        let port_name = endpoint.port.clone();
        let baud_rate = endpoint.baud_rate;
        let poll = self.config.poll_interval;
        thread::spawn(move || {
            let result = serialport::new(&port_name, baud_rate).timeout(poll).open();
            // The receiver is gone if we already timed out; the port then closes here.
            let _ = tx.send(result);
        });

        let opened = match rx.recv_timeout(self.config.connect_timeout) {
            Ok(Ok(port)) => Ok(port),
            Ok(Err(e)) => Err(LinkError::OpenFailed {
                port: endpoint.port.clone(),
                baud_rate: endpoint.baud_rate,
                reason: e.to_string(),
            }),
            Err(_) => Err(LinkError::Timeout(format!(
                "opening {} took longer than {:?}",
                endpoint.port, self.config.connect_timeout
            ))),
        };

        match opened {
            Ok(port) => Ok(self.attach(endpoint, Box::new(port))),
            Err(e) => {
                warn!("connect failed: {e}");
                self.set_state(ConnectionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Adopt an already-open transport as the link's channel.
    pub fn attach(&self, endpoint: &Endpoint, transport: Box<dyn Transport>) -> ConnectionState {
        *self.channel() = Some(transport);
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.clone());
        self.set_state(ConnectionState::Connected);
        debug!("link connected to {}", endpoint.port);
        ConnectionState::Connected
    }

    /// Close the channel. Always succeeds; calling it twice is harmless.
    pub fn disconnect(&self) {
        let closed = self.channel().take().is_some();
        self.set_state(ConnectionState::Disconnected);
        if closed {
            info!("link disconnected");
        }
    }

    /// Close the channel after an unrecoverable error.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.channel().take();
        warn!("link failed: {reason}");
        self.set_state(ConnectionState::Failed(reason));
    }

    /// Bytes that arrived since the last call, possibly none.
    ///
    /// Waits at most one port timeout (`SessionConfig::poll_interval`).
    pub fn read_available(&self) -> Result<Vec<u8>, LinkError> {
        let mut channel = self.channel();
        let port = channel.as_mut().ok_or(LinkError::NotConnected)?;

        let mut buf = vec![0u8; self.config.read_chunk.max(1)];
        match port.read(&mut buf) {
            // A serial port reports an idle line as a timeout, never as Ok(0).
            Ok(0) => Err(LinkError::ReadFailed("end of stream".to_string())),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Vec::new())
            }
            Err(e) => Err(LinkError::ReadFailed(e.to_string())),
        }
    }

    /// Write one command while holding the channel.
    pub fn send_command(&self, bytes: &[u8]) -> Result<(), LinkError> {
        self.send_sequence(&[bytes])
    }

    /// Write several commands back to back under one hold of the channel,
    /// waiting `command_delay` after each for the device to apply it.
    ///
    /// The device sends no acknowledgment; success means the bytes were
    /// written.
    pub fn send_sequence(&self, commands: &[&[u8]]) -> Result<(), LinkError> {
        let mut channel = self.channel();
        let port = channel.as_mut().ok_or(LinkError::NotConnected)?;

        for cmd in commands {
            debug!("command {:02X?}", cmd);
            write_bounded(port.as_mut(), cmd, self.config.command_timeout)?;
            port.flush().map_err(LinkError::from_write)?;
            thread::sleep(self.config.command_delay);
        }
        Ok(())
    }

    /// Change how often the device streams frames, and save it.
    pub fn set_return_rate(&self, rate: ReturnRate) -> Result<(), LinkError> {
        let sequence: [&[u8]; 3] = [
            &command::unlock(),
            &command::return_rate(rate),
            &command::save(),
        ];
        self.send_sequence(&sequence)?;
        info!("return rate set to {rate}");
        Ok(())
    }

    /// Run accelerometer calibration. The sensor must lie still and level.
    ///
    /// The channel is released while the device calibrates, so streaming
    /// continues during the hold.
    pub fn calibrate_acceleration(&self) -> Result<(), LinkError> {
        let begin: [&[u8]; 2] = [&command::unlock(), &command::begin_accel_calibration()];
        let end: [&[u8]; 3] = [
            &command::unlock(),
            &command::end_calibration(),
            &command::save(),
        ];
        self.send_sequence(&begin)?;
        thread::sleep(self.config.calibration_hold);
        self.send_sequence(&end)?;
        info!("accelerometer calibration sent");
        Ok(())
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// `write_all` with an overall deadline; partial writes and per-call
/// timeouts are retried until `timeout` has passed.
fn write_bounded(port: &mut dyn Transport, mut bytes: &[u8], timeout: Duration) -> Result<(), LinkError> {
    let deadline = Instant::now() + timeout;
    while !bytes.is_empty() {
        match port.write(bytes) {
            Ok(0) => return Err(LinkError::WriteFailed("port accepted no bytes".into())),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e)
                if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
            {
                if Instant::now() >= deadline {
                    return Err(LinkError::Timeout(format!(
                        "command write exceeded {timeout:?}"
                    )));
                }
            }
            Err(e) => return Err(LinkError::from_write(e)),
        }
    }
    Ok(())
}
