//! Engine configuration and link constants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Factory default baud rate of the WT901-family modules.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Baud rates commonly used by the IMU's serial/Bluetooth bridge.
pub const COMMON_BAUD_RATES: [u32; 10] = [
    2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 576000,
];

/// Default number of samples retained for live display.
pub const DEFAULT_PLOT_CAPACITY: usize = 1000;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_READ_CHUNK: usize = 512;
const DEFAULT_COMMAND_DELAY: Duration = Duration::from_millis(50);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_CALIBRATION_HOLD: Duration = Duration::from_secs(1);

/// Serial port identifier plus baud rate.
///
/// The session only accepts a new endpoint while disconnected; a live
/// connection keeps the endpoint it was opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub port: String,
    pub baud_rate: u32,
}

impl Endpoint {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            #[cfg(windows)]
            port: "COM3".to_string(),
            #[cfg(not(windows))]
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Tunables of the session engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on one read poll; also bounds how long a stop request
    /// waits for the acquisition thread.
    pub poll_interval: Duration,
    /// Maximum bytes pulled from the port per poll.
    pub read_chunk: usize,
    /// Settle time after each command write, held under the channel lock.
    pub command_delay: Duration,
    /// Write timeout for command exchanges.
    pub command_timeout: Duration,
    /// Bound on opening the port.
    pub connect_timeout: Duration,
    /// How long the device stays in accelerometer calibration mode.
    pub calibration_hold: Duration,
    /// Initial ring capacity of the sample sink.
    pub plot_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            read_chunk: DEFAULT_READ_CHUNK,
            command_delay: DEFAULT_COMMAND_DELAY,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            calibration_hold: DEFAULT_CALIBRATION_HOLD,
            plot_capacity: DEFAULT_PLOT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_uses_factory_baud() {
        let ep = Endpoint::default();
        assert_eq!(ep.baud_rate, DEFAULT_BAUD_RATE);
        assert!(COMMON_BAUD_RATES.contains(&ep.baud_rate));
    }

    #[test]
    fn default_config_keeps_a_thousand_samples() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.plot_capacity, 1000);
        assert!(cfg.poll_interval < cfg.command_timeout);
    }
}
