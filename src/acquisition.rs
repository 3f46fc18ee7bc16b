//! Background acquisition thread.
//!
//! The loop owns the read side of the link: it polls for bytes, decodes
//! them, turns every acceleration reading into a [`Sample`] stamped with the
//! time the bytes were captured, publishes it for display and hands it to
//! the recorder. Other reading kinds are decoded to keep frame alignment but
//! go no further.
//!
//! Stopping is cooperative. The stop flag is checked between polls, so a
//! request is honoured within one poll interval and never in the middle of a
//! decoded batch.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, info, warn};

use crate::errors::LinkError;
use crate::link::DeviceLink;
use crate::logger::Recorder;
use crate::protocol::{DecodeStats, FrameDecoder, Reading};
use crate::sink::{Sample, SampleSink};

const THREAD_NAME: &str = "imu-acquisition";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LoopState::Idle => 0,
            LoopState::Running => 1,
            LoopState::Stopping => 2,
        }
    }
}

/// Everything the worker thread touches.
struct Worker {
    link: Arc<DeviceLink>,
    sink: Arc<SampleSink>,
    recorder: Arc<Recorder>,
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    stats: Arc<Mutex<DecodeStats>>,
}

impl Worker {
    fn run(self) {
        let epoch = Instant::now();
        let mut decoder = FrameDecoder::new();
        debug!("acquisition started");

        while !self.stop.load(Ordering::Acquire) {
            let bytes = match self.link.read_available() {
                Ok(bytes) => bytes,
                Err(LinkError::NotConnected) => {
                    debug!("link closed underneath the acquisition loop");
                    break;
                }
                Err(e) => {
                    warn!("acquisition stopped: {e}");
                    self.link.mark_failed(e.to_string());
                    self.recorder.stop();
                    break;
                }
            };
            if bytes.is_empty() {
                continue;
            }

            let captured_at = epoch.elapsed();
            for reading in decoder.feed(&bytes) {
                if let Reading::Acceleration(acceleration) = reading {
                    let sample = Sample::new(captured_at, acceleration);
                    self.sink.publish(sample);
                    self.recorder.record(&sample);
                }
            }
            *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = decoder.stats();
        }

        let stats = decoder.stats();
        info!(
            "acquisition ended: {} frames, {} checksum errors, {} unknown types",
            stats.frames, stats.checksum_errors, stats.unknown_types
        );
        self.state.store(LoopState::Idle.as_u8(), Ordering::Release);
    }
}

/// Handle to the acquisition thread.
pub struct AcquisitionLoop {
    stop: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    stats: Arc<Mutex<DecodeStats>>,
    handle: Option<JoinHandle<()>>,
}

impl Default for AcquisitionLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionLoop {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(LoopState::Idle.as_u8())),
            stats: Arc::new(Mutex::new(DecodeStats::default())),
            handle: None,
        }
    }

    /// Spawn the worker. A loop that is already running is stopped first.
    pub fn start(
        &mut self,
        link: Arc<DeviceLink>,
        sink: Arc<SampleSink>,
        recorder: Arc<Recorder>,
    ) -> io::Result<()> {
        self.stop();
        self.stop.store(false, Ordering::Release);
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = DecodeStats::default();
        self.state
            .store(LoopState::Running.as_u8(), Ordering::Release);

        let worker = Worker {
            link,
            sink,
            recorder,
            stop: Arc::clone(&self.stop),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        };
        match thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.store(LoopState::Idle.as_u8(), Ordering::Release);
                Err(e)
            }
        }
    }

    /// Ask the worker to finish and wait for it. Returns within about one
    /// poll interval; harmless when nothing is running.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.state.compare_exchange(
            LoopState::Running.as_u8(),
            LoopState::Stopping.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            warn!("acquisition thread panicked");
        }
        self.state.store(LoopState::Idle.as_u8(), Ordering::Release);
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// Decoder counters as of the last processed poll.
    pub fn decode_stats(&self) -> DecodeStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AcquisitionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, SessionConfig};
    use crate::link::ConnectionState;
    use crate::protocol::encode_axes;
    use crate::testutil::{wait_until, MockPort, ScratchDir};
    use std::fs;
    use std::time::Duration;

    struct Rig {
        link: Arc<DeviceLink>,
        sink: Arc<SampleSink>,
        recorder: Arc<Recorder>,
        port: MockPort,
        acq: AcquisitionLoop,
    }

    fn rig() -> Rig {
        let link = Arc::new(DeviceLink::new(SessionConfig::default()));
        let port = MockPort::new();
        link.attach(&Endpoint::new("mock", 115200), Box::new(port.clone()));
        let sink = Arc::new(SampleSink::new(100));
        let recorder = Arc::new(Recorder::new());
        let mut acq = AcquisitionLoop::new();
        acq.start(Arc::clone(&link), Arc::clone(&sink), Arc::clone(&recorder))
            .unwrap();
        Rig {
            link,
            sink,
            recorder,
            port,
            acq,
        }
    }

    #[test]
    fn publishes_acceleration_only() {
        let rig = rig();
        assert!(rig.acq.is_running());

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_axes(0x51, [2048, 0, 0]));
        bytes.extend_from_slice(&encode_axes(0x52, [1, 2, 3]));
        bytes.extend_from_slice(&encode_axes(0x53, [1, 2, 3]));
        bytes.extend_from_slice(&encode_axes(0x51, [0, 2048, 0]));
        rig.port.push(&bytes);

        assert!(wait_until(Duration::from_secs(2), || rig.sink.len() == 2));
        let recent = rig.sink.recent();
        assert_eq!(recent[0].acceleration.x, 1.0);
        assert_eq!(recent[1].acceleration.y, 1.0);
        assert!(wait_until(Duration::from_secs(2), || {
            rig.acq.decode_stats().frames == 4
        }));
    }

    #[test]
    fn timestamps_do_not_go_backwards() {
        let rig = rig();
        for i in 0..5 {
            rig.port.push(&encode_axes(0x51, [i, 0, 0]));
            assert!(wait_until(Duration::from_secs(2), || {
                rig.sink.len() == i as usize + 1
            }));
        }
        let times: Vec<Duration> = rig.sink.recent().iter().map(|s| s.timestamp).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let mut rig = rig();
        let started = Instant::now();
        rig.acq.stop();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(rig.acq.state(), LoopState::Idle);
        rig.acq.stop();

        rig.port.push(&encode_axes(0x51, [1, 1, 1]));
        thread::sleep(Duration::from_millis(30));
        assert!(rig.sink.is_empty());
        assert_eq!(rig.port.queued(), FRAME_BYTES);
    }

    const FRAME_BYTES: usize = crate::protocol::FRAME_LEN;

    #[test]
    fn read_failure_fails_link_and_closes_log() {
        let dir = ScratchDir::new("acq_fail");
        let rig = rig();
        let path = dir.path().join("run.txt");
        rig.recorder.start(&path).unwrap();

        rig.port.push(&encode_axes(0x51, [0, 0, 2048]));
        assert!(wait_until(Duration::from_secs(2), || {
            rig.recorder.line_count() == 1
        }));

        rig.port.fail_reads(io::ErrorKind::BrokenPipe);
        assert!(wait_until(Duration::from_secs(2), || {
            rig.acq.state() == LoopState::Idle
        }));
        assert!(matches!(rig.link.state(), ConnectionState::Failed(_)));
        assert!(!rig.recorder.is_logging());
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }
}
