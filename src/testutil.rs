//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

static SCRATCH_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Fresh directory under the OS temp dir, removed on drop.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new(tag: &str) -> Self {
        let n = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "imu_session-{}-{tag}-{n}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[derive(Default)]
struct MockState {
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
    closed: bool,
}

/// In-memory serial port. Reads time out after a short pause when nothing
/// is queued, like a port opened with a small timeout.
#[derive(Clone, Default)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the reader.
    pub fn push(&self, bytes: &[u8]) {
        self.state.lock().unwrap().inbound.extend(bytes);
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().inbound.len()
    }

    /// Every `write` call received, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn written(&self) -> Vec<u8> {
        self.writes().concat()
    }

    pub fn fail_reads(&self, kind: io::ErrorKind) {
        self.state.lock().unwrap().read_error = Some(kind);
    }

    /// Simulate the peer hanging up: once the queue drains, reads return
    /// `Ok(0)`.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }

    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.state.lock().unwrap().write_error = Some(kind);
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(kind) = state.read_error {
                return Err(io::Error::new(kind, "mock read failure"));
            }
            if !state.inbound.is_empty() {
                let n = buf.len().min(state.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
        }
        thread::sleep(Duration::from_millis(2));
        Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timeout"))
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.write_error {
            return Err(io::Error::new(kind, "mock write failure"));
        }
        state.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
