//! In-memory CAN bus for testing

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{BusConnection, BusError, BusPlatform};
use crate::admin::BitrateControl;
use crate::frame::BusFrame;

/// How a mock connection answers writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBehavior {
    /// Every write succeeds
    Accept,
    /// The next `n` writes report a full transmit buffer, then writes succeed
    BufferFullFor(u32),
    /// Every write reports a full transmit buffer
    AlwaysBufferFull,
    /// Every write fails with a hard I/O error
    Fail(io::ErrorKind),
}

/// Ordered record of platform and bitrate calls, shareable between mocks
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Mock platform exposing a fixed set of channels
pub struct MockPlatform {
    channels: Vec<String>,
    connections: RwLock<Vec<(String, Weak<MockConnection>)>>,
    fail_open: AtomicBool,
    fail_filter: AtomicBool,
    calls: CallLog,
}

impl MockPlatform {
    pub fn new(channels: &[&str]) -> Self {
        Self {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            connections: RwLock::new(Vec::new()),
            fail_open: AtomicBool::new(false),
            fail_filter: AtomicBool::new(false),
            calls: CallLog::default(),
        }
    }

    /// Log of `resolve <channel>` and `open <index>` calls
    pub fn call_log(&self) -> CallLog {
        self.calls.clone()
    }

    /// Make subsequent `open` calls fail
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make filter installation fail on connections opened from now on
    pub fn set_fail_filter(&self, fail: bool) {
        self.fail_filter.store(fail, Ordering::SeqCst);
    }

    /// Most recently opened live connection on `channel`
    pub fn connection(&self, channel: &str) -> Option<Arc<MockConnection>> {
        self.connections
            .read()
            .iter()
            .rev()
            .filter(|(name, _)| name == channel)
            .find_map(|(_, conn)| conn.upgrade())
    }

    /// Number of connections still held by someone
    pub fn open_connections(&self) -> usize {
        self.connections
            .read()
            .iter()
            .filter(|(_, conn)| conn.strong_count() > 0)
            .count()
    }
}

impl BusPlatform for MockPlatform {
    fn channel_index(&self, channel: &str) -> Result<u32, BusError> {
        self.calls.lock().push(format!("resolve {}", channel));
        self.channels
            .iter()
            .position(|c| c == channel)
            .map(|pos| pos as u32 + 1)
            .ok_or_else(|| BusError::ChannelNotFound(channel.to_string()))
    }

    fn open(&self, index: u32) -> Result<Arc<dyn BusConnection>, BusError> {
        self.calls.lock().push(format!("open {}", index));
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied).into());
        }
        let channel = index
            .checked_sub(1)
            .and_then(|pos| self.channels.get(pos as usize))
            .ok_or_else(|| BusError::ChannelNotFound(format!("index {}", index)))?
            .clone();

        let conn = Arc::new(MockConnection::new(self.fail_filter.load(Ordering::SeqCst)));
        self.connections
            .write()
            .push((channel, Arc::downgrade(&conn)));
        Ok(conn)
    }
}

/// One mock connection; tests inject inbound frames and inspect writes
pub struct MockConnection {
    inbound_tx: Mutex<Sender<Result<BusFrame, BusError>>>,
    inbound_rx: Mutex<Receiver<Result<BusFrame, BusError>>>,
    read_timeout: Mutex<Duration>,
    filter: Mutex<Option<(u32, u32)>>,
    fail_filter: bool,
    write_behavior: Mutex<WriteBehavior>,
    attempts: Mutex<Vec<Instant>>,
    written: Mutex<Vec<(Instant, BusFrame)>>,
}

impl MockConnection {
    fn new(fail_filter: bool) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        Self {
            inbound_tx: Mutex::new(inbound_tx),
            inbound_rx: Mutex::new(inbound_rx),
            read_timeout: Mutex::new(Duration::from_millis(100)),
            filter: Mutex::new(None),
            fail_filter,
            write_behavior: Mutex::new(WriteBehavior::Accept),
            attempts: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a frame as if it arrived from the bus
    pub fn inject(&self, frame: BusFrame) {
        let _ = self.inbound_tx.lock().send(Ok(frame));
    }

    /// Make the next read fail with `error`
    pub fn inject_error(&self, error: BusError) {
        let _ = self.inbound_tx.lock().send(Err(error));
    }

    pub fn set_write_behavior(&self, behavior: WriteBehavior) {
        *self.write_behavior.lock() = behavior;
    }

    /// Installed acceptance filter, if any
    pub fn filter(&self) -> Option<(u32, u32)> {
        *self.filter.lock()
    }

    /// Write calls made so far, successful or not
    pub fn write_attempts(&self) -> u32 {
        self.attempts.lock().len() as u32
    }

    /// When each write call was made
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    /// Frames that were accepted for transmission
    pub fn written(&self) -> Vec<BusFrame> {
        self.written.lock().iter().map(|(_, frame)| *frame).collect()
    }

    fn passes_filter(&self, frame: &BusFrame) -> bool {
        match *self.filter.lock() {
            Some((id, mask)) => frame.id_word() & mask == id & mask,
            None => true,
        }
    }
}

impl BusConnection for MockConnection {
    fn set_filter(&self, id: u32, mask: u32) -> Result<(), BusError> {
        if self.fail_filter {
            return Err(io::Error::from(io::ErrorKind::InvalidInput).into());
        }
        *self.filter.lock() = Some((id, mask));
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Duration) -> Result<(), BusError> {
        *self.read_timeout.lock() = timeout;
        Ok(())
    }

    fn read_frame(&self) -> Result<BusFrame, BusError> {
        let timeout = *self.read_timeout.lock();
        let rx = self.inbound_rx.lock();
        loop {
            match rx.recv_timeout(timeout) {
                Ok(Ok(frame)) if self.passes_filter(&frame) => return Ok(frame),
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => return Err(BusError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(BusError::Closed),
            }
        }
    }

    fn write_frame(&self, frame: &BusFrame) -> Result<(), BusError> {
        let now = Instant::now();
        self.attempts.lock().push(now);

        let mut behavior = self.write_behavior.lock();
        match *behavior {
            WriteBehavior::Accept => {}
            WriteBehavior::BufferFullFor(0) => *behavior = WriteBehavior::Accept,
            WriteBehavior::BufferFullFor(n) => {
                *behavior = WriteBehavior::BufferFullFor(n - 1);
                return Err(BusError::BufferFull);
            }
            WriteBehavior::AlwaysBufferFull => return Err(BusError::BufferFull),
            WriteBehavior::Fail(kind) => return Err(BusError::Io(io::Error::from(kind))),
        }
        drop(behavior);

        self.written.lock().push((now, *frame));
        Ok(())
    }
}

/// Bitrate control that only records what it was asked to do
#[derive(Default)]
pub struct RecordingBitrateControl {
    calls: CallLog,
    fail_set_bitrate: AtomicBool,
}

impl RecordingBitrateControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record into `log`, e.g. [`MockPlatform::call_log`], to see the
    /// relative order of bitrate and platform calls
    pub fn with_log(log: CallLog) -> Self {
        Self {
            calls: log,
            fail_set_bitrate: AtomicBool::new(false),
        }
    }

    /// Make `set_bitrate` fail
    pub fn set_fail_set_bitrate(&self, fail: bool) {
        self.fail_set_bitrate.store(fail, Ordering::SeqCst);
    }

    /// Calls in order, e.g. `["stop can0", "bitrate can0 500000", "start can0"]`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl BitrateControl for RecordingBitrateControl {
    async fn stop(&self, channel: &str) -> Result<(), BusError> {
        self.calls.lock().push(format!("stop {}", channel));
        Ok(())
    }

    async fn set_bitrate(&self, channel: &str, bitrate: u32) -> Result<(), BusError> {
        self.calls
            .lock()
            .push(format!("bitrate {} {}", channel, bitrate));
        if self.fail_set_bitrate.load(Ordering::SeqCst) {
            return Err(BusError::Unsupported("bitrate rejected".to_string()));
        }
        Ok(())
    }

    async fn start(&self, channel: &str) -> Result<(), BusError> {
        self.calls.lock().push(format!("start {}", channel));
        Ok(())
    }
}
