//! Per-interface receive loop
//!
//! One blocking task per interface reads frames from the bus connection,
//! drops anything that is not an extended data frame, and hands the rest
//! to the upper layer's [`FrameSink`]. Frames are delivered in the order
//! the connection yields them.
//!
//! The loop never reports errors to a caller. Short reads and unaccepted
//! frame kinds are counted and logged; hard read errors are logged and
//! retried after an exponential pause that resets on the next good read.
//! A stop request is observed at every read timeout. The loop outlives the
//! [`RxHandle`] returned for it; only an explicit stop ends it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusConnection, BusError};
use crate::config::ReceiveConfig;
use crate::error::{DiscardReason, DriverError, DriverResult};
use crate::frame::BusFrame;
use crate::registry::InterfaceHandle;
use crate::sink::FrameSink;

/// Live counters of one receive loop
#[derive(Debug, Default)]
pub struct RxStats {
    delivered: AtomicU64,
    malformed: AtomicU64,
    error_frames: AtomicU64,
    remote_frames: AtomicU64,
    standard_frames: AtomicU64,
    read_errors: AtomicU64,
}

impl RxStats {
    fn counter(&self, reason: DiscardReason) -> &AtomicU64 {
        match reason {
            DiscardReason::Malformed => &self.malformed,
            DiscardReason::ErrorFrame => &self.error_frames,
            DiscardReason::RemoteFrame => &self.remote_frames,
            DiscardReason::StandardFrame => &self.standard_frames,
        }
    }

    /// Count a discard; returns the count before this one
    fn record_discard(&self, reason: DiscardReason) -> u64 {
        self.counter(reason).fetch_add(1, Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RxStatsSnapshot {
        RxStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            error_frames: self.error_frames.load(Ordering::Relaxed),
            remote_frames: self.remote_frames.load(Ordering::Relaxed),
            standard_frames: self.standard_frames.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RxStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxStatsSnapshot {
    pub delivered: u64,
    pub malformed: u64,
    pub error_frames: u64,
    pub remote_frames: u64,
    pub standard_frames: u64,
    pub read_errors: u64,
}

impl RxStatsSnapshot {
    /// Frames dropped for any reason
    pub fn discarded(&self) -> u64 {
        self.malformed + self.error_frames + self.remote_frames + self.standard_frames
    }
}

pub(crate) struct ReceiveLoop {
    pub(crate) interface: InterfaceHandle,
    pub(crate) connection: Arc<dyn BusConnection>,
    pub(crate) sink: Arc<dyn FrameSink>,
    pub(crate) config: ReceiveConfig,
    pub(crate) stop: Arc<AtomicBool>,
}

impl ReceiveLoop {
    /// Start the loop on the blocking thread pool
    pub(crate) fn spawn(self) -> RxHandle {
        let stop = self.stop.clone();
        let stats = Arc::new(RxStats::default());
        let interface = self.interface.clone();

        let task = {
            let stats = stats.clone();
            tokio::task::spawn_blocking(move || {
                let stop = self.stop.clone();
                self.run(&stop, &stats)
            })
        };

        RxHandle {
            interface,
            stop,
            stats,
            task,
        }
    }

    fn run(self, stop: &AtomicBool, stats: &RxStats) {
        info!(interface = %self.interface, "Receive loop started");

        let mut backoff: Option<Duration> = None;

        while !stop.load(Ordering::SeqCst) {
            match self.connection.read_frame() {
                Ok(frame) => {
                    backoff = None;
                    self.dispatch(frame, stats);
                }
                Err(BusError::Timeout) => continue,
                Err(BusError::Malformed(detail)) => {
                    backoff = None;
                    stats.record_discard(DiscardReason::Malformed);
                    warn!(interface = %self.interface, %detail, "Read incomplete CAN frame");
                }
                Err(e) => {
                    stats.read_errors.fetch_add(1, Ordering::Relaxed);
                    let delay = self.next_backoff(backoff);
                    error!(
                        interface = %self.interface,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "CAN read error"
                    );
                    backoff = Some(delay);
                    self.pause(delay, stop);
                }
            }
        }

        info!(interface = %self.interface, "Receive loop stopped");
    }

    fn dispatch(&self, frame: BusFrame, stats: &RxStats) {
        match frame.classify(&self.interface) {
            Ok(inbound) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                self.sink.on_frame(inbound);
            }
            Err(reason) => {
                let seen = stats.record_discard(reason);
                let can_id = format!("0x{:08X}", frame.id_word());
                if seen == 0 {
                    warn!(interface = %self.interface, %can_id, %reason, "Discarding CAN frame");
                } else {
                    debug!(interface = %self.interface, %can_id, %reason, "Discarding CAN frame");
                }
            }
        }
    }

    fn next_backoff(&self, previous: Option<Duration>) -> Duration {
        let initial = Duration::from_millis(self.config.error_backoff_initial_ms);
        let max = Duration::from_millis(self.config.error_backoff_max_ms).max(initial);
        match previous {
            None => initial,
            Some(prev) => (prev * 2).min(max),
        }
    }

    /// Sleep for `delay`, waking early if a stop is requested
    fn pause(&self, delay: Duration, stop: &AtomicBool) {
        let deadline = Instant::now() + delay;
        let step = self.config.poll_interval();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || stop.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(remaining.min(step));
        }
    }
}

/// Control handle for a running receive loop
///
/// Dropping the handle detaches from the loop, which keeps running; stop it
/// with [`RxHandle::shutdown`] or [`CanDriver::bring_down`](crate::CanDriver::bring_down).
#[derive(Debug)]
#[must_use = "dropping the handle detaches the receive loop"]
pub struct RxHandle {
    interface: InterfaceHandle,
    stop: Arc<AtomicBool>,
    stats: Arc<RxStats>,
    task: JoinHandle<()>,
}

impl RxHandle {
    pub fn interface(&self) -> &InterfaceHandle {
        &self.interface
    }

    pub fn stats(&self) -> RxStatsSnapshot {
        self.stats.snapshot()
    }

    /// Ask the loop to exit at its next read boundary
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(self) -> DriverResult<()> {
        self.request_stop();
        self.task.await.map_err(|e| {
            DriverError::Runtime(format!("Receive loop for {} failed: {}", self.interface, e))
        })
    }
}
