//! Platform boundary for CAN bus access
//!
//! This module abstracts the raw CAN socket so the driver can run against:
//! - SocketCAN raw sockets (Linux only)
//! - An in-memory mock bus for testing
//!
//! # Example
//!
//! ```ignore
//! use canlink::bus::default_platform;
//!
//! let platform = default_platform()?;
//! let index = platform.channel_index("can0")?;
//! let conn = platform.open(index)?;
//! conn.set_filter(0x100, 0x700)?;
//! let frame = conn.read_frame()?;
//! ```

pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::frame::BusFrame;

/// Errors reported by the platform bus layer
#[derive(Debug, Error)]
pub enum BusError {
    /// Transmit queue of the channel is full (ENOBUFS)
    #[error("CAN transmit buffer full")]
    BufferFull,

    /// No frame arrived before the read timeout
    #[error("Read timed out")]
    Timeout,

    /// Short read or otherwise invalid frame
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("CAN channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Connection closed")]
    Closed,

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl BusError {
    /// Whether a write failing with this error is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::BufferFull)
    }
}

impl From<io::Error> for BusError {
    fn from(err: io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOBUFS) {
            return BusError::BufferFull;
        }
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => BusError::Timeout,
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                BusError::Malformed(err.to_string())
            }
            _ => BusError::Io(err),
        }
    }
}

/// Access to the CAN channels of the host
pub trait BusPlatform: Send + Sync {
    /// Resolve a channel name (e.g. "can0") to its platform index
    fn channel_index(&self, channel: &str) -> Result<u32, BusError>;

    /// Open a raw CAN connection bound to the channel with `index`
    fn open(&self, index: u32) -> Result<Arc<dyn BusConnection>, BusError>;
}

/// One raw CAN connection
///
/// A connection is read by exactly one receive loop and written by any
/// number of senders; implementations must allow both directions to be
/// used concurrently without external locking. Dropping the last
/// reference closes the connection.
pub trait BusConnection: Send + Sync {
    /// Restrict delivery to frames where `frame_id & mask == id & mask`
    fn set_filter(&self, id: u32, mask: u32) -> Result<(), BusError>;

    /// Upper bound on how long [`BusConnection::read_frame`] may block
    fn set_read_timeout(&self, timeout: Duration) -> Result<(), BusError>;

    /// Block until one frame arrives, or fail with [`BusError::Timeout`]
    fn read_frame(&self) -> Result<BusFrame, BusError>;

    /// Queue one frame for transmission
    fn write_frame(&self, frame: &BusFrame) -> Result<(), BusError>;
}

impl fmt::Debug for dyn BusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConnection").finish_non_exhaustive()
    }
}

/// Platform backed by the host's CAN stack
pub fn default_platform() -> Result<Arc<dyn BusPlatform>, BusError> {
    #[cfg(all(target_os = "linux", feature = "socketcan"))]
    {
        Ok(Arc::new(socketcan::SocketCanPlatform::new()))
    }
    #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
    {
        Err(BusError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        ))
    }
}
