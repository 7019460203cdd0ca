//! Driver configuration
//!
//! All types deserialize from partial documents; missing fields take the
//! defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`CanDriver`](crate::CanDriver)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Maximum number of interfaces that can be up at once
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Retry policy for outbound frames
    #[serde(default)]
    pub transmit: TransmitPolicy,
    /// Receive loop tuning
    #[serde(default)]
    pub receive: ReceiveConfig,
}

fn default_capacity() -> usize {
    3
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            transmit: TransmitPolicy::default(),
            receive: ReceiveConfig::default(),
        }
    }
}

// =============================================================================
// Transmit
// =============================================================================

/// Retry policy applied when the transmit buffer is full
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmitPolicy {
    /// Total write attempts per frame, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between attempts
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    1000
}

fn default_retry_interval_ms() -> u64 {
    10
}

impl Default for TransmitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl TransmitPolicy {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

// =============================================================================
// Receive
// =============================================================================

/// Receive loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveConfig {
    /// Read timeout; bounds how long a shutdown request waits to be seen
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause after the first hard read error
    #[serde(default = "default_error_backoff_initial_ms")]
    pub error_backoff_initial_ms: u64,
    /// Upper bound for the pause between consecutive hard read errors
    #[serde(default = "default_error_backoff_max_ms")]
    pub error_backoff_max_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_error_backoff_initial_ms() -> u64 {
    10
}

fn default_error_backoff_max_ms() -> u64 {
    1000
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            error_backoff_initial_ms: default_error_backoff_initial_ms(),
            error_backoff_max_ms: default_error_backoff_max_ms(),
        }
    }
}

impl ReceiveConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// =============================================================================
// Interfaces
// =============================================================================

/// Acceptance filter; a zero mask accepts every frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceFilter {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub mask: u32,
}

impl AcceptanceFilter {
    pub fn new(id: u32, mask: u32) -> Self {
        Self { id, mask }
    }

    /// Filter that lets every frame through
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn is_accept_all(&self) -> bool {
        self.mask == 0
    }
}

/// Per-interface bring-up parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// CAN channel name (e.g., "can0")
    pub channel: String,
    /// Kernel acceptance filter
    #[serde(default)]
    pub acceptance: AcceptanceFilter,
    /// Bitrate to apply before opening, if the host allows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}

impl InterfaceConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            acceptance: AcceptanceFilter::accept_all(),
            bitrate: None,
        }
    }

    pub fn with_filter(mut self, id: u32, mask: u32) -> Self {
        self.acceptance = AcceptanceFilter::new(id, mask);
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }
}
