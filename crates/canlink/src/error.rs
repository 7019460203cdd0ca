//! Driver error types

use thiserror::Error;

use crate::bus::BusError;
use crate::registry::InterfaceHandle;

/// Result type for driver operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Bring-up step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStage {
    /// Opening the raw CAN connection
    Open,
    /// Resolving the channel name and binding to it
    Bind,
    /// Installing the acceptance filter
    Filter,
    /// Configuring the read timeout used by the receive loop
    Configure,
}

impl std::fmt::Display for BringUpStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BringUpStage::Open => "open",
            BringUpStage::Bind => "bind",
            BringUpStage::Filter => "filter",
            BringUpStage::Configure => "configure",
        };
        f.write_str(name)
    }
}

/// Errors returned by bring-up and the transmit path
#[derive(Debug, Error)]
pub enum DriverError {
    /// Every registry slot is already in use
    #[error("Interface capacity exceeded: at most {capacity} interfaces")]
    CapacityExceeded { capacity: usize },

    /// Handle is unknown to the registry
    #[error("Channel not found for interface {0}")]
    ChannelNotFound(InterfaceHandle),

    /// Handle already owns a live interface
    #[error("Interface {0} is already registered")]
    AlreadyRegistered(InterfaceHandle),

    /// Platform failure while bringing an interface up
    #[error("Bring-up of {channel} failed at {stage}: {source}")]
    BringUpFailure {
        channel: String,
        stage: BringUpStage,
        #[source]
        source: BusError,
    },

    /// Payload longer than a classic CAN frame
    #[error("Payload of {len} bytes exceeds the 8-byte CAN frame limit")]
    OversizedPayload { len: usize },

    /// Write gave up after retries or on a non-transient error
    #[error("Transmit failed after {attempts} attempt(s): {source}")]
    TransmitExhausted {
        attempts: u32,
        #[source]
        source: BusError,
    },

    /// Task spawn or join failure
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Why the receive loop dropped an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// Short read or invalid length field
    Malformed,
    /// Error flag set in the identifier
    ErrorFrame,
    /// Remote-request flag set in the identifier
    RemoteFrame,
    /// Standard (11-bit) identifier
    StandardFrame,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DiscardReason::Malformed => "malformed",
            DiscardReason::ErrorFrame => "error frame",
            DiscardReason::RemoteFrame => "remote frame",
            DiscardReason::StandardFrame => "standard frame",
        };
        f.write_str(name)
    }
}
