//! canlink - CAN bus link layer for a packet network stack
//!
//! This crate carries the protocol's frames over a CAN bus, one protocol
//! frame per extended (29-bit) CAN frame. It owns a small, bounded set of
//! CAN interfaces, transmits with bounded retry while the bus transmit
//! buffer is full, and relays validated inbound frames to the upper layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        CanDriver                            │
//! │                                                             │
//! │  ┌─────────────┐   ┌──────────────┐   ┌─────────────────┐   │
//! │  │  Registry   │   │  bring_up()  │   │  send()         │   │
//! │  │ (≤ N slots) │◄──│  bitrate →   │   │  encode → write │   │
//! │  │             │   │  open → bind │   │  retry on full  │   │
//! │  └──────┬──────┘   │  → filter    │   └────────┬────────┘   │
//! │         │          └──────┬───────┘            │            │
//! │         │                 │ spawn              │ resolve    │
//! │         │          ┌──────┴───────┐            │            │
//! │         │          │ ReceiveLoop  │──► FrameSink (upper)    │
//! │         │          │ (per iface)  │            │            │
//! │         │          └──────┬───────┘            │            │
//! │         │                 │                    │            │
//! │         └──────────► BusConnection ◄───────────┘            │
//! │                    (SocketCAN / mock)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use canlink::{BroadcastSink, CanDriver, DriverConfig, InterfaceConfig, InterfaceHandle};
//!
//! let sink = BroadcastSink::default();
//! let mut frames = sink.subscribe();
//! let driver = CanDriver::host(DriverConfig::default(), Arc::new(sink))?;
//!
//! let can = InterfaceHandle::new("CAN");
//! let rx = driver
//!     .bring_up(&can, &InterfaceConfig::new("can0").with_bitrate(1_000_000))
//!     .await?;
//!
//! driver.send(&can, 0x42, &[9, 9])?;
//! let frame = frames.recv().await?;
//!
//! driver.shutdown(rx).await?;
//! ```

pub mod admin;
pub mod bus;
pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod registry;
pub mod rx;
pub mod sink;
pub mod tx;

pub use admin::{BitrateControl, IpLinkControl};
pub use bus::{BusConnection, BusError, BusPlatform};
pub use config::{AcceptanceFilter, DriverConfig, InterfaceConfig, ReceiveConfig, TransmitPolicy};
pub use driver::CanDriver;
pub use error::{BringUpStage, DiscardReason, DriverError, DriverResult};
pub use frame::{BusFrame, IdFlags, InboundFrame};
pub use registry::{InterfaceHandle, Registry};
pub use rx::{RxHandle, RxStatsSnapshot};
pub use sink::{BroadcastSink, FrameSink};
