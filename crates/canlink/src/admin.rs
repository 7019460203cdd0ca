//! Optional channel administration (bitrate changes)
//!
//! Changing the bitrate of a CAN interface requires taking the link down,
//! reconfiguring it and bringing it back up. Not every host allows this, so
//! the driver treats the capability as optional: when it is absent or fails,
//! bring-up continues with the interface as the system configured it.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::bus::BusError;

/// Stop / reconfigure / start a named CAN channel
#[async_trait]
pub trait BitrateControl: Send + Sync {
    async fn stop(&self, channel: &str) -> Result<(), BusError>;

    async fn set_bitrate(&self, channel: &str, bitrate: u32) -> Result<(), BusError>;

    async fn start(&self, channel: &str) -> Result<(), BusError>;
}

/// Apply `bitrate` to `channel`, best effort.
///
/// Each step is attempted even if an earlier one failed so the channel is
/// not left down. Returns `true` if every step succeeded.
pub async fn apply_bitrate(control: &dyn BitrateControl, channel: &str, bitrate: u32) -> bool {
    let mut ok = true;

    if let Err(e) = control.stop(channel).await {
        warn!(channel = %channel, error = %e, "Failed to stop CAN channel");
        ok = false;
    }
    if let Err(e) = control.set_bitrate(channel, bitrate).await {
        warn!(channel = %channel, bitrate, error = %e, "Failed to set CAN bitrate");
        ok = false;
    }
    if let Err(e) = control.start(channel).await {
        warn!(channel = %channel, error = %e, "Failed to start CAN channel");
        ok = false;
    }

    if ok {
        info!(channel = %channel, bitrate, "CAN bitrate applied");
    }
    ok
}

/// Bitrate control through the iproute2 `ip` tool
///
/// Requires CAP_NET_ADMIN, e.g. running as root or with the capability
/// granted to the `ip` binary.
#[derive(Debug, Clone, Default)]
pub struct IpLinkControl;

impl IpLinkControl {
    pub fn new() -> Self {
        Self
    }

    async fn ip_link_set(&self, args: &[&str]) -> Result<(), BusError> {
        debug!(?args, "Running ip link set");

        let output = Command::new("ip")
            .args(["link", "set"])
            .args(args)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                format!("exit code {:?}", output.status.code())
            } else {
                stderr.trim().to_string()
            };
            Err(BusError::Io(std::io::Error::other(detail)))
        }
    }
}

#[async_trait]
impl BitrateControl for IpLinkControl {
    async fn stop(&self, channel: &str) -> Result<(), BusError> {
        self.ip_link_set(&[channel, "down"]).await
    }

    async fn set_bitrate(&self, channel: &str, bitrate: u32) -> Result<(), BusError> {
        let bitrate = bitrate.to_string();
        self.ip_link_set(&[channel, "type", "can", "bitrate", &bitrate])
            .await
    }

    async fn start(&self, channel: &str) -> Result<(), BusError> {
        self.ip_link_set(&[channel, "up"]).await
    }
}
