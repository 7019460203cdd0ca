//! Driver context: bring-up, transmit and teardown of CAN interfaces

use std::sync::Arc;

use tracing::{debug, info};

use crate::admin::{self, BitrateControl, IpLinkControl};
use crate::bus::{self, BusError, BusPlatform};
use crate::config::{DriverConfig, InterfaceConfig};
use crate::error::{BringUpStage, DriverError, DriverResult};
use crate::registry::{InterfaceHandle, Registry};
use crate::rx::{ReceiveLoop, RxHandle};
use crate::sink::FrameSink;
use crate::tx;

/// Owns the interface registry and everything needed to bring interfaces
/// up and send on them
///
/// Several independent drivers can coexist in one process; each has its
/// own registry and capacity.
pub struct CanDriver {
    config: DriverConfig,
    registry: Registry,
    platform: Arc<dyn BusPlatform>,
    bitrate_control: Option<Arc<dyn BitrateControl>>,
    sink: Arc<dyn FrameSink>,
}

impl CanDriver {
    pub fn new(
        config: DriverConfig,
        platform: Arc<dyn BusPlatform>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            registry: Registry::new(config.capacity),
            config,
            platform,
            bitrate_control: None,
            sink,
        }
    }

    /// Driver on the host CAN stack, changing bitrates through `ip link`
    pub fn host(config: DriverConfig, sink: Arc<dyn FrameSink>) -> Result<Self, BusError> {
        let platform = bus::default_platform()?;
        Ok(Self::new(config, platform, sink).with_bitrate_control(Arc::new(IpLinkControl::new())))
    }

    /// Enable bitrate changes during bring-up
    pub fn with_bitrate_control(mut self, control: Arc<dyn BitrateControl>) -> Self {
        self.bitrate_control = Some(control);
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bring an interface up and start its receive loop.
    ///
    /// Steps run in order and the first failure aborts the bring-up. Any
    /// slot or connection acquired before the failure is released before
    /// the error is returned.
    ///
    /// The receive loop runs until [`CanDriver::shutdown`] or
    /// [`CanDriver::bring_down`], or until the driver is dropped. Dropping
    /// the returned handle does not stop it.
    pub async fn bring_up(
        &self,
        handle: &InterfaceHandle,
        iface: &InterfaceConfig,
    ) -> DriverResult<RxHandle> {
        let channel = iface.channel.as_str();
        let slot = self.registry.allocate(handle)?;

        match (iface.bitrate, &self.bitrate_control) {
            (Some(bitrate), Some(control)) => {
                admin::apply_bitrate(control.as_ref(), channel, bitrate).await;
            }
            (Some(bitrate), None) => {
                debug!(channel = %channel, bitrate, "No bitrate control available, using current bitrate");
            }
            (None, _) => {}
        }

        let fail = |stage: BringUpStage| {
            move |source: BusError| DriverError::BringUpFailure {
                channel: channel.to_string(),
                stage,
                source,
            }
        };

        let index = self
            .platform
            .channel_index(channel)
            .map_err(fail(BringUpStage::Bind))?;
        let connection = self
            .platform
            .open(index)
            .map_err(fail(BringUpStage::Open))?;

        let filter = iface.acceptance;
        if !filter.is_accept_all() {
            connection
                .set_filter(filter.id, filter.mask)
                .map_err(fail(BringUpStage::Filter))?;
            debug!(
                channel = %channel,
                id = format!("0x{:08X}", filter.id),
                mask = format!("0x{:08X}", filter.mask),
                "Acceptance filter installed"
            );
        }

        connection
            .set_read_timeout(self.config.receive.poll_interval())
            .map_err(fail(BringUpStage::Configure))?;

        let instance = slot.commit(channel, connection);

        let rx = ReceiveLoop {
            interface: instance.handle,
            connection: instance.connection,
            sink: self.sink.clone(),
            config: self.config.receive.clone(),
            stop: instance.stop,
        }
        .spawn();

        info!(interface = %handle, channel = %channel, index, "CAN interface up");
        Ok(rx)
    }

    /// Send `payload` as one extended frame addressed to `address`.
    ///
    /// Blocks while the transmit buffer is full, for at most
    /// `max_attempts * retry_interval`.
    pub fn send(&self, handle: &InterfaceHandle, address: u32, payload: &[u8]) -> DriverResult<()> {
        let frame = tx::encode(address, payload)?;
        let connection = self.registry.resolve(handle)?;
        tx::transmit(connection.as_ref(), handle, &frame, &self.config.transmit)
    }

    /// [`CanDriver::send`] on the blocking thread pool
    pub async fn send_async(
        &self,
        handle: &InterfaceHandle,
        address: u32,
        payload: &[u8],
    ) -> DriverResult<()> {
        let frame = tx::encode(address, payload)?;
        let connection = self.registry.resolve(handle)?;
        let policy = self.config.transmit.clone();
        let handle = handle.clone();

        tokio::task::spawn_blocking(move || {
            tx::transmit(connection.as_ref(), &handle, &frame, &policy)
        })
        .await
        .map_err(|e| DriverError::Runtime(format!("Task join error: {}", e)))?
    }

    /// Stop an interface's receive loop and free its registry slot
    pub async fn shutdown(&self, rx: RxHandle) -> DriverResult<()> {
        let handle = rx.interface().clone();
        let result = rx.shutdown().await;
        if self.registry.remove(&handle).is_some() {
            info!(interface = %handle, "CAN interface down");
        }
        result
    }

    /// Free the slot of `handle` and stop its receive loop without waiting.
    ///
    /// Works after the [`RxHandle`] has been dropped.
    pub fn bring_down(&self, handle: &InterfaceHandle) -> DriverResult<()> {
        let instance = self
            .registry
            .remove(handle)
            .ok_or_else(|| DriverError::ChannelNotFound(handle.clone()))?;
        instance.request_stop();
        info!(interface = %handle, channel = %instance.channel, "CAN interface down");
        Ok(())
    }
}

impl Drop for CanDriver {
    fn drop(&mut self) {
        for instance in self.registry.drain() {
            instance.request_stop();
            debug!(interface = %instance.handle, "Stopping receive loop of dropped driver");
        }
    }
}
