//! Transmit path: one protocol frame becomes one extended CAN frame

use tracing::{debug, error, trace};

use crate::bus::BusConnection;
use crate::config::TransmitPolicy;
use crate::error::{DriverError, DriverResult};
use crate::frame::BusFrame;
use crate::registry::InterfaceHandle;

/// Build the outbound frame for `address`, rejecting payloads over 8 bytes
pub fn encode(address: u32, payload: &[u8]) -> DriverResult<BusFrame> {
    BusFrame::extended(address, payload).ok_or(DriverError::OversizedPayload { len: payload.len() })
}

/// Write `frame`, retrying while the transmit buffer is full.
///
/// At most `policy.max_attempts` writes are made, `policy.retry_interval`
/// apart. Any other write error ends the send immediately.
pub(crate) fn transmit(
    connection: &dyn BusConnection,
    interface: &InterfaceHandle,
    frame: &BusFrame,
    policy: &TransmitPolicy,
) -> DriverResult<()> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match connection.write_frame(frame) {
            Ok(()) => {
                if attempts > 1 {
                    debug!(
                        interface = %interface,
                        can_id = format!("0x{:08X}", frame.id_word()),
                        attempts,
                        "CAN frame sent after retries"
                    );
                } else {
                    trace!(interface = %interface, can_id = format!("0x{:08X}", frame.id_word()), "CAN frame sent");
                }
                return Ok(());
            }
            Err(e) if e.is_transient() && attempts < max_attempts => {
                std::thread::sleep(policy.retry_interval());
            }
            Err(e) => {
                error!(
                    interface = %interface,
                    can_id = format!("0x{:08X}", frame.id_word()),
                    attempts,
                    error = %e,
                    "CAN write failed"
                );
                return Err(DriverError::TransmitExhausted {
                    attempts,
                    source: e,
                });
            }
        }
    }
}
