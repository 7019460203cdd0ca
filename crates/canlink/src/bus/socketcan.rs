//! SocketCAN raw socket platform (Linux only)

use std::ffi::CString;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, SocketOptions,
    StandardId,
};

use super::{BusConnection, BusError, BusPlatform};
use crate::frame::{BusFrame, IdFlags};

/// Host SocketCAN stack
#[derive(Debug, Default)]
pub struct SocketCanPlatform;

impl SocketCanPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl BusPlatform for SocketCanPlatform {
    fn channel_index(&self, channel: &str) -> Result<u32, BusError> {
        let name = CString::new(channel)
            .map_err(|_| BusError::ChannelNotFound(format!("invalid channel name '{}'", channel)))?;

        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            let err = io::Error::last_os_error();
            tracing::debug!(channel = %channel, error = %err, "if_nametoindex failed");
            return Err(BusError::ChannelNotFound(channel.to_string()));
        }
        Ok(index)
    }

    fn open(&self, index: u32) -> Result<Arc<dyn BusConnection>, BusError> {
        let socket = CanSocket::open_iface(index)?;
        Ok(Arc::new(SocketCanConnection { socket }))
    }
}

/// Raw CAN socket bound to one interface
pub struct SocketCanConnection {
    socket: CanSocket,
}

impl BusConnection for SocketCanConnection {
    fn set_filter(&self, id: u32, mask: u32) -> Result<(), BusError> {
        self.socket.set_filters(&[CanFilter::new(id, mask)])?;
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Duration) -> Result<(), BusError> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    fn read_frame(&self) -> Result<BusFrame, BusError> {
        let frame = self.socket.read_frame()?;
        BusFrame::new(frame.id_word(), frame.data()).ok_or_else(|| {
            BusError::Malformed(format!("frame carries {} data bytes", frame.data().len()))
        })
    }

    fn write_frame(&self, frame: &BusFrame) -> Result<(), BusError> {
        self.socket.write_frame(&to_can_frame(frame)?)?;
        Ok(())
    }
}

/// Convert an outbound frame; only data frames can be sent
fn to_can_frame(frame: &BusFrame) -> Result<CanFrame, BusError> {
    let flags = frame.flags();
    if flags.intersects(IdFlags::REMOTE | IdFlags::ERROR) {
        return Err(BusError::Unsupported(
            "only data frames can be transmitted".to_string(),
        ));
    }

    let id: Id = if flags.contains(IdFlags::EXTENDED) {
        ExtendedId::new(frame.address())
            .ok_or_else(|| {
                BusError::Malformed(format!("invalid extended id 0x{:08X}", frame.address()))
            })?
            .into()
    } else {
        u16::try_from(frame.address())
            .ok()
            .and_then(StandardId::new)
            .ok_or_else(|| {
                BusError::Malformed(format!("invalid standard id 0x{:03X}", frame.address()))
            })?
            .into()
    };

    CanFrame::new(id, frame.data())
        .ok_or_else(|| BusError::Malformed("payload exceeds 8 bytes".to_string()))
}
