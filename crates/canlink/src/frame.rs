//! CAN wire frames and inbound classification
//!
//! A [`BusFrame`] carries the raw 32-bit identifier word exactly as the
//! kernel reports it: the low 29 bits hold the address, the top three bits
//! are the extended/remote/error flags. The receive loop only relays
//! extended data frames upstream, with the flags stripped.

use std::time::Instant;

use bitflags::bitflags;

use crate::error::DiscardReason;
use crate::registry::InterfaceHandle;

/// Maximum payload of a classic CAN frame
pub const MAX_DATA_LEN: usize = 8;

/// Valid address bits of an extended (29-bit) identifier
pub const EFF_MASK: u32 = 0x1FFF_FFFF;

/// Valid address bits of a standard (11-bit) identifier
pub const SFF_MASK: u32 = 0x0000_07FF;

bitflags! {
    /// Control and format bits of the identifier word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IdFlags: u32 {
        /// 29-bit extended addressing
        const EXTENDED = 0x8000_0000;
        /// Remote transmission request
        const REMOTE = 0x4000_0000;
        /// Error frame
        const ERROR = 0x2000_0000;
    }
}

/// A single CAN frame as read from or written to the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusFrame {
    id_word: u32,
    len: u8,
    data: [u8; MAX_DATA_LEN],
}

impl BusFrame {
    /// Build a frame from an identifier word and payload.
    ///
    /// Returns `None` if the payload is longer than 8 bytes.
    pub fn new(id_word: u32, payload: &[u8]) -> Option<Self> {
        if payload.len() > MAX_DATA_LEN {
            return None;
        }
        let mut data = [0u8; MAX_DATA_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Some(Self {
            id_word,
            len: payload.len() as u8,
            data,
        })
    }

    /// Build an extended-format data frame for `address`.
    ///
    /// Bits above the 29-bit address space are dropped so they can never
    /// alias the control flags.
    pub fn extended(address: u32, payload: &[u8]) -> Option<Self> {
        Self::new((address & EFF_MASK) | IdFlags::EXTENDED.bits(), payload)
    }

    /// Reassemble a frame from its raw wire fields without validation.
    ///
    /// A length field above 8 is kept as-is and rejected by [`BusFrame::classify`].
    pub fn from_raw(id_word: u32, len: u8, data: [u8; MAX_DATA_LEN]) -> Self {
        Self { id_word, len, data }
    }

    /// Raw identifier word including flag bits
    pub fn id_word(&self) -> u32 {
        self.id_word
    }

    /// Control flags carried by the identifier word
    pub fn flags(&self) -> IdFlags {
        IdFlags::from_bits_truncate(self.id_word)
    }

    /// Identifier with every flag bit cleared
    pub fn address(&self) -> u32 {
        self.id_word & EFF_MASK
    }

    /// Declared data length
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes, clamped to the frame buffer
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len().min(MAX_DATA_LEN)]
    }

    /// Accept or reject a frame read from the bus.
    ///
    /// Only well-formed extended data frames pass; their identifier is
    /// reduced to the 29-bit address.
    pub fn classify(&self, interface: &InterfaceHandle) -> Result<InboundFrame, DiscardReason> {
        if self.len() > MAX_DATA_LEN {
            return Err(DiscardReason::Malformed);
        }
        let flags = self.flags();
        if flags.contains(IdFlags::ERROR) {
            return Err(DiscardReason::ErrorFrame);
        }
        if flags.contains(IdFlags::REMOTE) {
            return Err(DiscardReason::RemoteFrame);
        }
        if !flags.contains(IdFlags::EXTENDED) {
            return Err(DiscardReason::StandardFrame);
        }

        Ok(InboundFrame {
            interface: interface.clone(),
            id: self.address(),
            len: self.len,
            data: self.data,
            timestamp: Instant::now(),
        })
    }
}

/// An accepted frame handed to the upper layer
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Interface the frame arrived on
    pub interface: InterfaceHandle,
    /// 29-bit address with all flag bits cleared
    pub id: u32,
    len: u8,
    data: [u8; MAX_DATA_LEN],
    /// When the receive loop accepted the frame
    pub timestamp: Instant,
}

impl InboundFrame {
    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Data length
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn iface() -> InterfaceHandle {
        InterfaceHandle::new("CAN")
    }

    #[test]
    fn test_extended_sets_flag_and_copies_payload() {
        let frame = BusFrame::extended(0x42, &[9, 9]).unwrap();
        assert_eq!(frame.id_word(), 0x8000_0042);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.data(), &[9, 9]);
    }

    #[test]
    fn test_extended_masks_high_bits() {
        let frame = BusFrame::extended(0xFFFF_FFFF, &[]).unwrap();
        assert_eq!(frame.flags(), IdFlags::EXTENDED);
        assert_eq!(frame.address(), EFF_MASK);
    }

    #[test]
    fn test_new_rejects_oversized_payload() {
        assert!(BusFrame::new(0, &[0; 9]).is_none());
    }

    #[test]
    fn test_classify_accepts_extended_data_frame() {
        let frame = BusFrame::extended(0x123, &[1, 2, 3, 4]).unwrap();
        let inbound = frame.classify(&iface()).unwrap();
        assert_eq!(inbound.id, 0x123);
        assert_eq!(inbound.data(), &[1, 2, 3, 4]);
        assert_eq!(inbound.interface, iface());
    }

    #[test]
    fn test_classify_strips_all_flags() {
        let frame = BusFrame::new(0x9FFF_FFFF, &[7]).unwrap();
        let inbound = frame.classify(&iface()).unwrap();
        assert_eq!(inbound.id, EFF_MASK);
        assert_eq!(inbound.id & !EFF_MASK, 0);
    }

    #[test]
    fn test_classify_rejects_error_frame() {
        let frame = BusFrame::new(0xA000_0004, &[0; 8]).unwrap();
        assert_eq!(frame.classify(&iface()).unwrap_err(), DiscardReason::ErrorFrame);
    }

    #[test]
    fn test_classify_rejects_remote_frame() {
        let frame = BusFrame::new(0xC000_0100, &[]).unwrap();
        assert_eq!(frame.classify(&iface()).unwrap_err(), DiscardReason::RemoteFrame);
    }

    #[test]
    fn test_classify_rejects_standard_frame() {
        let frame = BusFrame::new(0x7DF & SFF_MASK, &[2, 1, 0]).unwrap();
        assert_eq!(frame.classify(&iface()).unwrap_err(), DiscardReason::StandardFrame);
    }

    #[test]
    fn test_classify_rejects_bad_length_field() {
        let frame = BusFrame::from_raw(0x8000_0001, 15, [0; 8]);
        assert_eq!(frame.data().len(), 8);
        assert_eq!(frame.classify(&iface()).unwrap_err(), DiscardReason::Malformed);
    }
}
