//! Raw CAN frame handling.
//!
//! [`WireFrame`] mirrors the kernel's `struct can_frame` byte for byte:
//!
//! ```text
//! offset  0..4   can_id   identifier and flags, native endian
//! offset  4      can_dlc  data length code
//! offset  5..8   padding
//! offset  8..16  data
//! ```
//!
//! The identifier word carries three flags above the identifier bits, as
//! defined in `linux/can.h`: extended format (bit 31), remote transmission
//! request (bit 30) and error frame (bit 29).

pub mod error_frame;

use bitflags::bitflags;

use crate::error::{DriverError, Result};
use crate::types::{CanId, Frame, CAN_MAX_DLEN};

pub use error_frame::{ErrorClass, ErrorClassTranslator, ErrorTranslator, NoTranslation};

/// Size of `struct can_frame`
pub const WIRE_FRAME_SIZE: usize = 16;

/// Valid bits of a standard (11-bit) identifier
pub const SFF_MASK: CanId = 0x0000_07FF;
/// Valid bits of an extended (29-bit) identifier
pub const EFF_MASK: CanId = 0x1FFF_FFFF;
/// Valid class bits of an error frame identifier
pub const ERR_MASK: CanId = 0x1FFF_FFFF;

bitflags! {
    /// Flags in the upper bits of `can_id`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IdFlags: u32 {
        const EFF = 0x8000_0000;
        const RTR = 0x4000_0000;
        const ERR = 0x2000_0000;
    }
}

/// Kernel `struct can_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct WireFrame {
    pub can_id: u32,
    pub can_dlc: u8,
    pub pad: u8,
    pub res0: u8,
    pub res1: u8,
    pub data: [u8; CAN_MAX_DLEN],
}

const _: () = assert!(std::mem::size_of::<WireFrame>() == WIRE_FRAME_SIZE);

impl WireFrame {
    pub fn from_bytes(buf: &[u8; WIRE_FRAME_SIZE]) -> Self {
        let mut data = [0u8; CAN_MAX_DLEN];
        data.copy_from_slice(&buf[8..16]);
        Self {
            can_id: u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            can_dlc: buf[4],
            pad: buf[5],
            res0: buf[6],
            res1: buf[7],
            data,
        }
    }

    pub fn to_bytes(&self) -> [u8; WIRE_FRAME_SIZE] {
        let mut buf = [0u8; WIRE_FRAME_SIZE];
        buf[0..4].copy_from_slice(&self.can_id.to_ne_bytes());
        buf[4] = self.can_dlc;
        buf[5] = self.pad;
        buf[6] = self.res0;
        buf[7] = self.res1;
        buf[8..16].copy_from_slice(&self.data);
        buf
    }

    pub fn flags(&self) -> IdFlags {
        IdFlags::from_bits_truncate(self.can_id)
    }

    pub fn is_error_frame(&self) -> bool {
        self.flags().contains(IdFlags::ERR)
    }

    /// Error class bits, meaningful only for error frames
    pub fn error_class(&self) -> u32 {
        self.can_id & ERR_MASK
    }

    /// Builds the wire representation of `frame`.
    ///
    /// Exactly `dlc` bytes are copied. A `dlc` above 8 is rejected rather
    /// than clamped.
    pub fn encode(frame: &Frame) -> Result<Self> {
        let len = frame.dlc as usize;
        if len > CAN_MAX_DLEN {
            return Err(DriverError::InvalidFrame { dlc: frame.dlc });
        }

        let mut flags = IdFlags::empty();
        flags.set(IdFlags::EFF, frame.is_extended);
        flags.set(IdFlags::RTR, frame.is_rtr);

        let mut wire = WireFrame {
            can_id: frame.id | flags.bits(),
            can_dlc: frame.dlc,
            ..Default::default()
        };
        wire.data[..len].copy_from_slice(&frame.data[..len]);
        Ok(wire)
    }

    /// Decodes into `out`, overwriting the flags, id, dlc and the first
    /// `min(dlc, 8)` data bytes.
    pub fn decode_into(&self, out: &mut Frame) {
        let flags = self.flags();
        out.is_extended = flags.contains(IdFlags::EFF);
        out.id = self.can_id
            & if out.is_extended {
                EFF_MASK
            } else {
                SFF_MASK
            };
        out.is_error = flags.contains(IdFlags::ERR);
        out.is_rtr = flags.contains(IdFlags::RTR);
        out.dlc = self.can_dlc;

        let len = (self.can_dlc as usize).min(CAN_MAX_DLEN);
        out.data[..len].copy_from_slice(&self.data[..len]);
    }

    pub fn decode(&self) -> Frame {
        let mut frame = Frame::default();
        self.decode_into(&mut frame);
        frame
    }
}
