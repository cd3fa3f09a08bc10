use std::fmt::Display;

use thiserror::Error;

/// if set, indicate 29 bit extended format
pub const EFF_FLAG: u32 = 0x80000000;

/// remote transmission request flag
pub const RTR_FLAG: u32 = 0x40000000;

/// error flag
pub const ERR_FLAG: u32 = 0x20000000;

/// valid bits in standard frame id
pub const SFF_MASK: u32 = 0x000007ff;

/// valid bits in extended frame id
pub const EFF_MASK: u32 = 0x1fffffff;

/// valid bits in error frame
pub const ERR_MASK: u32 = 0x1fffffff;

/// marks a CAN FD frame in the raw length byte
pub const CANFD_FRAME: u8 = 0x80;

/// payload limit of a classic frame
pub const CAN_MAX_DLEN: usize = 8;

/// payload limit of a CAN FD frame
pub const CANFD_MAX_DLEN: usize = 64;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Provided slice of data was longer than the frame payload limit.")]
    TooMuchData,
    #[error("Provided ID was greater than EFF_MASK.")]
    IDTooLarge,
}

/// CANFrame
///
/// Holds classic CAN and CAN FD frames alike. Uses the same memory layout as
/// the underlying kernel canfd_frame struct for performance reasons; classic
/// frames simply never use more than 8 data bytes.
#[derive(Debug, Copy, Clone)]
#[repr(C, align(8))]
pub struct CANFrame {
    /// 32 bit CAN_ID + EFF/RTR/ERR flags
    id: u32,
    /// raw data length. Bit 7 (CANFD_FRAME) marks a CAN FD frame
    len: u8,
    /// CAN FD flags (BRS/ESI)
    flags: u8,
    /// reserved
    res0: u8,
    /// reserved
    res1: u8,
    /// buffer for data
    data: [u8; CANFD_MAX_DLEN],
}

impl Default for CANFrame {
    fn default() -> Self {
        Self {
            id: 0,
            len: 0,
            flags: 0,
            res0: 0,
            res1: 0,
            data: [0; CANFD_MAX_DLEN],
        }
    }
}

impl CANFrame {
    pub fn new(mut id: u32, data: &[u8], rtr: bool, err: bool) -> Result<CANFrame, FrameError> {
        if data.len() > CAN_MAX_DLEN {
            return Err(FrameError::TooMuchData);
        }
        if id > EFF_MASK {
            return Err(FrameError::IDTooLarge);
        }
        // set EFF_FLAG on large message
        if id > SFF_MASK {
            id |= EFF_FLAG;
        }
        if rtr {
            id |= RTR_FLAG;
        }
        if err {
            id |= ERR_FLAG;
        }

        let mut full_data = [0; CANFD_MAX_DLEN];
        full_data[..data.len()].copy_from_slice(data);

        Ok(CANFrame {
            id,
            len: data.len() as u8,
            flags: 0,
            res0: 0,
            res1: 0,
            data: full_data,
        })
    }

    pub fn new_fd(mut id: u32, data: &[u8], flags: u8) -> Result<CANFrame, FrameError> {
        if data.len() > CANFD_MAX_DLEN {
            return Err(FrameError::TooMuchData);
        }
        if id > EFF_MASK {
            return Err(FrameError::IDTooLarge);
        }
        if id > SFF_MASK {
            id |= EFF_FLAG;
        }

        let mut full_data = [0; CANFD_MAX_DLEN];
        full_data[..data.len()].copy_from_slice(data);

        Ok(CANFrame {
            id,
            len: data.len() as u8 | CANFD_FRAME,
            flags,
            res0: 0,
            res1: 0,
            data: full_data,
        })
    }

    /// Assemble a frame from raw wire fields. No flag bits are added or
    /// stripped and `len` keeps its CANFD_FRAME marker. `data` may be
    /// shorter than the length field claims (RTR frames carry none).
    pub fn from_raw(id: u32, len: u8, flags: u8, data: &[u8]) -> CANFrame {
        let mut full_data = [0; CANFD_MAX_DLEN];
        let used = data.len().min(CANFD_MAX_DLEN);
        full_data[..used].copy_from_slice(&data[..used]);

        CANFrame {
            id,
            len,
            flags,
            res0: 0,
            res1: 0,
            data: full_data,
        }
    }

    /// Return the actual CAN ID (without EFF/RTR/ERR flags)
    #[inline(always)]
    pub fn id(&self) -> u32 {
        if self.is_extended() {
            self.id & EFF_MASK
        } else {
            self.id & SFF_MASK
        }
    }

    /// The full 32 bit id field including the EFF/RTR/ERR flag bits.
    #[inline(always)]
    pub fn raw_id(&self) -> u32 {
        self.id
    }

    pub fn err(&self) -> u32 {
        self.id & ERR_MASK
    }

    pub fn is_extended(&self) -> bool {
        self.id & EFF_FLAG != 0
    }

    pub fn is_error(&self) -> bool {
        self.id & ERR_FLAG != 0
    }

    pub fn is_rtr(&self) -> bool {
        self.id & RTR_FLAG != 0
    }

    pub fn is_fd(&self) -> bool {
        self.len & CANFD_FRAME != 0
    }

    /// The raw length byte, CANFD_FRAME marker included.
    pub fn raw_len(&self) -> u8 {
        self.len
    }

    /// CAN FD flags byte. Meaningless on classic frames.
    pub fn fd_flags(&self) -> u8 {
        self.flags
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    pub fn raw_data(&self) -> [u8; CANFD_MAX_DLEN] {
        self.data
    }

    /// Effective payload length with the CANFD_FRAME marker masked off.
    pub fn len(&self) -> usize {
        (self.len & !CANFD_FRAME) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PartialEq for CANFrame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.len == other.len
            && (!self.is_fd() || self.flags == other.flags)
            && self.data() == other.data()
    }
}

impl Eq for CANFrame {}

impl Display for CANFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "ID: {:#x} RTR: {} FD: {} DATA: {:?}",
            self.id(),
            self.is_rtr(),
            self.is_fd(),
            self.data()
        )
    }
}

impl core::fmt::UpperHex for CANFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        write!(f, "{:X}#", self.id())?;

        let parts: Vec<String> = self.data().iter().map(|v| format!("{:02X}", v)).collect();

        write!(f, "{}", parts.join(" "))
    }
}
