use std::cmp;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::buffer::{BufferError, FrameBuffer, FrameHandle};
use crate::frame::{
    CANFrame, CANFD_FRAME, CANFD_MAX_DLEN, CAN_MAX_DLEN, EFF_FLAG, EFF_MASK, RTR_FLAG,
};

/// protocol version spoken by the native format
pub const PROTOCOL_VERSION: u8 = 2;

/// op code of a data packet; everything else is control traffic and rejected
pub const OP_DATA: u8 = 0;

/// native datagram header: version, op code, sequence number, BE frame count
pub const DATA_PACKET_BASE_SIZE: usize = 5;

/// native per-frame overhead: BE can_id plus the raw length byte
pub const FRAME_BASE_SIZE: usize = 5;

/// generic per-frame overhead: info byte plus the BE id
pub const DTU_FRAME_BASE_SIZE: usize = 5;

/// the generic data field is padded to at least this many bytes
pub const DTU_MIN_DATA_SIZE: usize = 8;

// The generic info byte packs FF|RTR|0|0|len[3:0]; the bit layout is part
// of the wire contract.
const DTU_INFO_FF: u8 = 0x80;
const DTU_INFO_RTR: u8 = 0x40;
const DTU_INFO_LEN_MASK: u8 = 0x0f;

fn dtu_info(ff: bool, rtr: bool, len: u8) -> u8 {
    let mut info = len & DTU_INFO_LEN_MASK;
    if ff {
        info |= DTU_INFO_FF;
    }
    if rtr {
        info |= DTU_INFO_RTR;
    }
    info
}

fn dtu_info_ff(info: u8) -> bool {
    info & DTU_INFO_FF != 0
}

fn dtu_info_rtr(info: u8) -> bool {
    info & DTU_INFO_RTR != 0
}

fn dtu_info_len(info: u8) -> usize {
    (info & DTU_INFO_LEN_MASK) as usize
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Received wrong version {0}.")]
    WrongVersion(u8),
    #[error("Received wrong OP code {0}.")]
    WrongOpCode(u8),
    #[error("Received incomplete packet.")]
    Truncated,
    #[error("Failed to allocate a frame for an incoming packet.")]
    Allocation(#[from] BufferError),
}

/// FilterRule
///
/// An id/mask pair consulted by the generic format on both directions.
/// A frame passes if `can_id & mask == id`; the empty mask passes
/// everything.
#[derive(Debug, Copy, Clone)]
pub struct FilterRule {
    id: u32,
    mask: u32,
}

impl FilterRule {
    pub fn new(id: u32, mask: u32) -> FilterRule {
        FilterRule { id, mask }
    }

    pub fn matches(&self, can_id: u32) -> bool {
        can_id & self.mask == self.id
    }
}

/// Wire format selection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CodecKind {
    /// sequence numbered datagrams with a 5 byte header
    Native,
    /// headerless fixed-stride frames as spoken by DTU style bridges
    Generic,
}

/// Result of encoding one outbound datagram.
#[derive(Debug)]
pub struct EncodeResult {
    /// bytes written to the packet buffer
    pub bytes: usize,
    /// frames serialized into the packet
    pub frames: u16,
    /// index of the first frame that did not fit, if any
    pub tail: Option<usize>,
}

/// Serializer and parser for one of the two wire formats, selected at
/// construction time.
pub struct Codec {
    kind: CodecKind,
    filter: Option<FilterRule>,
}

impl Codec {
    pub fn new(kind: CodecKind, filter: Option<FilterRule>) -> Codec {
        Codec { kind, filter }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Datagram header plus the smallest possible frame. The transmit side
    /// drains once the pending bytes come within this margin of the usable
    /// payload.
    pub fn min_packet_overhead(&self) -> usize {
        match self.kind {
            CodecKind::Native => DATA_PACKET_BASE_SIZE + FRAME_BASE_SIZE,
            CodecKind::Generic => DTU_FRAME_BASE_SIZE + DTU_MIN_DATA_SIZE,
        }
    }

    /// Serialize `batch` into `packet`, writing as many whole frames as
    /// fit. Returns the bytes written, the frame count and the index of the
    /// first frame that did not fit; the caller requeues that tail.
    pub fn encode(&self, packet: &mut [u8], batch: &[CANFrame], seq_no: u8) -> EncodeResult {
        match self.kind {
            CodecKind::Native => encode_native(packet, batch, seq_no),
            CodecKind::Generic => encode_generic(packet, batch, self.filter.as_ref()),
        }
    }

    /// Parse one received datagram. Every frame is allocated from `pool`
    /// (`debug` is handed through to the pool) and the filled handle passed
    /// to `deliver`; the receiver owns the slot from that point on. Frames
    /// delivered before an error stand.
    pub fn parse(
        &self,
        buffer: &[u8],
        pool: &FrameBuffer,
        debug: bool,
        deliver: &mut dyn FnMut(FrameHandle),
    ) -> Result<u16, ParseError> {
        match self.kind {
            CodecKind::Native => parse_native(buffer, pool, debug, deliver),
            CodecKind::Generic => {
                parse_generic(buffer, pool, self.filter.as_ref(), debug, deliver)
            }
        }
    }
}

/// Full serialized size of a frame in the native format. RTR frames carry
/// a dlc but no payload bytes.
fn native_frame_size(frame: &CANFrame) -> usize {
    let mut size = FRAME_BASE_SIZE;
    if frame.is_fd() {
        size += 1;
    }
    if !frame.is_rtr() {
        size += frame.len();
    }
    size
}

fn encode_native(packet: &mut [u8], batch: &[CANFrame], seq_no: u8) -> EncodeResult {
    let mut pos = DATA_PACKET_BASE_SIZE;
    let mut count: u16 = 0;
    let mut tail = None;

    for (index, frame) in batch.iter().enumerate() {
        if pos + native_frame_size(frame) > packet.len() {
            tail = Some(index);
            break;
        }
        BigEndian::write_u32(&mut packet[pos..pos + 4], frame.raw_id());
        pos += 4;
        packet[pos] = frame.raw_len();
        pos += 1;
        if frame.is_fd() {
            packet[pos] = frame.fd_flags();
            pos += 1;
        }
        if !frame.is_rtr() {
            let len = frame.len();
            packet[pos..pos + len].copy_from_slice(frame.data());
            pos += len;
        }
        count += 1;
    }

    packet[0] = PROTOCOL_VERSION;
    packet[1] = OP_DATA;
    packet[2] = seq_no;
    BigEndian::write_u16(&mut packet[3..5], count);

    EncodeResult {
        bytes: pos,
        frames: count,
        tail,
    }
}

fn parse_native(
    buffer: &[u8],
    pool: &FrameBuffer,
    debug: bool,
    deliver: &mut dyn FnMut(FrameHandle),
) -> Result<u16, ParseError> {
    if buffer.len() < DATA_PACKET_BASE_SIZE {
        return Err(ParseError::Truncated);
    }
    if buffer[0] != PROTOCOL_VERSION {
        return Err(ParseError::WrongVersion(buffer[0]));
    }
    if buffer[1] != OP_DATA {
        return Err(ParseError::WrongOpCode(buffer[1]));
    }
    let count = BigEndian::read_u16(&buffer[3..5]);
    if count == 0 {
        // empty packets are legal and silently ignored
        return Ok(0);
    }

    let mut pos = DATA_PACKET_BASE_SIZE;
    let mut delivered: u16 = 0;
    for _ in 0..count {
        if pos + FRAME_BASE_SIZE > buffer.len() {
            return Err(ParseError::Truncated);
        }
        let handle = pool.request(false, debug)?;
        match parse_native_frame(&buffer[pos..]) {
            Some((frame, consumed)) => {
                pool.fill(handle, frame);
                deliver(handle);
                delivered += 1;
                pos += consumed;
            }
            None => {
                pool.release(handle);
                return Err(ParseError::Truncated);
            }
        }
    }
    Ok(delivered)
}

fn parse_native_frame(data: &[u8]) -> Option<(CANFrame, usize)> {
    let can_id = BigEndian::read_u32(&data[..4]);
    let raw_len = data[4];
    let mut pos = FRAME_BASE_SIZE;

    // a CAN FD frame also carries its flags byte
    let mut flags = 0;
    if raw_len & CANFD_FRAME != 0 {
        flags = *data.get(pos)?;
        pos += 1;
    }

    let effective_len = (raw_len & !CANFD_FRAME) as usize;
    let limit = if raw_len & CANFD_FRAME != 0 {
        CANFD_MAX_DLEN
    } else {
        CAN_MAX_DLEN
    };
    if effective_len > limit {
        return None;
    }

    // RTR frames have no data section although they have a dlc
    let mut payload: &[u8] = &[];
    if can_id & RTR_FLAG == 0 {
        payload = data.get(pos..pos + effective_len)?;
        pos += effective_len;
    }

    Some((CANFrame::from_raw(can_id, raw_len, flags, payload), pos))
}

/// Fixed stride of a frame in the generic format: the short data field is
/// always padded to 8 bytes.
fn generic_frame_size(frame: &CANFrame) -> usize {
    DTU_FRAME_BASE_SIZE + cmp::max(frame.len(), DTU_MIN_DATA_SIZE)
}

fn encode_generic(
    packet: &mut [u8],
    batch: &[CANFrame],
    filter: Option<&FilterRule>,
) -> EncodeResult {
    let mut pos = 0;
    let mut count: u16 = 0;
    let mut tail = None;

    for (index, frame) in batch.iter().enumerate() {
        if packet.len() - pos < generic_frame_size(frame) {
            tail = Some(index);
            break;
        }
        if let Some(rule) = filter {
            if !rule.matches(frame.raw_id()) {
                continue;
            }
        }

        let len = frame.len();
        packet[pos] = dtu_info(frame.is_extended(), frame.is_rtr(), len as u8);
        BigEndian::write_u32(&mut packet[pos + 1..pos + 5], frame.raw_id() & EFF_MASK);
        let field = cmp::max(len, DTU_MIN_DATA_SIZE);
        packet[pos + 5..pos + 5 + len].copy_from_slice(frame.data());
        for byte in &mut packet[pos + 5 + len..pos + 5 + field] {
            *byte = 0;
        }
        pos += DTU_FRAME_BASE_SIZE + field;
        count += 1;
    }

    EncodeResult {
        bytes: pos,
        frames: count,
        tail,
    }
}

fn parse_generic(
    buffer: &[u8],
    pool: &FrameBuffer,
    filter: Option<&FilterRule>,
    debug: bool,
    deliver: &mut dyn FnMut(FrameHandle),
) -> Result<u16, ParseError> {
    let mut pos = 0;
    let mut delivered: u16 = 0;

    while pos < buffer.len() {
        let handle = pool.request(false, debug)?;
        match parse_generic_frame(&buffer[pos..]) {
            Some((frame, consumed)) => {
                pos += consumed;
                if filter.map_or(true, |rule| rule.matches(frame.raw_id())) {
                    pool.fill(handle, frame);
                    deliver(handle);
                    delivered += 1;
                } else {
                    pool.release(handle);
                }
            }
            None => {
                pool.release(handle);
                return Err(ParseError::Truncated);
            }
        }
    }
    Ok(delivered)
}

fn parse_generic_frame(data: &[u8]) -> Option<(CANFrame, usize)> {
    if data.len() < DTU_FRAME_BASE_SIZE {
        return None;
    }
    let info = data[0];
    let len = dtu_info_len(info);
    let field = cmp::max(len, DTU_MIN_DATA_SIZE);

    let mut can_id = BigEndian::read_u32(&data[1..5]);
    if dtu_info_ff(info) {
        can_id |= EFF_FLAG;
    }
    if dtu_info_rtr(info) {
        can_id |= RTR_FLAG;
    }

    let payload = data.get(DTU_FRAME_BASE_SIZE..DTU_FRAME_BASE_SIZE + field)?;
    Some((
        CANFrame::from_raw(can_id, len as u8, 0, &payload[..len]),
        DTU_FRAME_BASE_SIZE + field,
    ))
}
