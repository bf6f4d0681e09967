//! NSP packet layer: `[dest][src][ctrl][payload...][crc_lo][crc_hi]`.
//!
//! There is no length field; packet boundaries come from SLIP framing.

use crate::crc::{self, CrcEngine, CRC_LEN};
use crate::slip::MAX_FRAME_LEN;
use heapless::Vec;
use thiserror::Error;

pub const NSP_HEADER_LEN: usize = 3;
pub const NSP_MIN_LEN: usize = NSP_HEADER_LEN + CRC_LEN;
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - NSP_MIN_LEN;
pub const BROADCAST_ADDRESS: u8 = 0xFF;

const POLL_BIT: u8 = 0x80;
const ACK_B_BIT: u8 = 0x40;
const ACK_A_BIT: u8 = 0x20;
const COMMAND_MASK: u8 = 0x1F;

pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;
pub type PacketBytes = Vec<u8, MAX_FRAME_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    Ping = 0x00,
    Peek = 0x02,
    Poke = 0x03,
    ApplicationTelemetry = 0x07,
    ApplicationCommand = 0x08,
    ClearFault = 0x09,
    ConfigureProtection = 0x0A,
    TripLcl = 0x0B,
}

impl CommandCode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Ping),
            0x02 => Some(Self::Peek),
            0x03 => Some(Self::Poke),
            0x07 => Some(Self::ApplicationTelemetry),
            0x08 => Some(Self::ApplicationCommand),
            0x09 => Some(Self::ClearFault),
            0x0A => Some(Self::ConfigureProtection),
            0x0B => Some(Self::TripLcl),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// First byte of every reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0x00,
    UnsupportedCommand = 0x01,
    UnknownRegister = 0x02,
    ReadOnly = 0x03,
    OutOfRange = 0x04,
    InvalidLength = 0x05,
    UnknownBlock = 0x06,
    FaultActive = 0x07,
    InvalidMode = 0x08,
}

impl ReplyStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Self::Ok),
            0x01 => Some(Self::UnsupportedCommand),
            0x02 => Some(Self::UnknownRegister),
            0x03 => Some(Self::ReadOnly),
            0x04 => Some(Self::OutOfRange),
            0x05 => Some(Self::InvalidLength),
            0x06 => Some(Self::UnknownBlock),
            0x07 => Some(Self::FaultActive),
            0x08 => Some(Self::InvalidMode),
            _ => None,
        }
    }
}

/// The ctrl byte: poll(1) | ackB(1) | ackA(1) | command(5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control(u8);

impl Control {
    pub fn new(poll: bool, ack_b: bool, ack_a: bool, command: u8) -> Self {
        let mut raw = command & COMMAND_MASK;
        if poll {
            raw |= POLL_BIT;
        }
        if ack_b {
            raw |= ACK_B_BIT;
        }
        if ack_a {
            raw |= ACK_A_BIT;
        }
        Self(raw)
    }

    pub fn from_bits(raw: u8) -> Self {
        Self(raw)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn poll(self) -> bool {
        self.0 & POLL_BIT != 0
    }

    pub fn ack_b(self) -> bool {
        self.0 & ACK_B_BIT != 0
    }

    pub fn ack_a(self) -> bool {
        self.0 & ACK_A_BIT != 0
    }

    pub fn command(self) -> u8 {
        self.0 & COMMAND_MASK
    }

    /// Same ack bits and command, poll cleared.
    pub fn for_reply(self) -> Self {
        Self(self.0 & !POLL_BIT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("packet of {0} bytes is shorter than the {NSP_MIN_LEN}-byte minimum")]
    TooShort(usize),
    #[error("CRC mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    CrcMismatch { computed: u16, received: u16 },
    #[error("payload exceeds {MAX_PAYLOAD_LEN} bytes")]
    PayloadTooLarge,
    #[error("output buffer too small")]
    BufferTooSmall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMatch {
    Device,
    Broadcast,
    Other,
}

pub fn match_address(dest: u8, device: u8) -> AddressMatch {
    if dest == device {
        AddressMatch::Device
    } else if dest == BROADCAST_ADDRESS {
        AddressMatch::Broadcast
    } else {
        AddressMatch::Other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub dest: u8,
    pub src: u8,
    pub ctrl: Control,
    pub payload: Payload,
}

impl Packet {
    pub fn new(dest: u8, src: u8, ctrl: Control, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            dest,
            src,
            ctrl,
            payload: Vec::from_slice(payload).map_err(|()| ProtocolError::PayloadTooLarge)?,
        })
    }

    /// Parse a de-SLIPed frame, verifying its CRC.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < NSP_MIN_LEN {
            return Err(ProtocolError::TooShort(bytes.len()));
        }
        let crc_at = bytes.len() - CRC_LEN;
        let computed = crc::calculate(&bytes[..crc_at]);
        let received = u16::from_le_bytes([bytes[crc_at], bytes[crc_at + 1]]);
        if computed != received {
            return Err(ProtocolError::CrcMismatch { computed, received });
        }
        Self::new(
            bytes[0],
            bytes[1],
            Control::from_bits(bytes[2]),
            &bytes[NSP_HEADER_LEN..crc_at],
        )
    }

    pub fn command(&self) -> Option<CommandCode> {
        CommandCode::from_code(self.ctrl.command())
    }

    /// Encoded length including CRC.
    pub fn wire_len(&self) -> usize {
        NSP_HEADER_LEN + self.payload.len() + CRC_LEN
    }

    /// Serialise into `out`, computing the CRC through `engine` so any
    /// pending corruption is applied.
    pub fn encode_with(&self, engine: &mut CrcEngine, out: &mut [u8]) -> Result<usize, ProtocolError> {
        let data_len = NSP_HEADER_LEN + self.payload.len();
        if out.len() < data_len + CRC_LEN {
            return Err(ProtocolError::BufferTooSmall);
        }
        out[0] = self.dest;
        out[1] = self.src;
        out[2] = self.ctrl.bits();
        out[NSP_HEADER_LEN..data_len].copy_from_slice(&self.payload);
        engine.append(out, data_len).ok_or(ProtocolError::BufferTooSmall)
    }

    pub fn to_bytes(&self) -> Result<PacketBytes, ProtocolError> {
        let mut scratch = [0u8; MAX_FRAME_LEN];
        let data_len = NSP_HEADER_LEN + self.payload.len();
        scratch[0] = self.dest;
        scratch[1] = self.src;
        scratch[2] = self.ctrl.bits();
        scratch[NSP_HEADER_LEN..data_len].copy_from_slice(&self.payload);
        let len = crc::append(&mut scratch, data_len).ok_or(ProtocolError::BufferTooSmall)?;
        Vec::from_slice(&scratch[..len]).map_err(|()| ProtocolError::BufferTooSmall)
    }

    /// Build the reply to this request: addresses swapped, poll cleared,
    /// ack bits and command code preserved.
    pub fn reply(&self, payload: &[u8]) -> Result<Self, ProtocolError> {
        Self::new(self.src, self.dest, self.ctrl.for_reply(), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_bits() {
        let ctrl = Control::new(true, false, true, 0x0A);
        assert_eq!(ctrl.bits(), 0b1010_1010);
        assert!(ctrl.poll());
        assert!(!ctrl.ack_b());
        assert!(ctrl.ack_a());
        assert_eq!(ctrl.command(), 0x0A);

        let reply = ctrl.for_reply();
        assert!(!reply.poll());
        assert!(reply.ack_a());
        assert_eq!(reply.command(), 0x0A);
    }

    #[test]
    fn test_parse_too_short() {
        assert_eq!(Packet::parse(&[1, 2, 3, 4]), Err(ProtocolError::TooShort(4)));
    }

    #[test]
    fn test_parse_bad_crc() {
        let packet = Packet::new(0x20, 0x11, Control::new(true, false, false, 0), &[1, 2]).unwrap();
        let mut bytes = packet.to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x5A;
        assert!(matches!(
            Packet::parse(&bytes),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_framed_length() {
        let packet = Packet::new(0x20, 0x11, Control::new(true, false, false, 2), &[0x00, 0x03]).unwrap();
        assert_eq!(packet.wire_len(), 7);
        assert_eq!(packet.to_bytes().unwrap().len(), 7);
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let request = Packet::new(0x20, 0x11, Control::new(true, true, false, 0x00), &[9]).unwrap();
        let reply = request.reply(&[0, 9]).unwrap();
        assert_eq!(reply.dest, 0x11);
        assert_eq!(reply.src, 0x20);
        assert!(!reply.ctrl.poll());
        assert!(reply.ctrl.ack_b());
        assert_eq!(reply.command(), Some(CommandCode::Ping));
    }

    #[test]
    fn test_address_matching() {
        assert_eq!(match_address(0x20, 0x20), AddressMatch::Device);
        assert_eq!(match_address(BROADCAST_ADDRESS, 0x20), AddressMatch::Broadcast);
        assert_eq!(match_address(0x21, 0x20), AddressMatch::Other);
    }

    #[test]
    fn test_unknown_command_code() {
        assert_eq!(CommandCode::from_code(0x1F), None);
        assert_eq!(CommandCode::from_code(0x0B), Some(CommandCode::TripLcl));
    }
}
