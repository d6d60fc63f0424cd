use bytes::{Buf, BufMut, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};

use crate::error::LinkError;

/// Destination subsystem inside the device. The port is a 4-bit selector in the
///  packet header; values not listed here decode as [CrtpPort::Unknown].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CrtpPort {
    Console = 0x00,
    Parameters = 0x02,
    Commander = 0x03,
    Memory = 0x04,
    Logging = 0x05,
    Localization = 0x06,
    GenericCommander = 0x07,
    HighLevelCommander = 0x08,
    Platform = 0x0D,
    LinkControl = 0x0F,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// A single CRTP packet: one header byte plus up to 30 payload bytes.
///
/// Header byte layout: `[port:4][channel:2][safelink:2]`. The two low bits are
///  reserved for the safelink toggles and are owned by [crate::safelink] - the
///  codec always writes them as zero and masks them away on decode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CrtpPacket {
    port: u8,
    channel: u8,
    payload: Vec<u8>,
}

impl CrtpPacket {
    /// Total frame size limit on the radio link, header byte included.
    pub const MTU: usize = 32;
    /// The transport may prepend a length byte, so the payload limit is two
    ///  below the MTU rather than one.
    pub const MAX_PAYLOAD: usize = 30;

    pub fn new(port: CrtpPort, channel: u8, payload: Vec<u8>) -> Result<CrtpPacket, LinkError> {
        Self::from_raw_port(port.into(), channel, payload)
    }

    pub fn from_raw_port(port: u8, channel: u8, payload: Vec<u8>) -> Result<CrtpPacket, LinkError> {
        if port > 0x0F {
            return Err(LinkError::MalformedHeader("port out of range"));
        }
        if channel > 0x03 {
            return Err(LinkError::MalformedHeader("channel out of range"));
        }
        if payload.len() > Self::MAX_PAYLOAD {
            return Err(LinkError::MalformedHeader("payload exceeds link MTU"));
        }
        Ok(CrtpPacket { port, channel, payload })
    }

    /// The packet polled on an idle uplink to give the device a transmit
    ///  opportunity (header 0xFC before the safelink bits are applied).
    pub fn null() -> CrtpPacket {
        CrtpPacket {
            port: CrtpPort::LinkControl.into(),
            channel: 3,
            payload: Vec::new(),
        }
    }

    pub fn port(&self) -> CrtpPort {
        CrtpPort::from_primitive(self.port)
    }

    pub fn raw_port(&self) -> u8 {
        self.port
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn header_byte(&self) -> u8 {
        (self.port << 4) | (self.channel << 2)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.header_byte());
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<CrtpPacket, LinkError> {
        if !buf.has_remaining() {
            return Err(LinkError::MalformedHeader("empty frame"));
        }
        let header = buf.get_u8();
        if buf.remaining() > Self::MAX_PAYLOAD {
            return Err(LinkError::MalformedHeader("frame exceeds link MTU"));
        }

        let mut payload = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut payload);

        Ok(CrtpPacket {
            port: (header >> 4) & 0x0F,
            channel: (header >> 2) & 0x03,
            payload,
        })
    }

    /// Decodes a raw frame, ignoring the safelink bits in the header.
    pub fn from_frame(frame: &[u8]) -> Result<CrtpPacket, LinkError> {
        Self::deser(&mut &frame[..])
    }

    /// Serializes into a fresh frame buffer with the safelink bits zeroed.
    pub fn to_frame(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        self.ser(&mut buf);
        buf
    }

    pub fn matches_header(&self, port: u8, channel: u8) -> bool {
        self.port == port && self.channel == channel
    }
}
