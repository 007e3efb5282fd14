//! FT1.2 frame format (CS101 link layer)
//!
//! Three frame shapes share the line:
//!
//! ```text
//! fixed:    0x10 | C | A | CS | 0x16
//! variable: 0x68 | L | L | 0x68 | C | A | user... | CS | 0x16
//! single:   0xE5 (ack) or 0xA2 (nack)
//! ```
//!
//! `L` counts control + address + user octets and is transmitted twice.
//! `CS` is the arithmetic sum of control, address and user octets mod 256.
//! Serial lines are noisy, so the decoder resynchronizes on garbage instead
//! of failing the stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::common::IecError;
use crate::params::{LinkAddrSize, LinkLayerParameters};

/// Start octet of a fixed-length frame
pub const START_FIXED: u8 = 0x10;
/// Start octet of a variable-length frame
pub const START_VARIABLE: u8 = 0x68;
/// End octet of fixed and variable frames
pub const END_FRAME: u8 = 0x16;
/// Single-character positive confirmation
pub const SINGLE_CHAR_ACK: u8 = 0xE5;
/// Single-character negative confirmation
pub const SINGLE_CHAR_NACK: u8 = 0xA2;

/// Function codes of primary (PRM = 1) frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrimaryFunction {
    /// Reset of remote link
    ResetRemoteLink = 0,
    /// Reset of user process
    ResetUserProcess = 1,
    /// Test function for link (balanced mode)
    TestFunction = 2,
    /// User data, confirmation expected
    UserDataConfirmed = 3,
    /// User data, no confirmation
    UserDataNoReply = 4,
    /// Request status of link
    RequestLinkStatus = 9,
    /// Request class 1 user data
    RequestClass1 = 10,
    /// Request class 2 user data
    RequestClass2 = 11,
}

impl PrimaryFunction {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x0F {
            0 => Some(Self::ResetRemoteLink),
            1 => Some(Self::ResetUserProcess),
            2 => Some(Self::TestFunction),
            3 => Some(Self::UserDataConfirmed),
            4 => Some(Self::UserDataNoReply),
            9 => Some(Self::RequestLinkStatus),
            10 => Some(Self::RequestClass1),
            11 => Some(Self::RequestClass2),
            _ => None,
        }
    }
}

/// Function codes of secondary (PRM = 0) frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecondaryFunction {
    /// Positive acknowledgment
    Ack = 0,
    /// Negative acknowledgment, busy
    Nack = 1,
    /// Requested user data
    UserData = 8,
    /// Requested data not available
    NackNoData = 9,
    /// Status of link
    LinkStatus = 11,
    /// Link service not functioning
    NotFunctioning = 14,
    /// Link service not implemented
    NotImplemented = 15,
}

impl SecondaryFunction {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0x0F {
            0 => Some(Self::Ack),
            1 => Some(Self::Nack),
            8 => Some(Self::UserData),
            9 => Some(Self::NackNoData),
            11 => Some(Self::LinkStatus),
            14 => Some(Self::NotFunctioning),
            15 => Some(Self::NotImplemented),
            _ => None,
        }
    }
}

/// Control field of fixed and variable frames
///
/// Bit 7 carries DIR (balanced mode only), bit 6 PRM. Bits 5 and 4 are
/// FCB/FCV on primary frames and ACD/DFC on secondary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkControl {
    /// Physical transmission direction (balanced mode)
    pub dir: bool,
    /// Frame from the primary (initiating) station
    pub prm: bool,
    /// Frame count bit (primary) / access demand, class 1 pending (secondary)
    pub fcb_acd: bool,
    /// Frame count valid (primary) / data flow control, busy (secondary)
    pub fcv_dfc: bool,
    /// 4-bit function code
    pub function: u8,
}

impl LinkControl {
    /// Primary frame control field
    pub fn primary(dir: bool, fcb: bool, fcv: bool, function: PrimaryFunction) -> Self {
        Self {
            dir,
            prm: true,
            fcb_acd: fcb,
            fcv_dfc: fcv,
            function: function as u8,
        }
    }

    /// Secondary frame control field
    pub fn secondary(dir: bool, acd: bool, dfc: bool, function: SecondaryFunction) -> Self {
        Self {
            dir,
            prm: false,
            fcb_acd: acd,
            fcv_dfc: dfc,
            function: function as u8,
        }
    }

    pub fn from_byte(octet: u8) -> Self {
        Self {
            dir: (octet & 0x80) != 0,
            prm: (octet & 0x40) != 0,
            fcb_acd: (octet & 0x20) != 0,
            fcv_dfc: (octet & 0x10) != 0,
            function: octet & 0x0F,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self.function & 0x0F)
            | if self.fcv_dfc { 0x10 } else { 0 }
            | if self.fcb_acd { 0x20 } else { 0 }
            | if self.prm { 0x40 } else { 0 }
            | if self.dir { 0x80 } else { 0 }
    }
}

/// One FT1.2 frame
#[derive(Debug, Clone, PartialEq)]
pub enum Ft12Frame {
    /// 0xE5
    SingleCharAck,
    /// 0xA2
    SingleCharNack,
    /// Fixed-length frame without user data
    Fixed { control: LinkControl, address: u16 },
    /// Variable-length frame carrying link user data (an ASDU)
    Variable {
        control: LinkControl,
        address: u16,
        user_data: Vec<u8>,
    },
}

impl Ft12Frame {
    /// Control field of fixed and variable frames
    pub fn control(&self) -> Option<LinkControl> {
        match self {
            Ft12Frame::Fixed { control, .. } | Ft12Frame::Variable { control, .. } => {
                Some(*control)
            }
            _ => None,
        }
    }

    /// Link address of fixed and variable frames
    pub fn address(&self) -> Option<u16> {
        match self {
            Ft12Frame::Fixed { address, .. } | Ft12Frame::Variable { address, .. } => {
                Some(*address)
            }
            _ => None,
        }
    }
}

fn checksum(octets: &[u8]) -> u8 {
    octets.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn put_address(buf: &mut BytesMut, address: u16, size: LinkAddrSize) {
    match size {
        LinkAddrSize::OneOctet => buf.put_u8(address as u8),
        LinkAddrSize::TwoOctets => buf.put_u16_le(address),
    }
}

fn read_address(octets: &[u8], size: LinkAddrSize) -> u16 {
    match size {
        LinkAddrSize::OneOctet => octets[0] as u16,
        LinkAddrSize::TwoOctets => u16::from_le_bytes([octets[0], octets[1]]),
    }
}

/// FT1.2 stream codec
#[derive(Debug, Clone)]
pub struct Ft12Codec {
    params: LinkLayerParameters,
}

impl Ft12Codec {
    pub fn new(params: LinkLayerParameters) -> Self {
        Self { params }
    }

    fn addr_size(&self) -> usize {
        self.params.address_size as usize
    }
}

impl Decoder for Ft12Codec {
    type Item = Ft12Frame;
    type Error = IecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Ft12Frame>, IecError> {
        loop {
            let Some(&start) = src.first() else {
                return Ok(None);
            };
            match start {
                SINGLE_CHAR_ACK => {
                    src.advance(1);
                    return Ok(Some(Ft12Frame::SingleCharAck));
                }
                SINGLE_CHAR_NACK => {
                    src.advance(1);
                    return Ok(Some(Ft12Frame::SingleCharNack));
                }
                START_FIXED => {
                    // start + control + address + checksum + end
                    let total = 3 + self.addr_size() + 1;
                    if src.len() < total {
                        return Ok(None);
                    }
                    let body = &src[1..1 + 1 + self.addr_size()];
                    let cs = src[total - 2];
                    let end = src[total - 1];
                    if end != END_FRAME || cs != checksum(body) {
                        tracing::warn!("bad fixed frame, resynchronizing");
                        src.advance(1);
                        continue;
                    }
                    let control = LinkControl::from_byte(body[0]);
                    let address = read_address(&body[1..], self.params.address_size);
                    src.advance(total);
                    return Ok(Some(Ft12Frame::Fixed { control, address }));
                }
                START_VARIABLE => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let length = src[1] as usize;
                    if src[2] as usize != length
                        || src[3] != START_VARIABLE
                        || length < 1 + self.addr_size()
                    {
                        tracing::warn!("bad variable frame header, resynchronizing");
                        src.advance(1);
                        continue;
                    }
                    let total = 4 + length + 2;
                    if src.len() < total {
                        return Ok(None);
                    }
                    let body = &src[4..4 + length];
                    let cs = src[total - 2];
                    let end = src[total - 1];
                    if end != END_FRAME || cs != checksum(body) {
                        tracing::warn!("bad variable frame checksum, resynchronizing");
                        src.advance(1);
                        continue;
                    }
                    let control = LinkControl::from_byte(body[0]);
                    let address = read_address(&body[1..], self.params.address_size);
                    let user_data = body[1 + self.addr_size()..].to_vec();
                    src.advance(total);
                    return Ok(Some(Ft12Frame::Variable {
                        control,
                        address,
                        user_data,
                    }));
                }
                _ => {
                    // line noise between frames
                    src.advance(1);
                }
            }
        }
    }
}

impl Encoder<Ft12Frame> for Ft12Codec {
    type Error = IecError;

    fn encode(&mut self, frame: Ft12Frame, dst: &mut BytesMut) -> Result<(), IecError> {
        match frame {
            Ft12Frame::SingleCharAck => dst.put_u8(SINGLE_CHAR_ACK),
            Ft12Frame::SingleCharNack => dst.put_u8(SINGLE_CHAR_NACK),
            Ft12Frame::Fixed { control, address } => {
                let mut body = BytesMut::with_capacity(1 + self.addr_size());
                body.put_u8(control.to_byte());
                put_address(&mut body, address, self.params.address_size);

                dst.put_u8(START_FIXED);
                dst.put_slice(&body);
                dst.put_u8(checksum(&body));
                dst.put_u8(END_FRAME);
            }
            Ft12Frame::Variable {
                control,
                address,
                user_data,
            } => {
                let length = 1 + self.addr_size() + user_data.len();
                if length > 255 {
                    return Err(IecError::InvalidArgument(format!(
                        "link user data of {} octets exceeds the FT1.2 limit",
                        user_data.len()
                    )));
                }
                let mut body = BytesMut::with_capacity(length);
                body.put_u8(control.to_byte());
                put_address(&mut body, address, self.params.address_size);
                body.put_slice(&user_data);

                dst.put_u8(START_VARIABLE);
                dst.put_u8(length as u8);
                dst.put_u8(length as u8);
                dst.put_u8(START_VARIABLE);
                dst.put_slice(&body);
                dst.put_u8(checksum(&body));
                dst.put_u8(END_FRAME);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn codec() -> Ft12Codec {
        Ft12Codec::new(LinkLayerParameters::default())
    }

    fn encode(frame: Ft12Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        codec().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn fixed_frame_vector() {
        // reset remote link to address 3: control 0x40, A 0x03, CS 0x43
        let frame = Ft12Frame::Fixed {
            control: LinkControl::primary(false, false, false, PrimaryFunction::ResetRemoteLink),
            address: 3,
        };
        let buf = encode(frame.clone());
        assert_eq!(&buf[..], &[0x10, 0x40, 0x03, 0x43, 0x16]);

        let mut src = buf;
        assert_eq!(codec().decode(&mut src).unwrap(), Some(frame));
    }

    #[test]
    fn variable_frame_round_trip() {
        let frame = Ft12Frame::Variable {
            control: LinkControl::primary(false, true, true, PrimaryFunction::UserDataConfirmed),
            address: 5,
            user_data: vec![0x64, 0x01, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x14],
        };
        let mut buf = encode(frame.clone());
        assert_eq!(buf[0], START_VARIABLE);
        assert_eq!(buf[1], buf[2]);
        assert_eq!(buf[1] as usize, 2 + 10);
        assert_eq!(*buf.last().unwrap(), END_FRAME);

        // checksum covers control + address + user data
        let body_len = buf[1] as usize;
        let expected = checksum(&buf[4..4 + body_len]);
        assert_eq!(buf[buf.len() - 2], expected);

        assert_eq!(codec().decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn single_characters_round_trip() {
        let mut buf = BytesMut::from(&[SINGLE_CHAR_ACK, SINGLE_CHAR_NACK][..]);
        let mut c = codec();
        assert_eq!(c.decode(&mut buf).unwrap(), Some(Ft12Frame::SingleCharAck));
        assert_eq!(c.decode(&mut buf).unwrap(), Some(Ft12Frame::SingleCharNack));
        assert_eq!(c.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decoder_resynchronizes_after_noise() {
        let frame = Ft12Frame::Fixed {
            control: LinkControl::secondary(false, false, false, SecondaryFunction::Ack),
            address: 1,
        };
        let encoded = encode(frame.clone());

        let mut src = BytesMut::from(&[0x00, 0xFF, 0x42][..]);
        src.extend_from_slice(&encoded);
        assert_eq!(codec().decode(&mut src).unwrap(), Some(frame));
    }

    #[test]
    fn corrupted_checksum_is_skipped() {
        let good = Ft12Frame::Fixed {
            control: LinkControl::secondary(false, false, false, SecondaryFunction::Ack),
            address: 1,
        };
        let mut bad = encode(good.clone());
        bad[3] ^= 0xFF; // corrupt the checksum
        bad.extend_from_slice(&encode(good.clone()));

        let mut c = codec();
        assert_eq!(c.decode(&mut bad).unwrap(), Some(good));
    }

    #[test]
    fn partial_frames_wait_for_more_octets() {
        let frame = Ft12Frame::Variable {
            control: LinkControl::primary(false, false, true, PrimaryFunction::RequestClass2),
            address: 9,
            user_data: vec![1, 2, 3],
        };
        let full = encode(frame.clone());
        let mut c = codec();
        let mut src = BytesMut::new();
        for &b in &full[..full.len() - 1] {
            src.put_u8(b);
            // never a full frame while octets are missing
        }
        assert_eq!(c.decode(&mut src).unwrap(), None);
        src.put_u8(full[full.len() - 1]);
        assert_eq!(c.decode(&mut src).unwrap(), Some(frame));
    }

    #[test]
    fn two_octet_addresses() {
        let params = LinkLayerParameters {
            address_size: LinkAddrSize::TwoOctets,
            ..Default::default()
        };
        let mut codec = Ft12Codec::new(params);
        let frame = Ft12Frame::Fixed {
            control: LinkControl::primary(false, true, true, PrimaryFunction::RequestClass1),
            address: 0x0102,
        };
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn control_field_bits() {
        let control = LinkControl::primary(true, true, true, PrimaryFunction::UserDataConfirmed);
        assert_eq!(control.to_byte(), 0x80 | 0x40 | 0x20 | 0x10 | 0x03);
        assert_eq!(LinkControl::from_byte(control.to_byte()), control);
    }
}
