//! CS104 APCI frame model and stream codec
//!
//! Every APDU starts with the 6-octet APCI: `0x68 | len | c1 c2 c3 c4` where
//! `len` counts the octets after itself. The two low bits of `c1` select the
//! frame format: I (bit0 = 0, carries an ASDU), S (01, ack only) or
//! U (11, STARTDT/STOPDT/TESTFR act/con).
//!
//! The codec reassembles APDUs from the byte stream. It only parses the
//! transport header; ASDU octets are handed up raw so content errors can be
//! answered without tearing the connection down.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::asdu::{Asdu, AsduPayload};
use crate::common::IecError;
use crate::params::AppLayerParameters;

/// APDU start octet
pub const START_BYTE: u8 = 0x68;
/// Smallest valid length field (the four control octets)
pub const MIN_APCI_LENGTH: usize = 4;
/// Largest valid length field (APDU total 255)
pub const MAX_APDU_LENGTH: usize = 253;

/// U-frame control functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UFrame {
    /// Start data transfer activation
    StartDtAct = 0x07,
    /// Start data transfer confirmation
    StartDtCon = 0x0B,
    /// Stop data transfer activation
    StopDtAct = 0x13,
    /// Stop data transfer confirmation
    StopDtCon = 0x23,
    /// Test frame activation
    TestFrAct = 0x43,
    /// Test frame confirmation
    TestFrCon = 0x83,
}

impl UFrame {
    /// Parse the first control octet of a U-frame
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x07 => Some(Self::StartDtAct),
            0x0B => Some(Self::StartDtCon),
            0x13 => Some(Self::StopDtAct),
            0x23 => Some(Self::StopDtCon),
            0x43 => Some(Self::TestFrAct),
            0x83 => Some(Self::TestFrCon),
            _ => None,
        }
    }

    /// The first control octet
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// APCI structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apci {
    /// I-format (information transfer format)
    IFrame {
        /// N(S), 15-bit send sequence number
        send_seq: u16,
        /// N(R), 15-bit receive sequence number
        recv_seq: u16,
    },
    /// S-format (supervisory format)
    SFrame {
        /// N(R), 15-bit receive sequence number
        recv_seq: u16,
    },
    /// U-format (unnumbered control format)
    UFrame(UFrame),
}

impl Apci {
    fn encode_control(&self, buf: &mut BytesMut) {
        match *self {
            Apci::IFrame { send_seq, recv_seq } => {
                buf.put_u8(((send_seq << 1) & 0xFE) as u8);
                buf.put_u8((send_seq >> 7) as u8);
                buf.put_u8(((recv_seq << 1) & 0xFE) as u8);
                buf.put_u8((recv_seq >> 7) as u8);
            }
            Apci::SFrame { recv_seq } => {
                buf.put_u8(0x01);
                buf.put_u8(0x00);
                buf.put_u8(((recv_seq << 1) & 0xFE) as u8);
                buf.put_u8((recv_seq >> 7) as u8);
            }
            Apci::UFrame(code) => {
                buf.put_u8(code.to_byte());
                buf.put_u8(0x00);
                buf.put_u8(0x00);
                buf.put_u8(0x00);
            }
        }
    }

    fn decode_control(control: [u8; 4]) -> Result<Self, IecError> {
        let c1 = control[0];
        if (c1 & 0x01) == 0 {
            let send_seq = (((control[1] as u16) << 7) | ((c1 as u16) >> 1)) & 0x7FFF;
            let recv_seq = (((control[3] as u16) << 7) | ((control[2] as u16) >> 1)) & 0x7FFF;
            Ok(Apci::IFrame { send_seq, recv_seq })
        } else if (c1 & 0x03) == 0x01 {
            let recv_seq = (((control[3] as u16) << 7) | ((control[2] as u16) >> 1)) & 0x7FFF;
            Ok(Apci::SFrame { recv_seq })
        } else {
            let code = UFrame::from_byte(c1).ok_or_else(|| {
                IecError::ProtocolError(format!("Invalid U-frame control field: {c1:02X}"))
            })?;
            Ok(Apci::UFrame(code))
        }
    }
}

/// APDU (Application Protocol Data Unit) structure
#[derive(Debug, Clone, PartialEq)]
pub struct Apdu {
    /// APCI (Application Protocol Control Information)
    pub apci: Apci,
    /// ASDU - only for I-frames
    pub asdu: Option<AsduPayload>,
}

impl Apdu {
    /// Create a new I-format APDU
    pub fn new_i_frame(send_seq: u16, recv_seq: u16, asdu: Asdu) -> Self {
        Self {
            apci: Apci::IFrame { send_seq, recv_seq },
            asdu: Some(AsduPayload::Typed(asdu)),
        }
    }

    /// Create a new S-format APDU
    pub fn new_s_frame(recv_seq: u16) -> Self {
        Self {
            apci: Apci::SFrame { recv_seq },
            asdu: None,
        }
    }

    /// Create a new U-format APDU
    pub fn new_u_frame(code: UFrame) -> Self {
        Self {
            apci: Apci::UFrame(code),
            asdu: None,
        }
    }
}

/// Hook receiving a copy of every frame crossing the wire
pub type RawMessageTap = std::sync::Arc<dyn Fn(crate::common::Direction, &[u8]) + Send + Sync>;

/// Stream codec reassembling APDUs from a CS104 byte stream
#[derive(Clone)]
pub struct Iec104Codec {
    params: AppLayerParameters,
    raw_tap: Option<RawMessageTap>,
}

impl Iec104Codec {
    /// Codec for the given application layer parameter set
    pub fn new(params: AppLayerParameters) -> Self {
        Self {
            params,
            raw_tap: None,
        }
    }

    /// Pass a copy of every raw frame to the tap (the raw-message handler)
    pub fn with_raw_tap(mut self, tap: RawMessageTap) -> Self {
        self.raw_tap = Some(tap);
        self
    }
}

impl Decoder for Iec104Codec {
    type Item = Apdu;
    type Error = IecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Apdu>, IecError> {
        if src.len() < 2 {
            return Ok(None);
        }
        if src[0] != START_BYTE {
            // A stream out of frame sync cannot be recovered; the connection
            // is closed on framing errors.
            return Err(IecError::ProtocolError(format!(
                "Invalid start character: {:02X}",
                src[0]
            )));
        }
        let length = src[1] as usize;
        if !(MIN_APCI_LENGTH..=MAX_APDU_LENGTH).contains(&length) {
            return Err(IecError::ProtocolError(format!(
                "Invalid APDU length: {length}"
            )));
        }
        if src.len() < length + 2 {
            src.reserve(length + 2 - src.len());
            return Ok(None);
        }

        let frame = src.split_to(length + 2);
        if let Some(tap) = &self.raw_tap {
            tap(crate::common::Direction::Received, &frame);
        }
        let control = [frame[2], frame[3], frame[4], frame[5]];
        let apci = Apci::decode_control(control)?;

        let asdu = match apci {
            Apci::IFrame { .. } => {
                if length == MIN_APCI_LENGTH {
                    return Err(IecError::ProtocolError(
                        "I-frame without ASDU".to_string(),
                    ));
                }
                let raw = &frame[6..];
                Some(match Asdu::decode(raw, self.params) {
                    Ok(asdu) => AsduPayload::Typed(asdu),
                    Err(error) => AsduPayload::Raw {
                        bytes: raw.to_vec(),
                        error,
                    },
                })
            }
            _ => {
                if length != MIN_APCI_LENGTH {
                    return Err(IecError::ProtocolError(
                        "S/U frame with trailing octets".to_string(),
                    ));
                }
                None
            }
        };

        Ok(Some(Apdu { apci, asdu }))
    }
}

impl Encoder<Apdu> for Iec104Codec {
    type Error = IecError;

    fn encode(&mut self, apdu: Apdu, dst: &mut BytesMut) -> Result<(), IecError> {
        let asdu_bytes = match &apdu.asdu {
            Some(AsduPayload::Typed(asdu)) => Some(asdu.encode()?),
            Some(AsduPayload::Raw { bytes, .. }) => Some(bytes.clone()),
            None => None,
        };
        let body_len = asdu_bytes.as_ref().map_or(0, Vec::len);
        if MIN_APCI_LENGTH + body_len > MAX_APDU_LENGTH {
            return Err(IecError::InvalidArgument(format!(
                "ASDU of {body_len} octets exceeds the APDU limit"
            )));
        }

        dst.reserve(2 + MIN_APCI_LENGTH + body_len);
        let start = dst.len();
        dst.put_u8(START_BYTE);
        dst.put_u8((MIN_APCI_LENGTH + body_len) as u8);
        apdu.apci.encode_control(dst);
        if let Some(bytes) = asdu_bytes {
            dst.put_slice(&bytes);
        }
        if let Some(tap) = &self.raw_tap {
            tap(crate::common::Direction::Sent, &dst[start..]);
        }
        Ok(())
    }
}
