/// ASDU - Application Service Data Unit Implementation
use bytes::{BufMut, BytesMut};

use crate::codec::{max_ioa, put_ioa, Reader};
use crate::common::{AsduDecodeError, CauseOfTransmission, IecError, Result};
use crate::information_objects::InformationObject;
use crate::params::{AppLayerParameters, CommonAddrSize, CotSize};

/// Type Identification (TI) for ASDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeId {
    /// Single-point information (M_SP_NA_1)
    SinglePoint = 1,
    /// Single-point information with CP24 time tag (M_SP_TA_1)
    SinglePointWithCp24 = 2,
    /// Double-point information (M_DP_NA_1)
    DoublePoint = 3,
    /// Double-point information with CP24 time tag (M_DP_TA_1)
    DoublePointWithCp24 = 4,
    /// Step position information (M_ST_NA_1)
    StepPosition = 5,
    /// Step position information with CP24 time tag (M_ST_TA_1)
    StepPositionWithCp24 = 6,
    /// Bitstring of 32 bits (M_BO_NA_1)
    Bitstring32 = 7,
    /// Bitstring of 32 bits with CP24 time tag (M_BO_TA_1)
    Bitstring32WithCp24 = 8,
    /// Measured value, normalized (M_ME_NA_1)
    MeasuredValueNormalized = 9,
    /// Measured value, normalized with CP24 time tag (M_ME_TA_1)
    MeasuredValueNormalizedWithCp24 = 10,
    /// Measured value, scaled (M_ME_NB_1)
    MeasuredValueScaled = 11,
    /// Measured value, scaled with CP24 time tag (M_ME_TB_1)
    MeasuredValueScaledWithCp24 = 12,
    /// Measured value, short float (M_ME_NC_1)
    MeasuredValueFloat = 13,
    /// Measured value, short float with CP24 time tag (M_ME_TC_1)
    MeasuredValueFloatWithCp24 = 14,
    /// Integrated totals (M_IT_NA_1)
    IntegratedTotals = 15,
    /// Integrated totals with CP24 time tag (M_IT_TA_1)
    IntegratedTotalsWithCp24 = 16,
    /// Measured value, normalized without quality (M_ME_ND_1)
    MeasuredValueNormalizedNoQuality = 21,
    /// Single-point information with CP56 time tag (M_SP_TB_1)
    SinglePointWithCp56 = 30,
    /// Double-point information with CP56 time tag (M_DP_TB_1)
    DoublePointWithCp56 = 31,
    /// Step position information with CP56 time tag (M_ST_TB_1)
    StepPositionWithCp56 = 32,
    /// Bitstring of 32 bits with CP56 time tag (M_BO_TB_1)
    Bitstring32WithCp56 = 33,
    /// Measured value, normalized with CP56 time tag (M_ME_TD_1)
    MeasuredValueNormalizedWithCp56 = 34,
    /// Measured value, scaled with CP56 time tag (M_ME_TE_1)
    MeasuredValueScaledWithCp56 = 35,
    /// Measured value, short float with CP56 time tag (M_ME_TF_1)
    MeasuredValueFloatWithCp56 = 36,
    /// Integrated totals with CP56 time tag (M_IT_TB_1)
    IntegratedTotalsWithCp56 = 37,
    /// Single command (C_SC_NA_1)
    SingleCommand = 45,
    /// Double command (C_DC_NA_1)
    DoubleCommand = 46,
    /// Regulating step command (C_RC_NA_1)
    RegulatingStepCommand = 47,
    /// Set-point command, normalized (C_SE_NA_1)
    SetpointCommandNormalized = 48,
    /// Set-point command, scaled (C_SE_NB_1)
    SetpointCommandScaled = 49,
    /// Set-point command, short float (C_SE_NC_1)
    SetpointCommandFloat = 50,
    /// Bitstring of 32 bits command (C_BO_NA_1)
    Bitstring32Command = 51,
    /// Single command with CP56 time tag (C_SC_TA_1)
    SingleCommandWithCp56 = 58,
    /// Double command with CP56 time tag (C_DC_TA_1)
    DoubleCommandWithCp56 = 59,
    /// Regulating step command with CP56 time tag (C_RC_TA_1)
    RegulatingStepCommandWithCp56 = 60,
    /// Set-point command, normalized with CP56 time tag (C_SE_TA_1)
    SetpointCommandNormalizedWithCp56 = 61,
    /// Set-point command, scaled with CP56 time tag (C_SE_TB_1)
    SetpointCommandScaledWithCp56 = 62,
    /// Set-point command, short float with CP56 time tag (C_SE_TC_1)
    SetpointCommandFloatWithCp56 = 63,
    /// Bitstring of 32 bits command with CP56 time tag (C_BO_TA_1)
    Bitstring32CommandWithCp56 = 64,
    /// End of initialization (M_EI_NA_1)
    EndOfInitialization = 70,
    /// Interrogation command (C_IC_NA_1)
    InterrogationCommand = 100,
    /// Counter interrogation command (C_CI_NA_1)
    CounterInterrogationCommand = 101,
    /// Read command (C_RD_NA_1)
    ReadCommand = 102,
    /// Clock synchronization command (C_CS_NA_1)
    ClockSyncCommand = 103,
    /// Test command (C_TS_NA_1)
    TestCommand = 104,
    /// Reset process command (C_RP_NA_1)
    ResetProcessCommand = 105,
    /// Delay acquisition command (C_CD_NA_1)
    DelayAcquisitionCommand = 106,
    /// Test command with CP56 time tag (C_TS_TA_1)
    TestCommandWithCp56 = 107,
    /// Parameter of measured value, normalized (P_ME_NA_1)
    ParameterNormalized = 110,
    /// Parameter of measured value, scaled (P_ME_NB_1)
    ParameterScaled = 111,
    /// Parameter of measured value, short float (P_ME_NC_1)
    ParameterFloat = 112,
    /// Parameter activation (P_AC_NA_1)
    ParameterActivation = 113,
    /// File ready (F_FR_NA_1)
    FileReady = 120,
    /// Section ready (F_SR_NA_1)
    SectionReady = 121,
    /// Call directory, select file, call file, call section (F_SC_NA_1)
    CallDirectory = 122,
    /// Last section, last segment (F_LS_NA_1)
    LastSection = 123,
    /// ACK file, ACK section (F_AF_NA_1)
    AckFile = 124,
    /// Segment (F_SG_NA_1)
    Segment = 125,
    /// Directory (F_DR_TA_1)
    Directory = 126,
    /// Query log, request archive file (F_SC_NB_1)
    QueryLog = 127,
}

impl TypeId {
    /// Create TypeId from a byte
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::SinglePoint),
            2 => Some(Self::SinglePointWithCp24),
            3 => Some(Self::DoublePoint),
            4 => Some(Self::DoublePointWithCp24),
            5 => Some(Self::StepPosition),
            6 => Some(Self::StepPositionWithCp24),
            7 => Some(Self::Bitstring32),
            8 => Some(Self::Bitstring32WithCp24),
            9 => Some(Self::MeasuredValueNormalized),
            10 => Some(Self::MeasuredValueNormalizedWithCp24),
            11 => Some(Self::MeasuredValueScaled),
            12 => Some(Self::MeasuredValueScaledWithCp24),
            13 => Some(Self::MeasuredValueFloat),
            14 => Some(Self::MeasuredValueFloatWithCp24),
            15 => Some(Self::IntegratedTotals),
            16 => Some(Self::IntegratedTotalsWithCp24),
            21 => Some(Self::MeasuredValueNormalizedNoQuality),
            30 => Some(Self::SinglePointWithCp56),
            31 => Some(Self::DoublePointWithCp56),
            32 => Some(Self::StepPositionWithCp56),
            33 => Some(Self::Bitstring32WithCp56),
            34 => Some(Self::MeasuredValueNormalizedWithCp56),
            35 => Some(Self::MeasuredValueScaledWithCp56),
            36 => Some(Self::MeasuredValueFloatWithCp56),
            37 => Some(Self::IntegratedTotalsWithCp56),
            45 => Some(Self::SingleCommand),
            46 => Some(Self::DoubleCommand),
            47 => Some(Self::RegulatingStepCommand),
            48 => Some(Self::SetpointCommandNormalized),
            49 => Some(Self::SetpointCommandScaled),
            50 => Some(Self::SetpointCommandFloat),
            51 => Some(Self::Bitstring32Command),
            58 => Some(Self::SingleCommandWithCp56),
            59 => Some(Self::DoubleCommandWithCp56),
            60 => Some(Self::RegulatingStepCommandWithCp56),
            61 => Some(Self::SetpointCommandNormalizedWithCp56),
            62 => Some(Self::SetpointCommandScaledWithCp56),
            63 => Some(Self::SetpointCommandFloatWithCp56),
            64 => Some(Self::Bitstring32CommandWithCp56),
            70 => Some(Self::EndOfInitialization),
            100 => Some(Self::InterrogationCommand),
            101 => Some(Self::CounterInterrogationCommand),
            102 => Some(Self::ReadCommand),
            103 => Some(Self::ClockSyncCommand),
            104 => Some(Self::TestCommand),
            105 => Some(Self::ResetProcessCommand),
            106 => Some(Self::DelayAcquisitionCommand),
            107 => Some(Self::TestCommandWithCp56),
            110 => Some(Self::ParameterNormalized),
            111 => Some(Self::ParameterScaled),
            112 => Some(Self::ParameterFloat),
            113 => Some(Self::ParameterActivation),
            120 => Some(Self::FileReady),
            121 => Some(Self::SectionReady),
            122 => Some(Self::CallDirectory),
            123 => Some(Self::LastSection),
            124 => Some(Self::AckFile),
            125 => Some(Self::Segment),
            126 => Some(Self::Directory),
            127 => Some(Self::QueryLog),
            _ => None,
        }
    }

    /// Convert TypeId to a byte
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Fixed payload size in octets (without IOA); `None` for the
    /// variable-length file segment
    pub fn payload_size(self) -> Option<usize> {
        Some(match self {
            Self::SinglePoint | Self::DoublePoint => 1,
            Self::SinglePointWithCp24 | Self::DoublePointWithCp24 => 4,
            Self::SinglePointWithCp56 | Self::DoublePointWithCp56 => 8,
            Self::StepPosition | Self::MeasuredValueNormalizedNoQuality => 2,
            Self::StepPositionWithCp24 => 5,
            Self::StepPositionWithCp56 => 9,
            Self::Bitstring32 => 5,
            Self::Bitstring32WithCp24 => 8,
            Self::Bitstring32WithCp56 => 12,
            Self::MeasuredValueNormalized | Self::MeasuredValueScaled => 3,
            Self::MeasuredValueNormalizedWithCp24 | Self::MeasuredValueScaledWithCp24 => 6,
            Self::MeasuredValueNormalizedWithCp56 | Self::MeasuredValueScaledWithCp56 => 10,
            Self::MeasuredValueFloat | Self::IntegratedTotals => 5,
            Self::MeasuredValueFloatWithCp24 | Self::IntegratedTotalsWithCp24 => 8,
            Self::MeasuredValueFloatWithCp56 | Self::IntegratedTotalsWithCp56 => 12,
            Self::SingleCommand | Self::DoubleCommand | Self::RegulatingStepCommand => 1,
            Self::SetpointCommandNormalized | Self::SetpointCommandScaled => 3,
            Self::SetpointCommandFloat => 5,
            Self::Bitstring32Command => 4,
            Self::SingleCommandWithCp56
            | Self::DoubleCommandWithCp56
            | Self::RegulatingStepCommandWithCp56 => 8,
            Self::SetpointCommandNormalizedWithCp56 | Self::SetpointCommandScaledWithCp56 => 10,
            Self::SetpointCommandFloatWithCp56 => 12,
            Self::Bitstring32CommandWithCp56 => 11,
            Self::EndOfInitialization => 1,
            Self::InterrogationCommand | Self::CounterInterrogationCommand => 1,
            Self::ReadCommand => 0,
            Self::ClockSyncCommand => 7,
            Self::TestCommand => 2,
            Self::ResetProcessCommand => 1,
            Self::DelayAcquisitionCommand => 2,
            Self::TestCommandWithCp56 => 9,
            Self::ParameterNormalized | Self::ParameterScaled => 3,
            Self::ParameterFloat => 5,
            Self::ParameterActivation => 1,
            Self::FileReady => 6,
            Self::SectionReady => 7,
            Self::CallDirectory => 4,
            Self::LastSection => 5,
            Self::AckFile => 4,
            Self::Segment => return None,
            Self::Directory => 13,
            Self::QueryLog => 16,
        })
    }

    /// Check if this type ID is in the monitor direction
    pub fn is_monitor(self) -> bool {
        let val = self as u8;
        (1..=40).contains(&val) || val == 70
    }

    /// Check if this type ID is for a command
    pub fn is_command(self) -> bool {
        let val = self as u8;
        (45..=69).contains(&val) || (100..=109).contains(&val)
    }

    /// Check if this type ID is for a parameter
    pub fn is_parameter(self) -> bool {
        let val = self as u8;
        (110..=119).contains(&val)
    }

    /// Check if this type ID is for a file transfer
    pub fn is_file_transfer(self) -> bool {
        let val = self as u8;
        (120..=127).contains(&val)
    }

    /// Only fixed-size monitor information may be packed as an SQ=1 sequence
    pub fn supports_sequence(self) -> bool {
        self.is_monitor() && self != Self::EndOfInitialization
    }
}

/// Cause of transmission field: 6-bit cause plus T (test) and P/N flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cot {
    /// The 6-bit cause
    pub cause: CauseOfTransmission,
    /// Test flag
    pub test: bool,
    /// Negative confirmation flag (P/N)
    pub negative: bool,
}

impl Cot {
    /// Positive, non-test cause
    pub fn new(cause: CauseOfTransmission) -> Self {
        Self {
            cause,
            test: false,
            negative: false,
        }
    }

    /// Negative confirmation of the given cause
    pub fn negative(cause: CauseOfTransmission) -> Self {
        Self {
            cause,
            test: false,
            negative: true,
        }
    }

    pub(crate) fn from_byte(octet: u8) -> std::result::Result<Self, AsduDecodeError> {
        let cause =
            CauseOfTransmission::from_byte(octet & 0x3F).ok_or(AsduDecodeError::ReservedField)?;
        Ok(Self {
            cause,
            test: (octet & 0x80) != 0,
            negative: (octet & 0x40) != 0,
        })
    }

    pub(crate) fn to_byte(self) -> u8 {
        self.cause.to_byte()
            | if self.negative { 0x40 } else { 0 }
            | if self.test { 0x80 } else { 0 }
    }
}

/// ASDU octets as carried by a link or transport frame
///
/// Content errors must be answered without tearing the connection down, so
/// octets that fail application-layer decoding are kept raw together with
/// the decode error; mirror responses patch the cause octet in place.
#[derive(Debug, Clone, PartialEq)]
pub enum AsduPayload {
    /// Fully decoded application payload
    Typed(Asdu),
    /// Octets that failed application-layer decoding
    Raw {
        bytes: Vec<u8>,
        error: AsduDecodeError,
    },
}

/// Patch the cause octet of a raw ASDU so unknown content can be answered
/// with the mirror cause (the test flag is preserved)
pub(crate) fn patch_raw_cause(bytes: &mut [u8], cause: CauseOfTransmission, negative: bool) {
    if bytes.len() > 2 {
        let test = bytes[2] & 0x80;
        bytes[2] = cause.to_byte() | if negative { 0x40 } else { 0 } | test;
    }
}

/// ASDU Structure
///
/// Carries the active parameter set so every append can be checked against
/// `max_asdu_size` immediately; an ASDU that was accepted never fails to
/// encode into a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Asdu {
    params: AppLayerParameters,
    type_id: TypeId,
    sequence: bool,
    cot: Cot,
    originator: u8,
    common_address: u16,
    objects: Vec<InformationObject>,
    encoded_size: usize,
}

impl Asdu {
    /// Create an empty ASDU with individually addressed objects (SQ=0)
    pub fn new(
        params: AppLayerParameters,
        type_id: TypeId,
        cot: Cot,
        common_address: u16,
    ) -> Self {
        Self {
            params,
            type_id,
            sequence: false,
            cot,
            originator: 0,
            common_address,
            objects: Vec::new(),
            encoded_size: params.header_size(),
        }
    }

    /// Create an empty SQ=1 ASDU: objects share the base address of the
    /// first object and must be appended with contiguous addresses
    pub fn new_sequence(
        params: AppLayerParameters,
        type_id: TypeId,
        cot: Cot,
        common_address: u16,
    ) -> Self {
        Self {
            sequence: true,
            ..Self::new(params, type_id, cot, common_address)
        }
    }

    /// Set the originator address (encoded only when COT is two octets)
    pub fn with_originator(mut self, originator: u8) -> Self {
        self.originator = originator;
        self
    }

    /// Append an information object, accounting its encoded size against
    /// `max_asdu_size`
    pub fn add_object(&mut self, object: InformationObject) -> Result<()> {
        if object.type_id() != self.type_id {
            return Err(IecError::InvalidArgument(format!(
                "object type {:?} does not match ASDU type {:?}",
                object.type_id(),
                self.type_id
            )));
        }
        if self.objects.len() >= 127 {
            return Err(IecError::InvalidArgument(
                "ASDU holds at most 127 objects".to_string(),
            ));
        }
        if self.sequence {
            if !self.type_id.supports_sequence() {
                return Err(IecError::InvalidArgument(format!(
                    "type {:?} may not be packed as a sequence",
                    self.type_id
                )));
            }
            if let Some(first) = self.objects.first() {
                let expected = first.address() + self.objects.len() as u32;
                if object.address() != expected {
                    return Err(IecError::InvalidArgument(format!(
                        "sequence address must be {}, got {}",
                        expected,
                        object.address()
                    )));
                }
            }
        }
        if object.address() > max_ioa(self.params.ioa_size) {
            return Err(IecError::InvalidArgument(format!(
                "IOA {} does not fit the configured address size",
                object.address()
            )));
        }

        // SQ=1 writes the IOA once, for the first object only
        let ioa_cost = if self.sequence && !self.objects.is_empty() {
            0
        } else {
            self.params.ioa_size as usize
        };
        let added = ioa_cost + object.payload_size();
        if self.encoded_size + added > self.params.max_asdu_size {
            return Err(IecError::InvalidArgument(format!(
                "ASDU would exceed max_asdu_size: {} + {} > {}",
                self.encoded_size, added, self.params.max_asdu_size
            )));
        }

        self.encoded_size += added;
        self.objects.push(object);
        Ok(())
    }

    /// Type identification
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// SQ bit: objects are packed as a sequence sharing the base address
    pub fn is_sequence(&self) -> bool {
        self.sequence
    }

    /// Cause of transmission with flags
    pub fn cot(&self) -> Cot {
        self.cot
    }

    /// The 6-bit cause
    pub fn cause(&self) -> CauseOfTransmission {
        self.cot.cause
    }

    /// Originator address
    pub fn originator(&self) -> u8 {
        self.originator
    }

    /// Common address of the ASDU
    pub fn common_address(&self) -> u16 {
        self.common_address
    }

    /// The decoded or appended information objects
    pub fn objects(&self) -> &[InformationObject] {
        &self.objects
    }

    /// Active application layer parameters
    pub fn parameters(&self) -> AppLayerParameters {
        self.params
    }

    /// Current encoded size in octets
    pub fn encoded_size(&self) -> usize {
        self.encoded_size
    }

    /// Copy of this ASDU with a replaced cause; confirmations and
    /// terminations mirror the request this way
    pub fn with_cause(&self, cause: CauseOfTransmission, negative: bool) -> Asdu {
        let mut copy = self.clone();
        copy.cot = Cot {
            cause,
            test: self.cot.test,
            negative,
        };
        copy
    }

    /// Encode the ASDU using its parameter set
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.objects.is_empty() || self.objects.len() > 127 {
            return Err(IecError::InvalidArgument(format!(
                "ASDU must carry 1..=127 objects, has {}",
                self.objects.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_size);
        buf.put_u8(self.type_id.to_byte());
        let vsq = (self.objects.len() as u8) | if self.sequence { 0x80 } else { 0 };
        buf.put_u8(vsq);
        buf.put_u8(self.cot.to_byte());
        if self.params.cot_size == CotSize::TwoOctets {
            buf.put_u8(self.originator);
        }
        match self.params.ca_size {
            CommonAddrSize::OneOctet => buf.put_u8(self.common_address as u8),
            CommonAddrSize::TwoOctets => buf.put_u16_le(self.common_address),
        }

        for (i, object) in self.objects.iter().enumerate() {
            if !self.sequence || i == 0 {
                put_ioa(&mut buf, object.address(), self.params.ioa_size);
            }
            object.encode_payload(&mut buf);
        }

        Ok(buf.to_vec())
    }

    /// Decode an ASDU using the active parameter set
    pub fn decode(
        data: &[u8],
        params: AppLayerParameters,
    ) -> std::result::Result<Self, AsduDecodeError> {
        if data.len() < params.header_size() {
            return Err(AsduDecodeError::ShortFrame);
        }
        let mut r = Reader::new(data);

        let type_byte = r.read_u8().map_err(|_| AsduDecodeError::ShortFrame)?;
        let type_id = TypeId::from_byte(type_byte).ok_or(AsduDecodeError::UnknownType(type_byte))?;
        let vsq = r.read_u8().map_err(|_| AsduDecodeError::ShortFrame)?;
        let count = (vsq & 0x7F) as usize;
        let sequence = (vsq & 0x80) != 0;
        if count == 0 {
            return Err(AsduDecodeError::InvalidVsq(vsq));
        }
        if sequence && !type_id.supports_sequence() {
            return Err(AsduDecodeError::InvalidVsq(vsq));
        }
        let cot = Cot::from_byte(r.read_u8().map_err(|_| AsduDecodeError::ShortFrame)?)?;
        let originator = if params.cot_size == CotSize::TwoOctets {
            r.read_u8().map_err(|_| AsduDecodeError::ShortFrame)?
        } else {
            0
        };
        let common_address = match params.ca_size {
            CommonAddrSize::OneOctet => {
                r.read_u8().map_err(|_| AsduDecodeError::ShortFrame)? as u16
            }
            CommonAddrSize::TwoOctets => {
                r.read_u16_le().map_err(|_| AsduDecodeError::ShortFrame)?
            }
        };

        // Refuse counts that cannot fit the remaining octets before decoding
        if let Some(payload) = type_id.payload_size() {
            let per_object = payload + if sequence { 0 } else { params.ioa_size as usize };
            let base = if sequence { params.ioa_size as usize } else { 0 };
            let needed = base + count * per_object;
            if needed > r.remaining() {
                return Err(AsduDecodeError::TruncatedObject);
            }
            if needed < r.remaining() {
                return Err(AsduDecodeError::InvalidVsq(vsq));
            }
        } else if sequence || count != 1 {
            // variable-length segments are always addressed individually
            return Err(AsduDecodeError::InvalidVsq(vsq));
        }

        let mut objects = Vec::with_capacity(count);
        let mut encoded_size = params.header_size();
        if sequence {
            let base = r.read_ioa(params.ioa_size)?;
            encoded_size += params.ioa_size as usize;
            for i in 0..count {
                let object =
                    InformationObject::decode_payload(type_id, base + i as u32, &mut r)?;
                encoded_size += object.payload_size();
                objects.push(object);
            }
        } else {
            for _ in 0..count {
                let address = r.read_ioa(params.ioa_size)?;
                let object = InformationObject::decode_payload(type_id, address, &mut r)?;
                encoded_size += params.ioa_size as usize + object.payload_size();
                objects.push(object);
            }
        }

        if r.remaining() != 0 {
            return Err(AsduDecodeError::InvalidVsq(vsq));
        }

        Ok(Self {
            params,
            type_id,
            sequence,
            cot,
            originator,
            common_address,
            objects,
            encoded_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::QualityDescriptor;
    use crate::information_objects::InformationObject;
    use crate::params::InfoObjAddrSize;
    use crate::time::Cp56Time2a;
    use pretty_assertions::assert_eq;

    fn params() -> AppLayerParameters {
        AppLayerParameters::default()
    }

    fn single_point(address: u32, value: bool) -> InformationObject {
        InformationObject::SinglePoint {
            address,
            value,
            quality: QualityDescriptor::default(),
        }
    }

    #[test]
    fn spontaneous_single_point_with_cp56_vector() {
        // TypeID 30, SQ=0, N=1, COT=3, CA=1, IOA=100, SIQ=0x01,
        // time 2024-01-01T00:00:00.000Z
        let mut asdu = Asdu::new(
            params(),
            TypeId::SinglePointWithCp56,
            Cot::new(CauseOfTransmission::Spontaneous),
            1,
        );
        asdu.add_object(InformationObject::SinglePointWithCp56 {
            address: 100,
            value: true,
            quality: QualityDescriptor::default(),
            timestamp: Cp56Time2a {
                day_of_month: 1,
                month: 1,
                year: 24,
                ..Default::default()
            },
        })
        .unwrap();

        let encoded = asdu.encode().unwrap();
        assert_eq!(
            encoded,
            vec![
                0x1E, 0x01, 0x03, 0x00, 0x01, 0x00, // header
                0x64, 0x00, 0x00, // IOA = 100
                0x01, // SIQ
                0x00, 0x00, 0x00, 0x00, 0x01, 0x01, 0x18, // CP56
            ]
        );

        let decoded = Asdu::decode(&encoded, params()).unwrap();
        assert_eq!(decoded, asdu);
    }

    #[test]
    fn round_trip_all_parameter_sets() {
        let object = InformationObject::MeasuredValueScaled {
            address: 10,
            value: -42,
            quality: QualityDescriptor::default(),
        };
        for cot_size in [CotSize::OneOctet, CotSize::TwoOctets] {
            for ca_size in [CommonAddrSize::OneOctet, CommonAddrSize::TwoOctets] {
                for ioa_size in [
                    InfoObjAddrSize::OneOctet,
                    InfoObjAddrSize::TwoOctets,
                    InfoObjAddrSize::ThreeOctets,
                ] {
                    let p = AppLayerParameters {
                        cot_size,
                        ca_size,
                        ioa_size,
                        ..Default::default()
                    };
                    let mut asdu = Asdu::new(
                        p,
                        TypeId::MeasuredValueScaled,
                        Cot::new(CauseOfTransmission::Periodic),
                        3,
                    )
                    .with_originator(7);
                    asdu.add_object(object.clone()).unwrap();
                    let encoded = asdu.encode().unwrap();
                    assert_eq!(encoded.len(), asdu.encoded_size());
                    let decoded = Asdu::decode(&encoded, p).unwrap();
                    assert_eq!(decoded, asdu);
                }
            }
        }
    }

    #[test]
    fn sequence_packs_single_base_address() {
        let mut seq = Asdu::new_sequence(
            params(),
            TypeId::SinglePoint,
            Cot::new(CauseOfTransmission::StationInterrogation),
            1,
        );
        for i in 0..4 {
            seq.add_object(single_point(100 + i, i % 2 == 0)).unwrap();
        }
        let encoded = seq.encode().unwrap();
        // header + one IOA + 4 payload octets
        assert_eq!(encoded.len(), 6 + 3 + 4);
        assert_eq!(encoded[1], 0x84); // SQ=1, N=4

        let decoded = Asdu::decode(&encoded, params()).unwrap();
        let addresses: Vec<u32> = decoded.objects().iter().map(|o| o.address()).collect();
        assert_eq!(addresses, vec![100, 101, 102, 103]);
    }

    #[test]
    fn sequence_equivalent_to_individual_addressing() {
        let mut seq = Asdu::new_sequence(
            params(),
            TypeId::SinglePoint,
            Cot::new(CauseOfTransmission::Spontaneous),
            1,
        );
        let mut individual = Asdu::new(
            params(),
            TypeId::SinglePoint,
            Cot::new(CauseOfTransmission::Spontaneous),
            1,
        );
        for i in 0..5 {
            seq.add_object(single_point(200 + i, true)).unwrap();
            individual.add_object(single_point(200 + i, true)).unwrap();
        }
        let from_seq = Asdu::decode(&seq.encode().unwrap(), params()).unwrap();
        let from_individual = Asdu::decode(&individual.encode().unwrap(), params()).unwrap();
        assert_eq!(from_seq.objects(), from_individual.objects());
    }

    #[test]
    fn sequence_rejects_gap_and_wrong_type() {
        let mut seq = Asdu::new_sequence(
            params(),
            TypeId::SinglePoint,
            Cot::new(CauseOfTransmission::Spontaneous),
            1,
        );
        seq.add_object(single_point(100, true)).unwrap();
        assert!(seq.add_object(single_point(102, true)).is_err());
        assert!(seq
            .add_object(InformationObject::MeasuredValueScaled {
                address: 101,
                value: 0,
                quality: QualityDescriptor::default(),
            })
            .is_err());
    }

    #[test]
    fn oversize_asdu_rejected_at_append() {
        let p = AppLayerParameters {
            max_asdu_size: 20,
            ..Default::default()
        };
        let mut asdu = Asdu::new(
            p,
            TypeId::MeasuredValueFloat,
            Cot::new(CauseOfTransmission::Spontaneous),
            1,
        );
        // header 6 + 8 per object: second object would need 22 octets
        asdu.add_object(InformationObject::MeasuredValueFloat {
            address: 1,
            value: 0.0,
            quality: QualityDescriptor::default(),
        })
        .unwrap();
        let err = asdu.add_object(InformationObject::MeasuredValueFloat {
            address: 2,
            value: 0.0,
            quality: QualityDescriptor::default(),
        });
        assert!(matches!(err, Err(IecError::InvalidArgument(_))));
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        // short header
        assert_eq!(
            Asdu::decode(&[0x01, 0x01, 0x03], params()),
            Err(AsduDecodeError::ShortFrame)
        );
        // unknown type 200
        assert_eq!(
            Asdu::decode(&[200, 0x01, 0x03, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01], params()),
            Err(AsduDecodeError::UnknownType(200))
        );
        // zero count
        assert_eq!(
            Asdu::decode(&[0x01, 0x00, 0x03, 0x00, 0x01, 0x00], params()),
            Err(AsduDecodeError::InvalidVsq(0x00))
        );
        // count requires more octets than remain
        assert_eq!(
            Asdu::decode(
                &[0x01, 0x02, 0x03, 0x00, 0x01, 0x00, 0x64, 0x00, 0x00, 0x01],
                params()
            ),
            Err(AsduDecodeError::TruncatedObject)
        );
        // reserved cause 0
        assert_eq!(
            Asdu::decode(
                &[0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x64, 0x00, 0x00, 0x01],
                params()
            ),
            Err(AsduDecodeError::ReservedField)
        );
        // sequence flag on a command type
        assert_eq!(
            Asdu::decode(
                &[0x2D, 0x81, 0x06, 0x00, 0x01, 0x00, 0x64, 0x00, 0x00, 0x01],
                params()
            ),
            Err(AsduDecodeError::InvalidVsq(0x81))
        );
    }

    #[test]
    fn patched_mirror_sets_negative_cause() {
        let mut bytes = vec![200, 0x01, 0x06, 0x00, 0x01, 0x00, 0x64, 0x00, 0x00, 0x01];
        patch_raw_cause(
            &mut bytes,
            CauseOfTransmission::UnknownTypeIdentification,
            true,
        );
        assert_eq!(bytes[2], 44 | 0x40);
    }

    #[test]
    fn negative_confirmation_mirrors_request() {
        let mut request = Asdu::new(
            params(),
            TypeId::InterrogationCommand,
            Cot::new(CauseOfTransmission::Activation),
            1,
        );
        request
            .add_object(InformationObject::Interrogation {
                address: 0,
                qualifier: 20,
            })
            .unwrap();

        let confirm = request.with_cause(CauseOfTransmission::ActivationConfirmation, true);
        assert!(confirm.cot().negative);
        assert_eq!(confirm.objects(), request.objects());

        let encoded = confirm.encode().unwrap();
        // P/N bit set in the COT octet
        assert_eq!(encoded[2], 0x47);
    }
}
