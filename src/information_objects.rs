//! Typed information objects
//!
//! Every information object is a value type identified by the ASDU TypeID.
//! Each type declares a fixed on-wire payload size (the file segment is the
//! one variable-length exception) and encodes/decodes its payload without the
//! leading information object address; the ASDU container owns the address
//! layout so SQ=1 sequences can share a base address.

use bytes::{BufMut, BytesMut};

use crate::asdu::TypeId;
use crate::codec::{normalized_from_raw, normalized_to_raw, put_u24_le, Reader};
use crate::common::{AsduDecodeError, QualityDescriptor};
use crate::time::{Cp16Time2a, Cp24Time2a, Cp56Time2a};

/// Double-point information states (DPI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoublePointValue {
    /// Intermediate or indeterminate (00)
    Intermediate,
    /// Determined OFF (01)
    Off,
    /// Determined ON (10)
    On,
    /// Indeterminate (11)
    Indeterminate,
}

impl DoublePointValue {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Intermediate,
            1 => Self::Off,
            2 => Self::On,
            _ => Self::Indeterminate,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Self::Intermediate => 0,
            Self::Off => 1,
            Self::On => 2,
            Self::Indeterminate => 3,
        }
    }
}

/// Regulating step command states (RCS); 00 and 11 are reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepCommandValue {
    /// Next step lower (01)
    Lower,
    /// Next step higher (10)
    Higher,
}

impl StepCommandValue {
    pub fn from_bits(bits: u8) -> Result<Self, AsduDecodeError> {
        match bits & 0x03 {
            1 => Ok(Self::Lower),
            2 => Ok(Self::Higher),
            _ => Err(AsduDecodeError::ReservedField),
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            Self::Lower => 1,
            Self::Higher => 2,
        }
    }
}

/// Binary counter reading (BCR), 5 octets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinaryCounterReading {
    /// Counter value
    pub value: i32,
    /// Sequence notation (0..31)
    pub sequence: u8,
    /// Carry flag
    pub carry: bool,
    /// Counter was adjusted since the last reading
    pub adjusted: bool,
    /// Invalid flag
    pub invalid: bool,
}

impl BinaryCounterReading {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.value);
        let mut status = self.sequence & 0x1F;
        if self.carry {
            status |= 0x20;
        }
        if self.adjusted {
            status |= 0x40;
        }
        if self.invalid {
            status |= 0x80;
        }
        buf.put_u8(status);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, AsduDecodeError> {
        let value = r.read_i32_le()?;
        let status = r.read_u8()?;
        Ok(Self {
            value,
            sequence: status & 0x1F,
            carry: (status & 0x20) != 0,
            adjusted: (status & 0x40) != 0,
            invalid: (status & 0x80) != 0,
        })
    }
}

/// Fixed test bit pattern of C_TS_NA_1
const TEST_PATTERN: u16 = 0x55AA;

// VTI: 7-bit two's complement transient-state value
fn encode_vti(value: i8, transient: bool) -> u8 {
    ((value as u8) & 0x7F) | if transient { 0x80 } else { 0 }
}

fn decode_vti(octet: u8) -> (i8, bool) {
    let raw = octet & 0x7F;
    let value = if raw & 0x40 != 0 {
        (raw | 0x80) as i8
    } else {
        raw as i8
    };
    (value, (octet & 0x80) != 0)
}

// SIQ/DIQ carry the quality bits in the upper nibble next to the state bits
fn encode_siq(value: bool, quality: QualityDescriptor) -> u8 {
    (quality.to_byte() & 0xF0) | u8::from(value)
}

fn decode_siq(octet: u8) -> (bool, QualityDescriptor) {
    ((octet & 0x01) != 0, QualityDescriptor::from_byte(octet & 0xF0))
}

fn encode_diq(value: DoublePointValue, quality: QualityDescriptor) -> u8 {
    (quality.to_byte() & 0xF0) | value.to_bits()
}

fn decode_diq(octet: u8) -> (DoublePointValue, QualityDescriptor) {
    (
        DoublePointValue::from_bits(octet),
        QualityDescriptor::from_byte(octet & 0xF0),
    )
}

// Command qualifier octet: bit0/1 state, bits 2..6 QU, bit 7 select
fn encode_command(bits: u8, qualifier: u8, select: bool) -> u8 {
    bits | ((qualifier & 0x1F) << 2) | if select { 0x80 } else { 0 }
}

/// A single typed information object
///
/// Monitor-direction objects carry a value plus quality (and optionally a
/// time tag); control-direction objects carry the command payload. The
/// `address` field is the information object address (IOA).
#[derive(Debug, Clone, PartialEq)]
pub enum InformationObject {
    /// M_SP_NA_1
    SinglePoint {
        address: u32,
        value: bool,
        quality: QualityDescriptor,
    },
    /// M_SP_TA_1
    SinglePointWithCp24 {
        address: u32,
        value: bool,
        quality: QualityDescriptor,
        timestamp: Cp24Time2a,
    },
    /// M_SP_TB_1
    SinglePointWithCp56 {
        address: u32,
        value: bool,
        quality: QualityDescriptor,
        timestamp: Cp56Time2a,
    },
    /// M_DP_NA_1
    DoublePoint {
        address: u32,
        value: DoublePointValue,
        quality: QualityDescriptor,
    },
    /// M_DP_TA_1
    DoublePointWithCp24 {
        address: u32,
        value: DoublePointValue,
        quality: QualityDescriptor,
        timestamp: Cp24Time2a,
    },
    /// M_DP_TB_1
    DoublePointWithCp56 {
        address: u32,
        value: DoublePointValue,
        quality: QualityDescriptor,
        timestamp: Cp56Time2a,
    },
    /// M_ST_NA_1
    StepPosition {
        address: u32,
        value: i8,
        transient: bool,
        quality: QualityDescriptor,
    },
    /// M_ST_TA_1
    StepPositionWithCp24 {
        address: u32,
        value: i8,
        transient: bool,
        quality: QualityDescriptor,
        timestamp: Cp24Time2a,
    },
    /// M_ST_TB_1
    StepPositionWithCp56 {
        address: u32,
        value: i8,
        transient: bool,
        quality: QualityDescriptor,
        timestamp: Cp56Time2a,
    },
    /// M_BO_NA_1
    Bitstring32 {
        address: u32,
        value: u32,
        quality: QualityDescriptor,
    },
    /// M_BO_TA_1
    Bitstring32WithCp24 {
        address: u32,
        value: u32,
        quality: QualityDescriptor,
        timestamp: Cp24Time2a,
    },
    /// M_BO_TB_1
    Bitstring32WithCp56 {
        address: u32,
        value: u32,
        quality: QualityDescriptor,
        timestamp: Cp56Time2a,
    },
    /// M_ME_NA_1 (normalized value, fraction in [-1, 1))
    MeasuredValueNormalized {
        address: u32,
        value: f32,
        quality: QualityDescriptor,
    },
    /// M_ME_TA_1
    MeasuredValueNormalizedWithCp24 {
        address: u32,
        value: f32,
        quality: QualityDescriptor,
        timestamp: Cp24Time2a,
    },
    /// M_ME_TD_1
    MeasuredValueNormalizedWithCp56 {
        address: u32,
        value: f32,
        quality: QualityDescriptor,
        timestamp: Cp56Time2a,
    },
    /// M_ME_ND_1 (normalized value without quality descriptor)
    MeasuredValueNormalizedNoQuality { address: u32, value: f32 },
    /// M_ME_NB_1
    MeasuredValueScaled {
        address: u32,
        value: i16,
        quality: QualityDescriptor,
    },
    /// M_ME_TB_1
    MeasuredValueScaledWithCp24 {
        address: u32,
        value: i16,
        quality: QualityDescriptor,
        timestamp: Cp24Time2a,
    },
    /// M_ME_TE_1
    MeasuredValueScaledWithCp56 {
        address: u32,
        value: i16,
        quality: QualityDescriptor,
        timestamp: Cp56Time2a,
    },
    /// M_ME_NC_1
    MeasuredValueFloat {
        address: u32,
        value: f32,
        quality: QualityDescriptor,
    },
    /// M_ME_TC_1
    MeasuredValueFloatWithCp24 {
        address: u32,
        value: f32,
        quality: QualityDescriptor,
        timestamp: Cp24Time2a,
    },
    /// M_ME_TF_1
    MeasuredValueFloatWithCp56 {
        address: u32,
        value: f32,
        quality: QualityDescriptor,
        timestamp: Cp56Time2a,
    },
    /// M_IT_NA_1
    IntegratedTotals {
        address: u32,
        value: BinaryCounterReading,
    },
    /// M_IT_TA_1
    IntegratedTotalsWithCp24 {
        address: u32,
        value: BinaryCounterReading,
        timestamp: Cp24Time2a,
    },
    /// M_IT_TB_1
    IntegratedTotalsWithCp56 {
        address: u32,
        value: BinaryCounterReading,
        timestamp: Cp56Time2a,
    },
    /// C_SC_NA_1
    SingleCommand {
        address: u32,
        state: bool,
        select: bool,
        qualifier: u8,
    },
    /// C_SC_TA_1
    SingleCommandWithCp56 {
        address: u32,
        state: bool,
        select: bool,
        qualifier: u8,
        timestamp: Cp56Time2a,
    },
    /// C_DC_NA_1
    DoubleCommand {
        address: u32,
        state: DoublePointValue,
        select: bool,
        qualifier: u8,
    },
    /// C_DC_TA_1
    DoubleCommandWithCp56 {
        address: u32,
        state: DoublePointValue,
        select: bool,
        qualifier: u8,
        timestamp: Cp56Time2a,
    },
    /// C_RC_NA_1
    RegulatingStepCommand {
        address: u32,
        step: StepCommandValue,
        select: bool,
        qualifier: u8,
    },
    /// C_RC_TA_1
    RegulatingStepCommandWithCp56 {
        address: u32,
        step: StepCommandValue,
        select: bool,
        qualifier: u8,
        timestamp: Cp56Time2a,
    },
    /// C_SE_NA_1
    SetpointCommandNormalized {
        address: u32,
        value: f32,
        select: bool,
        qualifier: u8,
    },
    /// C_SE_TA_1
    SetpointCommandNormalizedWithCp56 {
        address: u32,
        value: f32,
        select: bool,
        qualifier: u8,
        timestamp: Cp56Time2a,
    },
    /// C_SE_NB_1
    SetpointCommandScaled {
        address: u32,
        value: i16,
        select: bool,
        qualifier: u8,
    },
    /// C_SE_TB_1
    SetpointCommandScaledWithCp56 {
        address: u32,
        value: i16,
        select: bool,
        qualifier: u8,
        timestamp: Cp56Time2a,
    },
    /// C_SE_NC_1
    SetpointCommandFloat {
        address: u32,
        value: f32,
        select: bool,
        qualifier: u8,
    },
    /// C_SE_TC_1
    SetpointCommandFloatWithCp56 {
        address: u32,
        value: f32,
        select: bool,
        qualifier: u8,
        timestamp: Cp56Time2a,
    },
    /// C_BO_NA_1
    Bitstring32Command { address: u32, value: u32 },
    /// C_BO_TA_1
    Bitstring32CommandWithCp56 {
        address: u32,
        value: u32,
        timestamp: Cp56Time2a,
    },
    /// M_EI_NA_1 (COI: cause of initialization)
    EndOfInitialization {
        address: u32,
        cause: u8,
        local_change: bool,
    },
    /// C_IC_NA_1 (QOI: 20 = station, 21..36 = groups 1..16)
    Interrogation { address: u32, qualifier: u8 },
    /// C_CI_NA_1 (QCC)
    CounterInterrogation { address: u32, qualifier: u8 },
    /// C_RD_NA_1
    Read { address: u32 },
    /// C_CS_NA_1
    ClockSync {
        address: u32,
        timestamp: Cp56Time2a,
    },
    /// C_TS_NA_1 (fixed bit pattern 0x55AA)
    TestCommand { address: u32 },
    /// C_RP_NA_1 (QRP)
    ResetProcess { address: u32, qualifier: u8 },
    /// C_CD_NA_1
    DelayAcquisition { address: u32, delay: Cp16Time2a },
    /// C_TS_TA_1 (TSC test sequence counter)
    TestCommandWithCp56 {
        address: u32,
        counter: u16,
        timestamp: Cp56Time2a,
    },
    /// P_ME_NA_1 (QPM)
    ParameterNormalized {
        address: u32,
        value: f32,
        qualifier: u8,
    },
    /// P_ME_NB_1
    ParameterScaled {
        address: u32,
        value: i16,
        qualifier: u8,
    },
    /// P_ME_NC_1
    ParameterFloat {
        address: u32,
        value: f32,
        qualifier: u8,
    },
    /// P_AC_NA_1 (QPA)
    ParameterActivation { address: u32, qualifier: u8 },
    /// F_FR_NA_1 (NOF, LOF, FRQ)
    FileReady {
        address: u32,
        file_name: u16,
        length: u32,
        qualifier: u8,
    },
    /// F_SR_NA_1
    SectionReady {
        address: u32,
        file_name: u16,
        section: u8,
        length: u32,
        qualifier: u8,
    },
    /// F_SC_NA_1 (SCQ: call directory / select file / call file / call section)
    CallDirectory {
        address: u32,
        file_name: u16,
        section: u8,
        qualifier: u8,
    },
    /// F_LS_NA_1 (LSQ + section checksum)
    LastSection {
        address: u32,
        file_name: u16,
        section: u8,
        qualifier: u8,
        checksum: u8,
    },
    /// F_AF_NA_1 (AFQ)
    AckFile {
        address: u32,
        file_name: u16,
        section: u8,
        qualifier: u8,
    },
    /// F_SG_NA_1 (variable-length segment, LOS-prefixed)
    Segment {
        address: u32,
        file_name: u16,
        section: u8,
        data: Vec<u8>,
    },
    /// F_DR_TA_1 (SOF directory entry status)
    Directory {
        address: u32,
        file_name: u16,
        length: u32,
        status: u8,
        timestamp: Cp56Time2a,
    },
    /// F_SC_NB_1 (query log over a time range)
    QueryLog {
        address: u32,
        file_name: u16,
        start: Cp56Time2a,
        stop: Cp56Time2a,
    },
}

impl InformationObject {
    /// Type identification this object encodes as
    pub fn type_id(&self) -> TypeId {
        use InformationObject::*;
        match self {
            SinglePoint { .. } => TypeId::SinglePoint,
            SinglePointWithCp24 { .. } => TypeId::SinglePointWithCp24,
            SinglePointWithCp56 { .. } => TypeId::SinglePointWithCp56,
            DoublePoint { .. } => TypeId::DoublePoint,
            DoublePointWithCp24 { .. } => TypeId::DoublePointWithCp24,
            DoublePointWithCp56 { .. } => TypeId::DoublePointWithCp56,
            StepPosition { .. } => TypeId::StepPosition,
            StepPositionWithCp24 { .. } => TypeId::StepPositionWithCp24,
            StepPositionWithCp56 { .. } => TypeId::StepPositionWithCp56,
            Bitstring32 { .. } => TypeId::Bitstring32,
            Bitstring32WithCp24 { .. } => TypeId::Bitstring32WithCp24,
            Bitstring32WithCp56 { .. } => TypeId::Bitstring32WithCp56,
            MeasuredValueNormalized { .. } => TypeId::MeasuredValueNormalized,
            MeasuredValueNormalizedWithCp24 { .. } => TypeId::MeasuredValueNormalizedWithCp24,
            MeasuredValueNormalizedWithCp56 { .. } => TypeId::MeasuredValueNormalizedWithCp56,
            MeasuredValueNormalizedNoQuality { .. } => TypeId::MeasuredValueNormalizedNoQuality,
            MeasuredValueScaled { .. } => TypeId::MeasuredValueScaled,
            MeasuredValueScaledWithCp24 { .. } => TypeId::MeasuredValueScaledWithCp24,
            MeasuredValueScaledWithCp56 { .. } => TypeId::MeasuredValueScaledWithCp56,
            MeasuredValueFloat { .. } => TypeId::MeasuredValueFloat,
            MeasuredValueFloatWithCp24 { .. } => TypeId::MeasuredValueFloatWithCp24,
            MeasuredValueFloatWithCp56 { .. } => TypeId::MeasuredValueFloatWithCp56,
            IntegratedTotals { .. } => TypeId::IntegratedTotals,
            IntegratedTotalsWithCp24 { .. } => TypeId::IntegratedTotalsWithCp24,
            IntegratedTotalsWithCp56 { .. } => TypeId::IntegratedTotalsWithCp56,
            SingleCommand { .. } => TypeId::SingleCommand,
            SingleCommandWithCp56 { .. } => TypeId::SingleCommandWithCp56,
            DoubleCommand { .. } => TypeId::DoubleCommand,
            DoubleCommandWithCp56 { .. } => TypeId::DoubleCommandWithCp56,
            RegulatingStepCommand { .. } => TypeId::RegulatingStepCommand,
            RegulatingStepCommandWithCp56 { .. } => TypeId::RegulatingStepCommandWithCp56,
            SetpointCommandNormalized { .. } => TypeId::SetpointCommandNormalized,
            SetpointCommandNormalizedWithCp56 { .. } => TypeId::SetpointCommandNormalizedWithCp56,
            SetpointCommandScaled { .. } => TypeId::SetpointCommandScaled,
            SetpointCommandScaledWithCp56 { .. } => TypeId::SetpointCommandScaledWithCp56,
            SetpointCommandFloat { .. } => TypeId::SetpointCommandFloat,
            SetpointCommandFloatWithCp56 { .. } => TypeId::SetpointCommandFloatWithCp56,
            Bitstring32Command { .. } => TypeId::Bitstring32Command,
            Bitstring32CommandWithCp56 { .. } => TypeId::Bitstring32CommandWithCp56,
            EndOfInitialization { .. } => TypeId::EndOfInitialization,
            Interrogation { .. } => TypeId::InterrogationCommand,
            CounterInterrogation { .. } => TypeId::CounterInterrogationCommand,
            Read { .. } => TypeId::ReadCommand,
            ClockSync { .. } => TypeId::ClockSyncCommand,
            TestCommand { .. } => TypeId::TestCommand,
            ResetProcess { .. } => TypeId::ResetProcessCommand,
            DelayAcquisition { .. } => TypeId::DelayAcquisitionCommand,
            TestCommandWithCp56 { .. } => TypeId::TestCommandWithCp56,
            ParameterNormalized { .. } => TypeId::ParameterNormalized,
            ParameterScaled { .. } => TypeId::ParameterScaled,
            ParameterFloat { .. } => TypeId::ParameterFloat,
            ParameterActivation { .. } => TypeId::ParameterActivation,
            FileReady { .. } => TypeId::FileReady,
            SectionReady { .. } => TypeId::SectionReady,
            CallDirectory { .. } => TypeId::CallDirectory,
            LastSection { .. } => TypeId::LastSection,
            AckFile { .. } => TypeId::AckFile,
            Segment { .. } => TypeId::Segment,
            Directory { .. } => TypeId::Directory,
            QueryLog { .. } => TypeId::QueryLog,
        }
    }

    /// Information object address
    pub fn address(&self) -> u32 {
        use InformationObject::*;
        match self {
            SinglePoint { address, .. }
            | SinglePointWithCp24 { address, .. }
            | SinglePointWithCp56 { address, .. }
            | DoublePoint { address, .. }
            | DoublePointWithCp24 { address, .. }
            | DoublePointWithCp56 { address, .. }
            | StepPosition { address, .. }
            | StepPositionWithCp24 { address, .. }
            | StepPositionWithCp56 { address, .. }
            | Bitstring32 { address, .. }
            | Bitstring32WithCp24 { address, .. }
            | Bitstring32WithCp56 { address, .. }
            | MeasuredValueNormalized { address, .. }
            | MeasuredValueNormalizedWithCp24 { address, .. }
            | MeasuredValueNormalizedWithCp56 { address, .. }
            | MeasuredValueNormalizedNoQuality { address, .. }
            | MeasuredValueScaled { address, .. }
            | MeasuredValueScaledWithCp24 { address, .. }
            | MeasuredValueScaledWithCp56 { address, .. }
            | MeasuredValueFloat { address, .. }
            | MeasuredValueFloatWithCp24 { address, .. }
            | MeasuredValueFloatWithCp56 { address, .. }
            | IntegratedTotals { address, .. }
            | IntegratedTotalsWithCp24 { address, .. }
            | IntegratedTotalsWithCp56 { address, .. }
            | SingleCommand { address, .. }
            | SingleCommandWithCp56 { address, .. }
            | DoubleCommand { address, .. }
            | DoubleCommandWithCp56 { address, .. }
            | RegulatingStepCommand { address, .. }
            | RegulatingStepCommandWithCp56 { address, .. }
            | SetpointCommandNormalized { address, .. }
            | SetpointCommandNormalizedWithCp56 { address, .. }
            | SetpointCommandScaled { address, .. }
            | SetpointCommandScaledWithCp56 { address, .. }
            | SetpointCommandFloat { address, .. }
            | SetpointCommandFloatWithCp56 { address, .. }
            | Bitstring32Command { address, .. }
            | Bitstring32CommandWithCp56 { address, .. }
            | EndOfInitialization { address, .. }
            | Interrogation { address, .. }
            | CounterInterrogation { address, .. }
            | Read { address }
            | ClockSync { address, .. }
            | TestCommand { address }
            | ResetProcess { address, .. }
            | DelayAcquisition { address, .. }
            | TestCommandWithCp56 { address, .. }
            | ParameterNormalized { address, .. }
            | ParameterScaled { address, .. }
            | ParameterFloat { address, .. }
            | ParameterActivation { address, .. }
            | FileReady { address, .. }
            | SectionReady { address, .. }
            | CallDirectory { address, .. }
            | LastSection { address, .. }
            | AckFile { address, .. }
            | Segment { address, .. }
            | Directory { address, .. }
            | QueryLog { address, .. } => *address,
        }
    }

    /// Encoded payload size (without the IOA)
    pub fn payload_size(&self) -> usize {
        match self {
            InformationObject::Segment { data, .. } => 4 + data.len(),
            other => other
                .type_id()
                .payload_size()
                .expect("only Segment is variable-sized"),
        }
    }

    /// Encode the payload (everything after the IOA)
    pub(crate) fn encode_payload(&self, buf: &mut BytesMut) {
        use InformationObject::*;
        match self {
            SinglePoint { value, quality, .. } => buf.put_u8(encode_siq(*value, *quality)),
            SinglePointWithCp24 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_u8(encode_siq(*value, *quality));
                timestamp.encode(buf);
            }
            SinglePointWithCp56 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_u8(encode_siq(*value, *quality));
                timestamp.encode(buf);
            }
            DoublePoint { value, quality, .. } => buf.put_u8(encode_diq(*value, *quality)),
            DoublePointWithCp24 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_u8(encode_diq(*value, *quality));
                timestamp.encode(buf);
            }
            DoublePointWithCp56 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_u8(encode_diq(*value, *quality));
                timestamp.encode(buf);
            }
            StepPosition {
                value,
                transient,
                quality,
                ..
            } => {
                buf.put_u8(encode_vti(*value, *transient));
                buf.put_u8(quality.to_byte());
            }
            StepPositionWithCp24 {
                value,
                transient,
                quality,
                timestamp,
                ..
            } => {
                buf.put_u8(encode_vti(*value, *transient));
                buf.put_u8(quality.to_byte());
                timestamp.encode(buf);
            }
            StepPositionWithCp56 {
                value,
                transient,
                quality,
                timestamp,
                ..
            } => {
                buf.put_u8(encode_vti(*value, *transient));
                buf.put_u8(quality.to_byte());
                timestamp.encode(buf);
            }
            Bitstring32 { value, quality, .. } => {
                buf.put_u32_le(*value);
                buf.put_u8(quality.to_byte());
            }
            Bitstring32WithCp24 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_u32_le(*value);
                buf.put_u8(quality.to_byte());
                timestamp.encode(buf);
            }
            Bitstring32WithCp56 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_u32_le(*value);
                buf.put_u8(quality.to_byte());
                timestamp.encode(buf);
            }
            MeasuredValueNormalized { value, quality, .. } => {
                buf.put_i16_le(normalized_to_raw(*value));
                buf.put_u8(quality.to_byte());
            }
            MeasuredValueNormalizedWithCp24 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_i16_le(normalized_to_raw(*value));
                buf.put_u8(quality.to_byte());
                timestamp.encode(buf);
            }
            MeasuredValueNormalizedWithCp56 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_i16_le(normalized_to_raw(*value));
                buf.put_u8(quality.to_byte());
                timestamp.encode(buf);
            }
            MeasuredValueNormalizedNoQuality { value, .. } => {
                buf.put_i16_le(normalized_to_raw(*value));
            }
            MeasuredValueScaled { value, quality, .. } => {
                buf.put_i16_le(*value);
                buf.put_u8(quality.to_byte());
            }
            MeasuredValueScaledWithCp24 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_i16_le(*value);
                buf.put_u8(quality.to_byte());
                timestamp.encode(buf);
            }
            MeasuredValueScaledWithCp56 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_i16_le(*value);
                buf.put_u8(quality.to_byte());
                timestamp.encode(buf);
            }
            MeasuredValueFloat { value, quality, .. } => {
                buf.put_f32_le(*value);
                buf.put_u8(quality.to_byte());
            }
            MeasuredValueFloatWithCp24 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_f32_le(*value);
                buf.put_u8(quality.to_byte());
                timestamp.encode(buf);
            }
            MeasuredValueFloatWithCp56 {
                value,
                quality,
                timestamp,
                ..
            } => {
                buf.put_f32_le(*value);
                buf.put_u8(quality.to_byte());
                timestamp.encode(buf);
            }
            IntegratedTotals { value, .. } => value.encode(buf),
            IntegratedTotalsWithCp24 {
                value, timestamp, ..
            } => {
                value.encode(buf);
                timestamp.encode(buf);
            }
            IntegratedTotalsWithCp56 {
                value, timestamp, ..
            } => {
                value.encode(buf);
                timestamp.encode(buf);
            }
            SingleCommand {
                state,
                select,
                qualifier,
                ..
            } => buf.put_u8(encode_command(u8::from(*state), *qualifier, *select)),
            SingleCommandWithCp56 {
                state,
                select,
                qualifier,
                timestamp,
                ..
            } => {
                buf.put_u8(encode_command(u8::from(*state), *qualifier, *select));
                timestamp.encode(buf);
            }
            DoubleCommand {
                state,
                select,
                qualifier,
                ..
            } => buf.put_u8(encode_command(state.to_bits(), *qualifier, *select)),
            DoubleCommandWithCp56 {
                state,
                select,
                qualifier,
                timestamp,
                ..
            } => {
                buf.put_u8(encode_command(state.to_bits(), *qualifier, *select));
                timestamp.encode(buf);
            }
            RegulatingStepCommand {
                step,
                select,
                qualifier,
                ..
            } => buf.put_u8(encode_command(step.to_bits(), *qualifier, *select)),
            RegulatingStepCommandWithCp56 {
                step,
                select,
                qualifier,
                timestamp,
                ..
            } => {
                buf.put_u8(encode_command(step.to_bits(), *qualifier, *select));
                timestamp.encode(buf);
            }
            SetpointCommandNormalized {
                value,
                select,
                qualifier,
                ..
            } => {
                buf.put_i16_le(normalized_to_raw(*value));
                buf.put_u8((*qualifier & 0x7F) | if *select { 0x80 } else { 0 });
            }
            SetpointCommandNormalizedWithCp56 {
                value,
                select,
                qualifier,
                timestamp,
                ..
            } => {
                buf.put_i16_le(normalized_to_raw(*value));
                buf.put_u8((*qualifier & 0x7F) | if *select { 0x80 } else { 0 });
                timestamp.encode(buf);
            }
            SetpointCommandScaled {
                value,
                select,
                qualifier,
                ..
            } => {
                buf.put_i16_le(*value);
                buf.put_u8((*qualifier & 0x7F) | if *select { 0x80 } else { 0 });
            }
            SetpointCommandScaledWithCp56 {
                value,
                select,
                qualifier,
                timestamp,
                ..
            } => {
                buf.put_i16_le(*value);
                buf.put_u8((*qualifier & 0x7F) | if *select { 0x80 } else { 0 });
                timestamp.encode(buf);
            }
            SetpointCommandFloat {
                value,
                select,
                qualifier,
                ..
            } => {
                buf.put_f32_le(*value);
                buf.put_u8((*qualifier & 0x7F) | if *select { 0x80 } else { 0 });
            }
            SetpointCommandFloatWithCp56 {
                value,
                select,
                qualifier,
                timestamp,
                ..
            } => {
                buf.put_f32_le(*value);
                buf.put_u8((*qualifier & 0x7F) | if *select { 0x80 } else { 0 });
                timestamp.encode(buf);
            }
            Bitstring32Command { value, .. } => buf.put_u32_le(*value),
            Bitstring32CommandWithCp56 {
                value, timestamp, ..
            } => {
                buf.put_u32_le(*value);
                timestamp.encode(buf);
            }
            EndOfInitialization {
                cause,
                local_change,
                ..
            } => buf.put_u8((*cause & 0x7F) | if *local_change { 0x80 } else { 0 }),
            Interrogation { qualifier, .. } => buf.put_u8(*qualifier),
            CounterInterrogation { qualifier, .. } => buf.put_u8(*qualifier),
            Read { .. } => {}
            ClockSync { timestamp, .. } => timestamp.encode(buf),
            TestCommand { .. } => buf.put_u16_le(TEST_PATTERN),
            ResetProcess { qualifier, .. } => buf.put_u8(*qualifier),
            DelayAcquisition { delay, .. } => delay.encode(buf),
            TestCommandWithCp56 {
                counter, timestamp, ..
            } => {
                buf.put_u16_le(*counter);
                timestamp.encode(buf);
            }
            ParameterNormalized {
                value, qualifier, ..
            } => {
                buf.put_i16_le(normalized_to_raw(*value));
                buf.put_u8(*qualifier);
            }
            ParameterScaled {
                value, qualifier, ..
            } => {
                buf.put_i16_le(*value);
                buf.put_u8(*qualifier);
            }
            ParameterFloat {
                value, qualifier, ..
            } => {
                buf.put_f32_le(*value);
                buf.put_u8(*qualifier);
            }
            ParameterActivation { qualifier, .. } => buf.put_u8(*qualifier),
            FileReady {
                file_name,
                length,
                qualifier,
                ..
            } => {
                buf.put_u16_le(*file_name);
                put_u24_le(buf, *length);
                buf.put_u8(*qualifier);
            }
            SectionReady {
                file_name,
                section,
                length,
                qualifier,
                ..
            } => {
                buf.put_u16_le(*file_name);
                buf.put_u8(*section);
                put_u24_le(buf, *length);
                buf.put_u8(*qualifier);
            }
            CallDirectory {
                file_name,
                section,
                qualifier,
                ..
            } => {
                buf.put_u16_le(*file_name);
                buf.put_u8(*section);
                buf.put_u8(*qualifier);
            }
            LastSection {
                file_name,
                section,
                qualifier,
                checksum,
                ..
            } => {
                buf.put_u16_le(*file_name);
                buf.put_u8(*section);
                buf.put_u8(*qualifier);
                buf.put_u8(*checksum);
            }
            AckFile {
                file_name,
                section,
                qualifier,
                ..
            } => {
                buf.put_u16_le(*file_name);
                buf.put_u8(*section);
                buf.put_u8(*qualifier);
            }
            Segment {
                file_name,
                section,
                data,
                ..
            } => {
                buf.put_u16_le(*file_name);
                buf.put_u8(*section);
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
            }
            Directory {
                file_name,
                length,
                status,
                timestamp,
                ..
            } => {
                buf.put_u16_le(*file_name);
                put_u24_le(buf, *length);
                buf.put_u8(*status);
                timestamp.encode(buf);
            }
            QueryLog {
                file_name,
                start,
                stop,
                ..
            } => {
                buf.put_u16_le(*file_name);
                start.encode(buf);
                stop.encode(buf);
            }
        }
    }

    /// Decode the payload of `type_id` at the given address
    pub(crate) fn decode_payload(
        type_id: TypeId,
        address: u32,
        r: &mut Reader<'_>,
    ) -> Result<Self, AsduDecodeError> {
        use InformationObject::*;
        Ok(match type_id {
            TypeId::SinglePoint => {
                let (value, quality) = decode_siq(r.read_u8()?);
                SinglePoint {
                    address,
                    value,
                    quality,
                }
            }
            TypeId::SinglePointWithCp24 => {
                let (value, quality) = decode_siq(r.read_u8()?);
                SinglePointWithCp24 {
                    address,
                    value,
                    quality,
                    timestamp: Cp24Time2a::decode(r)?,
                }
            }
            TypeId::SinglePointWithCp56 => {
                let (value, quality) = decode_siq(r.read_u8()?);
                SinglePointWithCp56 {
                    address,
                    value,
                    quality,
                    timestamp: Cp56Time2a::decode(r)?,
                }
            }
            TypeId::DoublePoint => {
                let (value, quality) = decode_diq(r.read_u8()?);
                DoublePoint {
                    address,
                    value,
                    quality,
                }
            }
            TypeId::DoublePointWithCp24 => {
                let (value, quality) = decode_diq(r.read_u8()?);
                DoublePointWithCp24 {
                    address,
                    value,
                    quality,
                    timestamp: Cp24Time2a::decode(r)?,
                }
            }
            TypeId::DoublePointWithCp56 => {
                let (value, quality) = decode_diq(r.read_u8()?);
                DoublePointWithCp56 {
                    address,
                    value,
                    quality,
                    timestamp: Cp56Time2a::decode(r)?,
                }
            }
            TypeId::StepPosition => {
                let (value, transient) = decode_vti(r.read_u8()?);
                StepPosition {
                    address,
                    value,
                    transient,
                    quality: QualityDescriptor::from_byte(r.read_u8()?),
                }
            }
            TypeId::StepPositionWithCp24 => {
                let (value, transient) = decode_vti(r.read_u8()?);
                StepPositionWithCp24 {
                    address,
                    value,
                    transient,
                    quality: QualityDescriptor::from_byte(r.read_u8()?),
                    timestamp: Cp24Time2a::decode(r)?,
                }
            }
            TypeId::StepPositionWithCp56 => {
                let (value, transient) = decode_vti(r.read_u8()?);
                StepPositionWithCp56 {
                    address,
                    value,
                    transient,
                    quality: QualityDescriptor::from_byte(r.read_u8()?),
                    timestamp: Cp56Time2a::decode(r)?,
                }
            }
            TypeId::Bitstring32 => Bitstring32 {
                address,
                value: r.read_u32_le()?,
                quality: QualityDescriptor::from_byte(r.read_u8()?),
            },
            TypeId::Bitstring32WithCp24 => Bitstring32WithCp24 {
                address,
                value: r.read_u32_le()?,
                quality: QualityDescriptor::from_byte(r.read_u8()?),
                timestamp: Cp24Time2a::decode(r)?,
            },
            TypeId::Bitstring32WithCp56 => Bitstring32WithCp56 {
                address,
                value: r.read_u32_le()?,
                quality: QualityDescriptor::from_byte(r.read_u8()?),
                timestamp: Cp56Time2a::decode(r)?,
            },
            TypeId::MeasuredValueNormalized => MeasuredValueNormalized {
                address,
                value: normalized_from_raw(r.read_i16_le()?),
                quality: QualityDescriptor::from_byte(r.read_u8()?),
            },
            TypeId::MeasuredValueNormalizedWithCp24 => MeasuredValueNormalizedWithCp24 {
                address,
                value: normalized_from_raw(r.read_i16_le()?),
                quality: QualityDescriptor::from_byte(r.read_u8()?),
                timestamp: Cp24Time2a::decode(r)?,
            },
            TypeId::MeasuredValueNormalizedWithCp56 => MeasuredValueNormalizedWithCp56 {
                address,
                value: normalized_from_raw(r.read_i16_le()?),
                quality: QualityDescriptor::from_byte(r.read_u8()?),
                timestamp: Cp56Time2a::decode(r)?,
            },
            TypeId::MeasuredValueNormalizedNoQuality => MeasuredValueNormalizedNoQuality {
                address,
                value: normalized_from_raw(r.read_i16_le()?),
            },
            TypeId::MeasuredValueScaled => MeasuredValueScaled {
                address,
                value: r.read_i16_le()?,
                quality: QualityDescriptor::from_byte(r.read_u8()?),
            },
            TypeId::MeasuredValueScaledWithCp24 => MeasuredValueScaledWithCp24 {
                address,
                value: r.read_i16_le()?,
                quality: QualityDescriptor::from_byte(r.read_u8()?),
                timestamp: Cp24Time2a::decode(r)?,
            },
            TypeId::MeasuredValueScaledWithCp56 => MeasuredValueScaledWithCp56 {
                address,
                value: r.read_i16_le()?,
                quality: QualityDescriptor::from_byte(r.read_u8()?),
                timestamp: Cp56Time2a::decode(r)?,
            },
            TypeId::MeasuredValueFloat => MeasuredValueFloat {
                address,
                value: r.read_f32_le()?,
                quality: QualityDescriptor::from_byte(r.read_u8()?),
            },
            TypeId::MeasuredValueFloatWithCp24 => MeasuredValueFloatWithCp24 {
                address,
                value: r.read_f32_le()?,
                quality: QualityDescriptor::from_byte(r.read_u8()?),
                timestamp: Cp24Time2a::decode(r)?,
            },
            TypeId::MeasuredValueFloatWithCp56 => MeasuredValueFloatWithCp56 {
                address,
                value: r.read_f32_le()?,
                quality: QualityDescriptor::from_byte(r.read_u8()?),
                timestamp: Cp56Time2a::decode(r)?,
            },
            TypeId::IntegratedTotals => IntegratedTotals {
                address,
                value: BinaryCounterReading::decode(r)?,
            },
            TypeId::IntegratedTotalsWithCp24 => IntegratedTotalsWithCp24 {
                address,
                value: BinaryCounterReading::decode(r)?,
                timestamp: Cp24Time2a::decode(r)?,
            },
            TypeId::IntegratedTotalsWithCp56 => IntegratedTotalsWithCp56 {
                address,
                value: BinaryCounterReading::decode(r)?,
                timestamp: Cp56Time2a::decode(r)?,
            },
            TypeId::SingleCommand => {
                let octet = r.read_u8()?;
                SingleCommand {
                    address,
                    state: (octet & 0x01) != 0,
                    select: (octet & 0x80) != 0,
                    qualifier: (octet >> 2) & 0x1F,
                }
            }
            TypeId::SingleCommandWithCp56 => {
                let octet = r.read_u8()?;
                SingleCommandWithCp56 {
                    address,
                    state: (octet & 0x01) != 0,
                    select: (octet & 0x80) != 0,
                    qualifier: (octet >> 2) & 0x1F,
                    timestamp: Cp56Time2a::decode(r)?,
                }
            }
            TypeId::DoubleCommand => {
                let octet = r.read_u8()?;
                DoubleCommand {
                    address,
                    state: DoublePointValue::from_bits(octet),
                    select: (octet & 0x80) != 0,
                    qualifier: (octet >> 2) & 0x1F,
                }
            }
            TypeId::DoubleCommandWithCp56 => {
                let octet = r.read_u8()?;
                DoubleCommandWithCp56 {
                    address,
                    state: DoublePointValue::from_bits(octet),
                    select: (octet & 0x80) != 0,
                    qualifier: (octet >> 2) & 0x1F,
                    timestamp: Cp56Time2a::decode(r)?,
                }
            }
            TypeId::RegulatingStepCommand => {
                let octet = r.read_u8()?;
                RegulatingStepCommand {
                    address,
                    step: StepCommandValue::from_bits(octet)?,
                    select: (octet & 0x80) != 0,
                    qualifier: (octet >> 2) & 0x1F,
                }
            }
            TypeId::RegulatingStepCommandWithCp56 => {
                let octet = r.read_u8()?;
                RegulatingStepCommandWithCp56 {
                    address,
                    step: StepCommandValue::from_bits(octet)?,
                    select: (octet & 0x80) != 0,
                    qualifier: (octet >> 2) & 0x1F,
                    timestamp: Cp56Time2a::decode(r)?,
                }
            }
            TypeId::SetpointCommandNormalized => {
                let value = normalized_from_raw(r.read_i16_le()?);
                let qos = r.read_u8()?;
                SetpointCommandNormalized {
                    address,
                    value,
                    select: (qos & 0x80) != 0,
                    qualifier: qos & 0x7F,
                }
            }
            TypeId::SetpointCommandNormalizedWithCp56 => {
                let value = normalized_from_raw(r.read_i16_le()?);
                let qos = r.read_u8()?;
                SetpointCommandNormalizedWithCp56 {
                    address,
                    value,
                    select: (qos & 0x80) != 0,
                    qualifier: qos & 0x7F,
                    timestamp: Cp56Time2a::decode(r)?,
                }
            }
            TypeId::SetpointCommandScaled => {
                let value = r.read_i16_le()?;
                let qos = r.read_u8()?;
                SetpointCommandScaled {
                    address,
                    value,
                    select: (qos & 0x80) != 0,
                    qualifier: qos & 0x7F,
                }
            }
            TypeId::SetpointCommandScaledWithCp56 => {
                let value = r.read_i16_le()?;
                let qos = r.read_u8()?;
                SetpointCommandScaledWithCp56 {
                    address,
                    value,
                    select: (qos & 0x80) != 0,
                    qualifier: qos & 0x7F,
                    timestamp: Cp56Time2a::decode(r)?,
                }
            }
            TypeId::SetpointCommandFloat => {
                let value = r.read_f32_le()?;
                let qos = r.read_u8()?;
                SetpointCommandFloat {
                    address,
                    value,
                    select: (qos & 0x80) != 0,
                    qualifier: qos & 0x7F,
                }
            }
            TypeId::SetpointCommandFloatWithCp56 => {
                let value = r.read_f32_le()?;
                let qos = r.read_u8()?;
                SetpointCommandFloatWithCp56 {
                    address,
                    value,
                    select: (qos & 0x80) != 0,
                    qualifier: qos & 0x7F,
                    timestamp: Cp56Time2a::decode(r)?,
                }
            }
            TypeId::Bitstring32Command => Bitstring32Command {
                address,
                value: r.read_u32_le()?,
            },
            TypeId::Bitstring32CommandWithCp56 => Bitstring32CommandWithCp56 {
                address,
                value: r.read_u32_le()?,
                timestamp: Cp56Time2a::decode(r)?,
            },
            TypeId::EndOfInitialization => {
                let octet = r.read_u8()?;
                EndOfInitialization {
                    address,
                    cause: octet & 0x7F,
                    local_change: (octet & 0x80) != 0,
                }
            }
            TypeId::InterrogationCommand => Interrogation {
                address,
                qualifier: r.read_u8()?,
            },
            TypeId::CounterInterrogationCommand => CounterInterrogation {
                address,
                qualifier: r.read_u8()?,
            },
            TypeId::ReadCommand => Read { address },
            TypeId::ClockSyncCommand => ClockSync {
                address,
                timestamp: Cp56Time2a::decode(r)?,
            },
            TypeId::TestCommand => {
                if r.read_u16_le()? != TEST_PATTERN {
                    return Err(AsduDecodeError::ReservedField);
                }
                TestCommand { address }
            }
            TypeId::ResetProcessCommand => ResetProcess {
                address,
                qualifier: r.read_u8()?,
            },
            TypeId::DelayAcquisitionCommand => DelayAcquisition {
                address,
                delay: Cp16Time2a::decode(r)?,
            },
            TypeId::TestCommandWithCp56 => TestCommandWithCp56 {
                address,
                counter: r.read_u16_le()?,
                timestamp: Cp56Time2a::decode(r)?,
            },
            TypeId::ParameterNormalized => ParameterNormalized {
                address,
                value: normalized_from_raw(r.read_i16_le()?),
                qualifier: r.read_u8()?,
            },
            TypeId::ParameterScaled => ParameterScaled {
                address,
                value: r.read_i16_le()?,
                qualifier: r.read_u8()?,
            },
            TypeId::ParameterFloat => ParameterFloat {
                address,
                value: r.read_f32_le()?,
                qualifier: r.read_u8()?,
            },
            TypeId::ParameterActivation => ParameterActivation {
                address,
                qualifier: r.read_u8()?,
            },
            TypeId::FileReady => FileReady {
                address,
                file_name: r.read_u16_le()?,
                length: r.read_u24_le()?,
                qualifier: r.read_u8()?,
            },
            TypeId::SectionReady => SectionReady {
                address,
                file_name: r.read_u16_le()?,
                section: r.read_u8()?,
                length: r.read_u24_le()?,
                qualifier: r.read_u8()?,
            },
            TypeId::CallDirectory => CallDirectory {
                address,
                file_name: r.read_u16_le()?,
                section: r.read_u8()?,
                qualifier: r.read_u8()?,
            },
            TypeId::LastSection => LastSection {
                address,
                file_name: r.read_u16_le()?,
                section: r.read_u8()?,
                qualifier: r.read_u8()?,
                checksum: r.read_u8()?,
            },
            TypeId::AckFile => AckFile {
                address,
                file_name: r.read_u16_le()?,
                section: r.read_u8()?,
                qualifier: r.read_u8()?,
            },
            TypeId::Segment => {
                let file_name = r.read_u16_le()?;
                let section = r.read_u8()?;
                let length = r.read_u8()? as usize;
                Segment {
                    address,
                    file_name,
                    section,
                    data: r.read_bytes(length)?.to_vec(),
                }
            }
            TypeId::Directory => Directory {
                address,
                file_name: r.read_u16_le()?,
                length: r.read_u24_le()?,
                status: r.read_u8()?,
                timestamp: Cp56Time2a::decode(r)?,
            },
            TypeId::QueryLog => QueryLog {
                address,
                file_name: r.read_u16_le()?,
                start: Cp56Time2a::decode(r)?,
                stop: Cp56Time2a::decode(r)?,
            },
        })
    }
}
