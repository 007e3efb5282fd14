/// IEC60870 Constants and Common Data Types
use std::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// IEC60870 protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IecProtocolVersion {
    /// IEC 60870-5-101
    Iec101,
    /// IEC 60870-5-104
    Iec104,
}

impl fmt::Display for IecProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IecProtocolVersion::Iec101 => write!(f, "IEC 60870-5-101"),
            IecProtocolVersion::Iec104 => write!(f, "IEC 60870-5-104"),
        }
    }
}

/// IEC60870 Error Types
#[derive(Error, Debug)]
pub enum IecError {
    /// Error in connection
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// ASDU decoding failed
    #[error("ASDU error: {0}")]
    AsduError(#[from] AsduDecodeError),

    /// Link layer error (CS101)
    #[error("Link error: {0}")]
    LinkError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serial port error
    #[error("Serial port error: {0}")]
    SerialError(#[from] tokio_serial::Error),

    /// Client not connected
    #[error("Not connected")]
    NotConnected,

    /// Data transfer not started
    #[error("Data transfer not started")]
    DataTransferNotStarted,

    /// Outbound queue is full
    #[error("Outbound queue full")]
    QueueFull,

    /// Invalid argument on a public call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Common protocol result type
pub type Result<T> = std::result::Result<T, IecError>;

/// Failure modes of the ASDU decoder
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsduDecodeError {
    /// Not enough octets for the ASDU header
    #[error("frame too short for ASDU header")]
    ShortFrame,

    /// Type identification is not supported
    #[error("unknown type identification {0}")]
    UnknownType(u8),

    /// Variable structure qualifier is inconsistent with the frame
    #[error("invalid variable structure qualifier 0x{0:02X}")]
    InvalidVsq(u8),

    /// An information object extends past the end of the frame
    #[error("information object truncated")]
    TruncatedObject,

    /// A field carries a reserved value
    #[error("reserved field value")]
    ReservedField,
}

/// Quality Descriptor Flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QualityDescriptor {
    /// Overflow: the value exceeds the measuring range
    pub overflow: bool,
    /// Blocked: the value is blocked for transmission by a local lock
    pub blocked: bool,
    /// Substituted: the value has been provided by the operator
    pub substituted: bool,
    /// Not topical: the value is outdated
    pub not_topical: bool,
    /// Invalid: the value is invalid
    pub invalid: bool,
}

impl QualityDescriptor {
    /// Create a new quality descriptor with all flags cleared (good quality)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a quality descriptor from a byte
    pub fn from_byte(value: u8) -> Self {
        Self {
            overflow: (value & 0x01) != 0,
            blocked: (value & 0x10) != 0,
            substituted: (value & 0x20) != 0,
            not_topical: (value & 0x40) != 0,
            invalid: (value & 0x80) != 0,
        }
    }

    /// Convert quality descriptor to a byte
    pub fn to_byte(&self) -> u8 {
        let mut value = 0u8;
        if self.overflow {
            value |= 0x01;
        }
        if self.blocked {
            value |= 0x10;
        }
        if self.substituted {
            value |= 0x20;
        }
        if self.not_topical {
            value |= 0x40;
        }
        if self.invalid {
            value |= 0x80;
        }
        value
    }

    /// True when no quality flag is raised
    pub fn is_good(&self) -> bool {
        *self == Self::default()
    }
}

/// Cause of Transmission (COT)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CauseOfTransmission {
    /// Periodic, cyclic
    Periodic = 1,
    /// Background scan
    Background = 2,
    /// Spontaneous
    Spontaneous = 3,
    /// Initialized
    Initialized = 4,
    /// Request or requested
    Request = 5,
    /// Activation
    Activation = 6,
    /// Activation confirmation
    ActivationConfirmation = 7,
    /// Deactivation
    Deactivation = 8,
    /// Deactivation confirmation
    DeactivationConfirmation = 9,
    /// Activation termination
    ActivationTermination = 10,
    /// Return information caused by a remote command
    RemoteCommand = 11,
    /// Return information caused by a local command
    LocalCommand = 12,
    /// File transfer
    FileTransfer = 13,
    /// Interrogated by station interrogation
    StationInterrogation = 20,
    /// Interrogated by group 1 interrogation
    Group1Interrogation = 21,
    /// Interrogated by group 2 interrogation
    Group2Interrogation = 22,
    /// Interrogated by group 3 interrogation
    Group3Interrogation = 23,
    /// Interrogated by group 4 interrogation
    Group4Interrogation = 24,
    /// Interrogated by group 5 interrogation
    Group5Interrogation = 25,
    /// Interrogated by group 6 interrogation
    Group6Interrogation = 26,
    /// Interrogated by group 7 interrogation
    Group7Interrogation = 27,
    /// Interrogated by group 8 interrogation
    Group8Interrogation = 28,
    /// Interrogated by group 9 interrogation
    Group9Interrogation = 29,
    /// Interrogated by group 10 interrogation
    Group10Interrogation = 30,
    /// Interrogated by group 11 interrogation
    Group11Interrogation = 31,
    /// Interrogated by group 12 interrogation
    Group12Interrogation = 32,
    /// Interrogated by group 13 interrogation
    Group13Interrogation = 33,
    /// Interrogated by group 14 interrogation
    Group14Interrogation = 34,
    /// Interrogated by group 15 interrogation
    Group15Interrogation = 35,
    /// Interrogated by group 16 interrogation
    Group16Interrogation = 36,
    /// Requested by general counter request
    GeneralCounterRequest = 37,
    /// Requested by group 1 counter request
    Group1CounterRequest = 38,
    /// Requested by group 2 counter request
    Group2CounterRequest = 39,
    /// Requested by group 3 counter request
    Group3CounterRequest = 40,
    /// Requested by group 4 counter request
    Group4CounterRequest = 41,
    /// Unknown type identification
    UnknownTypeIdentification = 44,
    /// Unknown cause of transmission
    UnknownCauseOfTransmission = 45,
    /// Unknown common address of ASDU
    UnknownCommonAddress = 46,
    /// Unknown information object address
    UnknownInfoObjAddress = 47,
}

impl CauseOfTransmission {
    /// Create a COT from the 6-bit cause value
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Periodic),
            2 => Some(Self::Background),
            3 => Some(Self::Spontaneous),
            4 => Some(Self::Initialized),
            5 => Some(Self::Request),
            6 => Some(Self::Activation),
            7 => Some(Self::ActivationConfirmation),
            8 => Some(Self::Deactivation),
            9 => Some(Self::DeactivationConfirmation),
            10 => Some(Self::ActivationTermination),
            11 => Some(Self::RemoteCommand),
            12 => Some(Self::LocalCommand),
            13 => Some(Self::FileTransfer),
            20 => Some(Self::StationInterrogation),
            21 => Some(Self::Group1Interrogation),
            22 => Some(Self::Group2Interrogation),
            23 => Some(Self::Group3Interrogation),
            24 => Some(Self::Group4Interrogation),
            25 => Some(Self::Group5Interrogation),
            26 => Some(Self::Group6Interrogation),
            27 => Some(Self::Group7Interrogation),
            28 => Some(Self::Group8Interrogation),
            29 => Some(Self::Group9Interrogation),
            30 => Some(Self::Group10Interrogation),
            31 => Some(Self::Group11Interrogation),
            32 => Some(Self::Group12Interrogation),
            33 => Some(Self::Group13Interrogation),
            34 => Some(Self::Group14Interrogation),
            35 => Some(Self::Group15Interrogation),
            36 => Some(Self::Group16Interrogation),
            37 => Some(Self::GeneralCounterRequest),
            38 => Some(Self::Group1CounterRequest),
            39 => Some(Self::Group2CounterRequest),
            40 => Some(Self::Group3CounterRequest),
            41 => Some(Self::Group4CounterRequest),
            44 => Some(Self::UnknownTypeIdentification),
            45 => Some(Self::UnknownCauseOfTransmission),
            46 => Some(Self::UnknownCommonAddress),
            47 => Some(Self::UnknownInfoObjAddress),
            _ => None,
        }
    }

    /// Convert COT to the 6-bit cause value
    pub fn to_byte(&self) -> u8 {
        *self as u8
    }

    /// The COT the station interrogation responses carry for a given QOI
    /// (QOI 20 = station, 21..36 = groups 1..16)
    pub fn interrogated_by(qoi: u8) -> Option<Self> {
        Self::from_byte(qoi)
    }
}

/// Why a connection was closed or declared broken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream
    RemoteClosed,
    /// Local stop() request
    LocalStop,
    /// t1 elapsed without acknowledgment
    T1Expired,
    /// Received N(S) did not match the expected receive counter
    SequenceError,
    /// Received N(R) outside the outstanding window
    AckOutOfWindow,
    /// Bad start octet, length or checksum
    FramingError,
    /// I-frame received while data transfer was stopped
    IFrameWhileStopped,
    /// Unsolicited or duplicated U-frame confirmation
    UnexpectedConfirmation,
    /// Stream level I/O failure
    IoError,
    /// A bounded internal queue overflowed
    ResourceExhausted,
    /// CS101 retry budget exhausted
    LinkBroken,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::RemoteClosed => write!(f, "closed by peer"),
            CloseReason::LocalStop => write!(f, "local stop"),
            CloseReason::T1Expired => write!(f, "t1 expired"),
            CloseReason::SequenceError => write!(f, "sequence error"),
            CloseReason::AckOutOfWindow => write!(f, "ack outside window"),
            CloseReason::FramingError => write!(f, "framing error"),
            CloseReason::IFrameWhileStopped => write!(f, "I-frame while stopped"),
            CloseReason::UnexpectedConfirmation => write!(f, "unexpected confirmation"),
            CloseReason::IoError => write!(f, "io error"),
            CloseReason::ResourceExhausted => write!(f, "resource exhausted"),
            CloseReason::LinkBroken => write!(f, "link broken"),
        }
    }
}

/// Events reported through the connection event surface
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Transport established (CS104: TCP accepted/connected, CS101: link reset done)
    Opened,
    /// Data transfer activated (STARTDT confirmed / link available)
    Activated,
    /// Data transfer deactivated (STOPDT confirmed)
    Deactivated,
    /// Connection closed with the tagged reason
    Closed(CloseReason),
    /// A content error was answered negatively but the connection stays open
    NegativeConfirm {
        /// Mirror cause sent back to the peer
        cause: CauseOfTransmission,
    },
    /// TESTFR act answered (liveness probe from the peer)
    TestFrameReceived,
}

/// Direction of a raw message passed to the raw-message hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frame received from the peer
    Received,
    /// Frame sent to the peer
    Sent,
}
