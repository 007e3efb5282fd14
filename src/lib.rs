//! # voltage-iec60870
//!
//! A Rust implementation of the IEC 60870-5 telecontrol protocols for SCADA
//! communications.
//!
//! This crate provides the IEC 60870-5-101 (serial link) and IEC 60870-5-104
//! (TCP/IP) companion standards used to exchange monitoring and control
//! information between control-center masters and substation/RTU slaves.
//!
//! ## Features
//!
//! - Typed ASDU codec covering the monitoring, control, system, parameter
//!   and file transfer type identifications
//! - IEC 60870-5-104 client and server with the full windowed transport:
//!   k/w flow control, t0..t3 supervision, STARTDT/STOPDT/TESTFR
//! - IEC 60870-5-101 master and slave over FT1.2 framing with FCB/FCV
//!   retransmission detection, in unbalanced and balanced mode
//! - Server-side redundancy groups with a bounded spontaneous event buffer
//! - Asynchronous API using Tokio; sessions are generic over the byte
//!   stream, so TLS wrappers drop in transparently
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use voltage_iec60870::iec104::{Iec104Client, Iec104ClientConfig};
//! use voltage_iec60870::session::MasterEvent;
//!
//! #[tokio::main]
//! async fn main() -> voltage_iec60870::Result<()> {
//!     // Configure client
//!     let config = Iec104ClientConfig::new()
//!         .host("192.168.1.100")
//!         .port(2404)
//!         .build()?;
//!
//!     // Create client and subscribe to events
//!     let mut client = Iec104Client::new(config);
//!     let mut events = client.subscribe().expect("first subscriber");
//!
//!     // Connect and start data transfer
//!     client.connect().await?;
//!     client.start_dt().await?;
//!
//!     // Send a station interrogation (QOI 20)
//!     client.general_interrogation(1, 20).await?;
//!
//!     // Process received data
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             MasterEvent::Asdu(asdu) => println!("Received ASDU: {asdu:?}"),
//!             other => println!("Event: {other:?}"),
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod asdu;
pub mod codec;
pub mod common;
pub mod iec101;
pub mod iec104;
pub mod information_objects;
pub mod params;
pub mod session;
pub mod time;
pub mod transport;

// Re-export common types for convenience
pub use crate::asdu::{Asdu, AsduPayload, Cot, TypeId};
pub use crate::common::{
    AsduDecodeError, CauseOfTransmission, CloseReason, ConnectionEvent, Direction, IecError,
    IecProtocolVersion, QualityDescriptor, Result,
};
pub use crate::iec101::{Iec101Master, Iec101MasterConfig, Iec101Slave, Iec101SlaveConfig};
pub use crate::iec104::{
    DataTransferState, Iec104Client, Iec104ClientConfig, Iec104Server, Iec104ServerConfig,
    RedundancyMode,
};
pub use crate::information_objects::{
    BinaryCounterReading, DoublePointValue, InformationObject, StepCommandValue,
};
pub use crate::params::{
    ApciParameters, AppLayerParameters, CommonAddrSize, CotSize, InfoObjAddrSize, LinkAddrSize,
    LinkLayerParameters, LinkMode,
};
pub use crate::session::{MasterConnection, MasterEvent, ServerHandler};
pub use crate::time::{Cp16Time2a, Cp24Time2a, Cp56Time2a};
pub use crate::transport::{open_serial, SerialConfig, SerialParity, Transport};
