//! IEC 60870-5-104: the TCP/IP companion standard
//!
//! CS104 multiplexes I/U/S frames over one stream socket. The
//! [`apci`] module owns the frame codec, [`client`] and [`server`] the two
//! session roles; the windowed transmission state (k/w, t1..t3, sequence
//! validation) is shared by both.

pub mod apci;
pub mod client;
pub mod server;
pub(crate) mod transmission;

pub use apci::{Apci, Apdu, Iec104Codec, UFrame};
pub use client::{Iec104Client, Iec104ClientConfig};
pub use server::{Iec104Server, Iec104ServerConfig, RedundancyMode};
pub use transmission::DataTransferState;
