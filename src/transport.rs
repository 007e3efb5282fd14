//! Byte stream collaborators
//!
//! Sessions are generic over any full-duplex byte stream, so a TLS wrapper
//! or an in-memory test pipe drops in where a TCP or serial stream would
//! be. The serial helper configures a port for CS101 field wiring.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::common::Result;

/// Any full-duplex byte stream a session can run over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialParity {
    None,
    Odd,
    Even,
}

/// Serial port settings for a CS101 line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Baud rate, typically 9600 for IEC 60870-5-101
    pub baud_rate: u32,
    /// Data bits (7 or 8)
    pub data_bits: u8,
    /// Parity; the standard recommends even parity
    pub parity: SerialParity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: SerialParity::Even,
            stop_bits: 1,
        }
    }
}

/// Open and configure a serial port for CS101 framing
pub fn open_serial(path: &str, config: &SerialConfig) -> Result<SerialStream> {
    let data_bits = match config.data_bits {
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    };
    let parity = match config.parity {
        SerialParity::None => Parity::None,
        SerialParity::Odd => Parity::Odd,
        SerialParity::Even => Parity::Even,
    };
    let stop_bits = match config.stop_bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    };

    let stream = tokio_serial::new(path, config.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .open_native_async()?;
    Ok(stream)
}
