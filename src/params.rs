//! Protocol parameter sets
//!
//! The three immutable parameter blocks both peers must agree on out-of-band:
//! application layer octet sizes, the CS104 APCI window/timer constants and
//! the CS101 link layer constants. Each block validates itself once at
//! session startup and is then copied around freely.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::{IecError, Result};

/// Information Object Addresses can be 1, 2, or 3 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoObjAddrSize {
    /// 1 byte address
    OneOctet = 1,
    /// 2 byte address
    TwoOctets = 2,
    /// 3 byte address
    ThreeOctets = 3,
}

/// Common Address of ASDU can be 1 or 2 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommonAddrSize {
    /// 1 byte address
    OneOctet = 1,
    /// 2 byte address
    TwoOctets = 2,
}

/// Cause of transmission field can be 1 or 2 bytes (2 adds the originator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CotSize {
    /// 1 byte: cause only
    OneOctet = 1,
    /// 2 bytes: cause + originator address
    TwoOctets = 2,
}

/// Link address of a CS101 station can be 1 or 2 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkAddrSize {
    /// 1 byte address
    OneOctet = 1,
    /// 2 byte address
    TwoOctets = 2,
}

/// CS101 link operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMode {
    /// One master polls multiple slaves
    Unbalanced,
    /// Both stations are primary and secondary simultaneously
    Balanced,
}

/// Application layer octet sizes shared by CS101 and CS104
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLayerParameters {
    /// Size of the cause of transmission field
    pub cot_size: CotSize,
    /// Size of the common address field
    pub ca_size: CommonAddrSize,
    /// Size of the information object address field
    pub ioa_size: InfoObjAddrSize,
    /// Maximum encoded ASDU size in octets
    pub max_asdu_size: usize,
}

/// Largest ASDU that fits a CS104 APDU (255 total - 2 header - 4 control)
pub const MAX_ASDU_SIZE_104: usize = 249;

impl Default for AppLayerParameters {
    fn default() -> Self {
        Self {
            cot_size: CotSize::TwoOctets,
            ca_size: CommonAddrSize::TwoOctets,
            ioa_size: InfoObjAddrSize::ThreeOctets,
            max_asdu_size: MAX_ASDU_SIZE_104,
        }
    }
}

impl AppLayerParameters {
    /// Validate the parameter block
    pub fn validate(&self) -> Result<()> {
        if self.max_asdu_size == 0 || self.max_asdu_size > MAX_ASDU_SIZE_104 {
            return Err(IecError::ConfigError(format!(
                "max_asdu_size must be 1..={}, got {}",
                MAX_ASDU_SIZE_104, self.max_asdu_size
            )));
        }
        Ok(())
    }

    /// Encoded ASDU header size for this parameter set
    pub fn header_size(&self) -> usize {
        // type + vsq + cot [+ oa] + ca
        2 + self.cot_size as usize + self.ca_size as usize
    }
}

/// CS104 APCI window and timer constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApciParameters {
    /// Maximum number of unacknowledged I-frames in flight
    pub k: u16,
    /// Latest acknowledgment after this many received I-frames
    pub w: u16,
    /// Connection establishment timeout
    pub t0: Duration,
    /// Send/test timeout: unacknowledged I-frame or TESTFR act closes the connection
    pub t1: Duration,
    /// Acknowledgment delay before an S-frame is emitted
    pub t2: Duration,
    /// Idle period after which a TESTFR act probes the peer
    pub t3: Duration,
}

impl Default for ApciParameters {
    fn default() -> Self {
        Self {
            k: 12,
            w: 8,
            t0: Duration::from_secs(30),
            t1: Duration::from_secs(15),
            t2: Duration::from_secs(10),
            t3: Duration::from_secs(20),
        }
    }
}

impl ApciParameters {
    /// Validate the parameter block (k/w ranges, t2 < t1 < t3)
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 || self.k > 32767 {
            return Err(IecError::ConfigError(format!(
                "k must be 1..=32767, got {}",
                self.k
            )));
        }
        if self.w == 0 || self.w > self.k {
            return Err(IecError::ConfigError(format!(
                "w must be 1..=k ({}), got {}",
                self.k, self.w
            )));
        }
        if self.t2 >= self.t1 {
            return Err(IecError::ConfigError(
                "t2 must be shorter than t1".to_string(),
            ));
        }
        if self.t3 <= self.t1 {
            return Err(IecError::ConfigError(
                "t3 must be longer than t1".to_string(),
            ));
        }
        Ok(())
    }
}

/// CS101 link layer constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkLayerParameters {
    /// Size of the link address field
    pub address_size: LinkAddrSize,
    /// Balanced or unbalanced operation
    pub mode: LinkMode,
    /// How long the primary waits for a reply before retransmitting
    pub ack_timeout: Duration,
    /// Retransmissions before the link is declared broken
    pub max_retries: u8,
    /// Answer positive confirms with the single character 0xE5
    pub single_char_ack: bool,
}

impl Default for LinkLayerParameters {
    fn default() -> Self {
        Self {
            address_size: LinkAddrSize::OneOctet,
            mode: LinkMode::Unbalanced,
            ack_timeout: Duration::from_millis(1000),
            max_retries: 3,
            single_char_ack: true,
        }
    }
}

impl LinkLayerParameters {
    /// Validate the parameter block
    pub fn validate(&self) -> Result<()> {
        if self.ack_timeout.is_zero() {
            return Err(IecError::ConfigError(
                "ack_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_app_layer_is_valid() {
        let params = AppLayerParameters::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.header_size(), 6);
    }

    #[test]
    fn header_size_follows_field_sizes() {
        let params = AppLayerParameters {
            cot_size: CotSize::OneOctet,
            ca_size: CommonAddrSize::OneOctet,
            ioa_size: InfoObjAddrSize::OneOctet,
            max_asdu_size: 100,
        };
        assert_eq!(params.header_size(), 4);
    }

    #[test]
    fn apci_parameters_reject_bad_windows() {
        let mut params = ApciParameters::default();
        params.w = params.k + 1;
        assert!(params.validate().is_err());

        let mut params = ApciParameters::default();
        params.k = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn apci_parameters_reject_bad_timer_ordering() {
        let mut params = ApciParameters::default();
        params.t2 = params.t1;
        assert!(params.validate().is_err());

        let mut params = ApciParameters::default();
        params.t3 = params.t1;
        assert!(params.validate().is_err());
    }

    #[test]
    fn oversize_asdu_limit_rejected() {
        let params = AppLayerParameters {
            max_asdu_size: MAX_ASDU_SIZE_104 + 1,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }
}
