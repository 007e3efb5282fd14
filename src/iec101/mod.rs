//! IEC 60870-5-101: the serial companion standard
//!
//! CS101 rides on FT1.2 frames over a byte-oriented serial line. The
//! [`ft12`] module owns the framing, [`master`] and [`slave`] the two
//! station roles in unbalanced and balanced operation.

pub mod ft12;
pub(crate) mod link;
pub mod master;
pub mod slave;

pub use ft12::{Ft12Codec, Ft12Frame, LinkControl, PrimaryFunction, SecondaryFunction};
pub use master::{Iec101Master, Iec101MasterConfig};
pub use slave::{Iec101Slave, Iec101SlaveConfig};
