//! Domain layer - capability ports and plugin request/response types

pub mod csi;
pub mod ports;

pub use csi::*;
pub use ports::*;
