//! Node Plugin Module
//!
//! Attaches published volumes over iSCSI and mounts them for workloads.

pub mod exec;
pub mod iscsi;
pub mod mount;
pub mod plugin;
pub mod target;

pub use iscsi::IscsiAdm;
pub use mount::SystemMounter;
pub use plugin::*;
pub use target::TargetDescriptor;
