//! Controller Module
//!
//! Provisioning, snapshots, clones and iSCSI publishing against one
//! JovianDSS pool.

pub mod clone;
pub mod ids;
pub mod paging;
pub mod publish;
pub mod registry;
pub mod service;

pub use clone::*;
pub use ids::*;
pub use paging::*;
pub use publish::*;
pub use registry::*;
pub use service::*;
