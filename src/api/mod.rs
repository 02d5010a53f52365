//! API Module
//!
//! JSON-over-HTTP surface of the controller, node and identity services.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
