//! SR-IOV network driver
//!
//! This module provides:
//! - The PF device registry with its lifecycle state machine
//! - Logical networks layered on PFs
//! - VF endpoint binding
//! - The driver tying them together

pub mod device;
pub mod driver;
pub mod endpoint;
pub mod network;
pub mod state;

// Re-exports
pub use driver::SriovDriver;
pub use endpoint::{EndpointInfo, EndpointInterface, EndpointRequest, JoinInfo};
pub use network::NetworkOptions;
