//! Docker network plugin transport
//!
//! This module provides:
//! - Request/response types of the remote network driver protocol
//! - The axum server exposing the driver on a Unix socket

pub mod protocol;
pub mod server;

// Re-exports
pub use server::serve;
