//! Error handling module
//!
//! Defines the error types used across the gateway and their mapping onto
//! the HTTP status codes observable by callers.

pub mod types;

pub use types::{GatewayError, RegistryError, TrafficLogError};
