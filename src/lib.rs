//! proxy-gateway
//!
//! A configuration-driven reverse proxy gateway. Clients authenticate with
//! opaque bearer tokens and address internal services through
//! `/api/{env}/{endpoint}`; the gateway forwards the request, rewrites URL
//! references in the response body, and records a structured traffic log.
//! Named multi-step workflows run through `/api/{env}/composite/{name}`.

pub mod auth;
pub mod composite;
pub mod config;
pub mod errors;
pub mod forward;
pub mod models;
pub mod registry;
pub mod rewrite;
pub mod safety;
pub mod traffic_log;
pub mod web;
