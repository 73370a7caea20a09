#![deny(unused)]
//! Governance for agentbox.
//!
//! This crate provides:
//! - Logging setup (`configure_tracing`)
//! - Audit sinks for sandbox events

pub mod audit;
pub mod tracing_layer;

pub use audit::{InMemoryAuditLog, JsonlAuditLog};
pub use tracing_layer::configure_tracing;
