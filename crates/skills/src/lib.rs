#![deny(unused)]
//! Tool registry for agentbox.
//!
//! This crate provides:
//! - An explicit name → handler registry, validated at registration time
//! - Registration of the sandbox tools in one call

pub mod registry;

pub use registry::{register_sandbox_tools, DefaultToolRegistry};
