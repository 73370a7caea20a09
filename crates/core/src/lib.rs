#![deny(unused)]
//! Core types, traits, and error definitions for agentbox.
//!
//! This crate provides the building blocks shared by the sandbox engine, the
//! tool registry, and the governance layer: the error taxonomy, application
//! configuration, audit events, and the tool contracts agents call through.

pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use events::*;
pub use traits::*;
pub use types::*;
