//! Configuration Module
//!
//! Handles configuration loading, validation, and management.

pub mod manager;
pub mod types;

pub use manager::{parse_execution_model, parse_protocol, ConfigManager};
pub use types::*;
