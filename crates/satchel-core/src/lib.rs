//! Satchel Core Library
//!
//! This crate provides configuration and shared types for the Satchel
//! offline caching layer.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ExclusionRule, OfflineConfig};
pub use error::{ConfigError, ConfigResult};
pub use types::{StoreName, VersionTag};
