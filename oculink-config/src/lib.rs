//! Configuration models and loading for the Oculink service.
//!
//! A TOML file provides the base configuration; environment variables
//! override individual fields so container deployments need no file at
//! all.
#![allow(missing_docs)]

mod loader;
mod models;

pub use loader::{ConfigError, load_config};
pub use models::{
    Config, OcrConfig, QueueSection, ReconnectSettings, RedisConfig, ServerConfig, SmbSection,
    SyncSection,
};
