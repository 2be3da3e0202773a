//! `courier-core`: shared building blocks.
//!
//! This crate has no infrastructure dependencies: it holds the validation error
//! model and the configuration types every other crate reads.

pub mod config;
pub mod error;

pub use config::{
    AppConfig, BrokerSettings, ConfigError, ConnectionSettings, LogFormat, LogSettings,
    QueueConfig, QueueItemSettings, QueueSettings,
};
pub use error::{DomainError, DomainResult};
