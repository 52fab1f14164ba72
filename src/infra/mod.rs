//! Infrastructure - configuration, event bus, counters and error types
//!
//! This module contains infrastructure concerns:
//! - `config` - YAML configuration (loading, normalization, env overrides)
//! - `bus` - process-wide multi-subscriber event bus
//! - `counters` - lock-free per-port counters
//! - `error` - typed runtime failure taxonomy

pub mod bus;
pub mod config;
pub mod counters;
pub mod error;

// Re-export commonly used types
pub use bus::EventBus;
pub use config::{BridgeConfig, EntityConfig, EntityType, PacketDefaults, PortConfig, Settings};
pub use counters::PortCounters;
pub use error::{CommandError, TransportError};
