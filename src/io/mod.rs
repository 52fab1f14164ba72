//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - shared rumqttc client with filter routing and reconnect
//! - `transport` - serial / TCP byte transport for a homenet bus

pub mod mqtt;
pub mod transport;

// Re-export commonly used types
pub use mqtt::{MqttClient, MqttHandle, MqttMessage};
pub use transport::{TransportReader, TransportWriter};
