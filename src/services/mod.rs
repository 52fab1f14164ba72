//! Services - the per-port protocol engine and its managers
//!
//! This module contains the core bridge logic:
//! - `framer` - byte stream to validated packets
//! - `device` - entity runtimes (parse packets, build commands)
//! - `state` - merge/diff/dedup and retained state publishing
//! - `command` - serialized transmit, ACK wait, retries
//! - `discovery` - Home Assistant MQTT discovery
//! - `subscriber` - MQTT set-topic routing
//! - `automation` - triggers, guards, actions, scripts
//! - `port` - one bus end to end
//! - `supervisor` - N ports over one MQTT client

pub mod automation;
pub mod command;
pub mod device;
pub mod discovery;
pub mod framer;
pub mod port;
pub mod state;
pub mod subscriber;
pub mod supervisor;

// Re-export commonly used types
pub use automation::AutomationManager;
pub use command::CommandManager;
pub use device::EntityRuntime;
pub use discovery::DiscoveryManager;
pub use framer::Framer;
pub use port::PortEngine;
pub use state::{StateManager, StateStore};
pub use subscriber::Subscriber;
pub use supervisor::BridgeSupervisor;
