//! Shared types for the homenet bridge
//!
//! The canonical data types used across port engines:
//! - `Packet` - a framed, checksum-valid byte sequence from the framer
//! - `StateBag` - an entity's JSON state object
//! - `BridgeEvent` - process-wide event bus payloads
//! - `PortStatus` / `StatusCause` - per-port lifecycle reporting
//! - `CommandIntent` - a scheduled entity command produced by expressions

use serde::Serialize;
use std::sync::Arc;

/// Entity state is always a JSON object keyed by attribute name, never a
/// bare scalar.
pub type StateBag = serde_json::Map<String, serde_json::Value>;

/// A framed, checksum-valid byte sequence delivered by the framer.
///
/// Holds the full frame as read off the wire (header, body, checksum and
/// footer included); per-entity stripping happens in the parser because
/// entities may override the port's packet parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub raw: Vec<u8>,
}

impl Packet {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn hex(&self) -> String {
        hex::encode_upper(&self.raw)
    }
}

/// A command scheduled from an expression via `id('x').command_y(v)`.
///
/// The evaluator returns this as an opaque value; the automation action
/// executor routes it through the command manager.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandIntent {
    pub entity_id: String,
    pub command: String,
    pub argument: Option<serde_json::Value>,
}

/// A state transition produced by the state manager.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub port_id: String,
    pub entity_id: String,
    /// Merged state after the update.
    pub state: StateBag,
    /// Snapshot before the update.
    pub old_state: StateBag,
    /// Keys whose values actually changed, with their new values.
    pub changes: StateBag,
}

/// Process-wide event bus payloads.
///
/// Packet events stay framer-local (each port engine has its own packet
/// broadcast for ACK waiters and packet triggers); everything else fans out
/// here.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    StateChanged(Arc<StateChange>),
    RawData { port_id: String, payload: String },
    RawDataWithInterval { port_id: String, payload: String, interval_ms: u64 },
    MqttMessage { topic: String, payload: String },
    CommandPacket { port_id: String, entity_id: String, payload: String },
    EntityRenamed { port_id: String, entity_id: String, old_name: String, new_name: String },
    CoreStarted { port_id: String },
    CoreStopped { port_id: String },
    AutomationGuard { port_id: String, automation: String, passed: bool },
    AutomationAction { port_id: String, automation: String, action: String },
    ScriptAction { port_id: String, script: String, action: String },
}

/// Where a port error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Serial,
    Mqtt,
    Core,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// Structured cause attached to `PortStatus::Error` / `Reconnecting`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusCause {
    pub source: ErrorSource,
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub retryable: bool,
}

impl StatusCause {
    pub fn new(
        source: ErrorSource,
        code: &str,
        message: impl Into<String>,
        severity: Severity,
        retryable: bool,
    ) -> Self {
        Self { source, code: code.to_string(), message: message.into(), severity, retryable }
    }
}

/// Per-port lifecycle status. Errors never cross the port boundary; the
/// supervisor aggregates these without coupling ports to each other.
#[derive(Debug, Clone, Default)]
pub enum PortStatus {
    #[default]
    Idle,
    Starting,
    Started,
    Stopped,
    Error(StatusCause),
    Reconnecting(StatusCause),
}

impl PortStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Idle => "idle",
            PortStatus::Starting => "starting",
            PortStatus::Started => "started",
            PortStatus::Stopped => "stopped",
            PortStatus::Error(_) => "error",
            PortStatus::Reconnecting(_) => "reconnecting",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_hex() {
        let packet = Packet::new(vec![0xF7, 0x30, 0x01, 0xEE]);
        assert_eq!(packet.hex(), "F73001EE");
    }

    #[test]
    fn test_port_status_as_str() {
        assert_eq!(PortStatus::Idle.as_str(), "idle");
        assert_eq!(PortStatus::Started.as_str(), "started");
        let cause = StatusCause::new(
            ErrorSource::Serial,
            "open_failed",
            "no such device",
            Severity::Error,
            true,
        );
        assert_eq!(PortStatus::Reconnecting(cause).as_str(), "reconnecting");
    }
}
