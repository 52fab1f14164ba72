//! Typed failure taxonomy for the bridge core
//!
//! Config errors stay `anyhow` at the loading edge (they are fatal at
//! startup anyway); runtime failures that callers branch on get real types.

use thiserror::Error;

/// Failures surfaced by the command manager's `send` path.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("transport write failed: {0}")]
    Transport(String),
    #[error("no acknowledgement within {0} ms")]
    AckTimeout(u64),
    #[error("gave up after {0} send attempts")]
    MaxRetriesExceeded(u32),
    #[error("cannot construct packet: {0}")]
    BadPacket(String),
    #[error("port transport closed")]
    TransportClosed,
    #[error("unknown entity {0:?}")]
    UnknownEntity(String),
    #[error("entity {entity:?} has no command {command:?}")]
    UnknownCommand { entity: String, command: String },
}

/// Failures opening or driving the serial / TCP transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device {path} did not appear within {waited_ms} ms")]
    DeviceWaitTimeout { path: String, waited_ms: u64 },
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported serial parameter: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        assert_eq!(CommandError::AckTimeout(500).to_string(), "no acknowledgement within 500 ms");
        assert_eq!(
            CommandError::MaxRetriesExceeded(3).to_string(),
            "gave up after 3 send attempts"
        );
    }
}
