//! Domain models - packet schemas, checksums and the expression dialect
//!
//! This module contains the canonical data types used throughout the bridge:
//! - `Packet` / `StateBag` - framed bytes and entity state objects
//! - `Checksum` - vendor frame checksum algorithms
//! - `Schema` - declarative match/extract/encode records
//! - `expr` - the sandboxed expression language
//! - `BridgeEvent` / `PortStatus` - event bus payloads and port lifecycle

pub mod checksum;
pub mod expr;
pub mod schema;
pub mod types;

// Re-export commonly used types at module level
pub use checksum::{Checksum, Checksum2};
pub use schema::{Decode, Endian, Mask, Matcher, Schema};
pub use types::{BridgeEvent, CommandIntent, Packet, PortStatus, StateBag, StatusCause};
