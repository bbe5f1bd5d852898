//! Resource IPC - Request/reply schema for resource managers
//!
//! # Purpose
//! Defines the messages exchanged between client domains, resource managers
//! and the root task: synchronous requests carrying an opcode plus a
//! fixed-point payload, replies carrying an out-of-band status code, and the
//! control messages of the extraction protocol.
//!
//! # Integration Points
//! - Depends on: nothing inside the workspace
//! - Provides to: Resource Broker (coordinator and resource components)
//! - IPC endpoints: every badged endpoint minted for a resource space
//! - Capabilities required: none (pure data)
//!
//! # Architecture
//! Messages are plain serde types encoded with bincode. The encoder is
//! size-limited so a malformed length prefix can never make a manager
//! allocate unbounded memory while decoding.
//!
//! The crate links `std` because bincode 1.x does; it is only used by the
//! root task and the managers it hosts, never by kernel-side code.
//!
//! # Testing Strategy
//! - Unit tests: opcode helpers, status mapping, malformed input rejection
//! - Property tests: request encoding for arbitrary argument vectors

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub mod extract;
pub mod message;

pub use extract::{ExtractAction, ExtractReply, ExtractRequest};
pub use message::{Opcode, ReplyMessage, RequestMessage};

/// Upper bound on any encoded message (1 MiB)
pub const MAX_MESSAGE_BYTES: u64 = 1 << 20;

/// IPC error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpcError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message could not be encoded: {0}")]
    Encode(String),

    #[error("Unknown status code {0}")]
    UnknownStatus(u32),

    #[error("Request failed with status {0:?}")]
    Remote(Status),
}

pub type Result<T> = core::result::Result<T, IpcError>;

/// Reply status, carried out-of-band next to the reply payload
///
/// `Ok` is zero; every other value names one error kind of the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    ProtocolError = 1,
    NotFound = 2,
    Exhausted = 3,
    PolicyViolation = 4,
    PermissionDenied = 5,
    PeerDead = 6,
}

impl Status {
    /// Wire value of this status
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Parse a wire status value
    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            0 => Status::Ok,
            1 => Status::ProtocolError,
            2 => Status::NotFound,
            3 => Status::Exhausted,
            4 => Status::PolicyViolation,
            5 => Status::PermissionDenied,
            6 => Status::PeerDead,
            other => return Err(IpcError::UnknownStatus(other)),
        })
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_BYTES)
}

/// Encode any wire type with the shared codec
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    codec()
        .serialize(value)
        .map_err(|e| IpcError::Encode(e.to_string()))
}

/// Decode any wire type with the shared codec
///
/// Trailing bytes and truncated input are both rejected.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    codec()
        .deserialize(bytes)
        .map_err(|e| IpcError::Malformed(e.to_string()))
}
