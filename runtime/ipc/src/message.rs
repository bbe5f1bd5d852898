//! Request/reply messages
//!
//! A request names an [`Opcode`] and carries a vector of machine words; the
//! target object is never part of the payload, it is resolved from the
//! badge of the endpoint the request arrived on. A reply carries a status
//! code next to its words so errors cannot be mistaken for data.

use serde::{Deserialize, Serialize};

use crate::{decode, encode, IpcError, Result, Status};

/// Framework-level operation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Allocate a new object (only valid on a null-object endpoint badge)
    Alloc,
    /// Take an additional reference on the badged object
    IncRef,
    /// Release one reference on the badged object
    DecRef,
    /// Server-specific operation, forwarded to the dispatcher
    Invoke(u16),
    /// A domain has exited; one-way, never answered
    DomainExit,
}

impl Opcode {
    /// One-way requests produce no reply
    pub const fn is_one_way(self) -> bool {
        matches!(self, Opcode::DomainExit)
    }
}

/// Synchronous request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub opcode: Opcode,
    pub args: Vec<u64>,
}

impl RequestMessage {
    pub fn new(opcode: Opcode, args: Vec<u64>) -> Self {
        Self { opcode, args }
    }

    /// Allocation request
    ///
    /// # Arguments
    /// * `object_id` - Requested object id, or 0 to let the manager choose
    /// * `ctor_arg` - Opaque constructor argument
    pub fn alloc(object_id: u64, ctor_arg: u64) -> Self {
        Self::new(Opcode::Alloc, vec![object_id, ctor_arg])
    }

    pub fn inc_ref() -> Self {
        Self::new(Opcode::IncRef, Vec::new())
    }

    pub fn dec_ref() -> Self {
        Self::new(Opcode::DecRef, Vec::new())
    }

    pub fn invoke(op: u16, args: Vec<u64>) -> Self {
        Self::new(Opcode::Invoke(op), args)
    }

    pub fn domain_exit(domain: u64) -> Self {
        Self::new(Opcode::DomainExit, vec![domain])
    }

    /// Argument at `index`, or a protocol error if the request is too short
    pub fn arg(&self, index: usize) -> Result<u64> {
        self.args.get(index).copied().ok_or_else(|| {
            IpcError::Malformed(format!(
                "{:?} expects at least {} argument(s), got {}",
                self.opcode,
                index + 1,
                self.args.len()
            ))
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Reply to a synchronous request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMessage {
    /// Out-of-band status, see [`Status`]
    pub status: u32,
    pub values: Vec<u64>,
}

impl ReplyMessage {
    pub fn ok(values: Vec<u64>) -> Self {
        Self {
            status: Status::Ok.code(),
            values,
        }
    }

    pub fn error(status: Status) -> Self {
        Self {
            status: status.code(),
            values: Vec::new(),
        }
    }

    pub fn status(&self) -> Result<Status> {
        Status::from_code(self.status)
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok.code()
    }

    /// Value at `index` of a successful reply
    pub fn value(&self, index: usize) -> Result<u64> {
        self.values.get(index).copied().ok_or_else(|| {
            IpcError::Malformed(format!(
                "reply has {} value(s), wanted index {}",
                self.values.len(),
                index
            ))
        })
    }

    /// Turn a non-zero status into an error
    pub fn into_result(self) -> Result<Vec<u64>> {
        match self.status()? {
            Status::Ok => Ok(self.values),
            failed => Err(IpcError::Remote(failed)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}
