//! Extraction protocol messages
//!
//! The root task drives every resource manager with these control messages:
//! - `Extract`: report the dependency subgraph of the listed objects
//! - `Free`: drop one reference on each listed object
//! - `Destroy`: tear the listed objects down regardless of refcount
//! - `Retain`: take one additional reference on each listed object
//!
//! A manager answers `Extract` with either a serialized subgraph or an
//! explicit `NoData` acknowledgement, and the other actions with `Ack`.

use serde::{Deserialize, Serialize};

use crate::{decode, encode, Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractAction {
    Extract,
    Free,
    Destroy,
    Retain,
}

/// Root task → manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub action: ExtractAction,
    pub object_ids: Vec<u32>,
}

impl ExtractRequest {
    pub fn new(action: ExtractAction, object_ids: Vec<u32>) -> Self {
        Self { action, object_ids }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Manager → root task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractReply {
    /// Serialized subgraph contributed by the manager
    Subgraph(Vec<u8>),
    /// The manager has no relations to report
    NoData,
    /// Free/Destroy/Retain completed on `affected` objects
    Ack { affected: u32 },
    /// The request itself could not be served
    Failed(Status),
}

impl ExtractReply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_request_wire_format() {
        let request = ExtractRequest::new(ExtractAction::Extract, vec![1, 2, 0xF_FFFF]);
        let decoded = ExtractRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_no_data_is_distinct_from_empty_subgraph() {
        let no_data = ExtractReply::NoData.encode().unwrap();
        let empty = ExtractReply::Subgraph(Vec::new()).encode().unwrap();
        assert_ne!(no_data, empty);
        assert_eq!(ExtractReply::decode(&no_data).unwrap(), ExtractReply::NoData);
    }

    #[test]
    fn test_failed_reply_carries_status() {
        let bytes = ExtractReply::Failed(Status::PeerDead).encode().unwrap();
        assert_eq!(
            ExtractReply::decode(&bytes).unwrap(),
            ExtractReply::Failed(Status::PeerDead)
        );
    }
}
