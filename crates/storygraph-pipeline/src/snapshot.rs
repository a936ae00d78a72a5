use serde::{Deserialize, Serialize};
use storygraph_core::{Entity, Result};
use storygraph_ledger::CallRecord;
use storygraph_memory::FeedbackDocument;

/// Everything a session persists, as one blob: the entity graph, the
/// call ledger, and the feedback document. A single serialize and
/// deserialize boundary; there is no partial persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub entities: Vec<Entity>,
    pub calls: Vec<CallRecord>,
    pub feedback: FeedbackDocument,
}

impl SessionSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }
}
