//! Capture/restore glue between runner state and the checkpoint store.
//!
//! The portable checkpoint keeps one opaque byte blob per executor. The
//! runner packs two things into that blob: the executor's own
//! `checkpoint_state` output, and the executor's published scopes from the
//! state manager. Packing both behind a single entry keeps the store format
//! flat while losing nothing the runner owns.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// What one checkpoint entry holds for one executor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct ExecutorSnapshot {
    /// Published state-manager scopes of the executor.
    pub scopes: HashMap<String, HashMap<String, Value>>,
    /// Blob the executor produced through its checkpoint hook.
    pub blob: Vec<u8>,
}

impl ExecutorSnapshot {
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<ExecutorSnapshot> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_round_trip() {
        let mut scopes = HashMap::new();
        let mut scope = HashMap::new();
        scope.insert("count".to_string(), json!(3));
        scopes.insert("default".to_string(), scope);

        let snapshot = ExecutorSnapshot {
            scopes,
            blob: vec![9, 8, 7],
        };

        let bytes = snapshot.encode().unwrap();
        let back = ExecutorSnapshot::decode(&bytes).unwrap();
        assert_eq!(back.blob, vec![9, 8, 7]);
        assert_eq!(back.scopes["default"]["count"], json!(3));
    }

    #[test]
    fn test_empty_snapshot_decodes() {
        let bytes = ExecutorSnapshot::default().encode().unwrap();
        let back = ExecutorSnapshot::decode(&bytes).unwrap();
        assert!(back.scopes.is_empty());
        assert!(back.blob.is_empty());
    }
}
