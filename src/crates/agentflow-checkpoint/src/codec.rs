//! Wire encoding for checkpoint snapshots.
//!
//! Two encoding concerns meet here:
//!
//! - **Payload bytes.** Portable envelopes and requests carry their payloads
//!   as encoded bytes. Payloads are JSON values already, so the byte form is
//!   always JSON: it round-trips every value exactly and keeps the rest of
//!   the snapshot free of self-describing fields, which is what lets a store
//!   pick a compact binary snapshot format.
//! - **Snapshot framing.** A store that persists [`WorkflowCheckpoint`]s as
//!   bytes uses [`CheckpointCodec`]. Every encoded snapshot starts with a
//!   one-byte format marker, and decoding dispatches on that marker - so a
//!   store can switch its preferred encoding (or hold a mix written by
//!   different deployments) and still read everything back.
//!
//! ```text
//! ┌────────┬──────────────────────────────┐
//! │ marker │ snapshot body                │
//! │  b'j'  │ JSON document                │
//! │  b'b'  │ bincode record               │
//! └────────┴──────────────────────────────┘
//! ```

use crate::checkpoint::WorkflowCheckpoint;
use crate::error::{CheckpointError, Result};
use serde_json::Value;

const MARKER_JSON: u8 = b'j';
const MARKER_BINARY: u8 = b'b';

/// Encode a payload value into its portable byte form.
pub(crate) fn encode_value(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a portable payload back into a value.
pub(crate) fn decode_value(bytes: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Snapshot body format behind the frame marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointEncoding {
    /// Human-readable snapshots; the default.
    #[default]
    Json,
    /// Compact bincode snapshots for runs with large buffers.
    Binary,
}

impl CheckpointEncoding {
    fn marker(self) -> u8 {
        match self {
            CheckpointEncoding::Json => MARKER_JSON,
            CheckpointEncoding::Binary => MARKER_BINARY,
        }
    }

    fn from_marker(marker: u8) -> Result<Self> {
        match marker {
            MARKER_JSON => Ok(CheckpointEncoding::Json),
            MARKER_BINARY => Ok(CheckpointEncoding::Binary),
            other => Err(CheckpointError::Invalid(format!(
                "unknown snapshot marker 0x{:02x}",
                other
            ))),
        }
    }
}

/// Encoder/decoder for store-bound snapshots.
///
/// The configured encoding applies to `encode`; `decode` reads the frame
/// marker instead, so any codec decodes any snapshot this module produced.
///
/// # Example
///
/// ```rust
/// use agentflow_checkpoint::{CheckpointCodec, CheckpointEncoding, WorkflowCheckpoint};
///
/// # fn example() -> agentflow_checkpoint::Result<()> {
/// let codec = CheckpointCodec::new(CheckpointEncoding::Binary);
/// let bytes = codec.encode(&WorkflowCheckpoint::new("run-1", 2))?;
///
/// // A JSON-configured codec still reads the binary snapshot.
/// let snapshot = CheckpointCodec::default().decode(&bytes)?;
/// assert_eq!(snapshot.step_number, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CheckpointCodec {
    encoding: CheckpointEncoding,
}

impl CheckpointCodec {
    /// Create a codec writing the given encoding.
    pub fn new(encoding: CheckpointEncoding) -> Self {
        Self { encoding }
    }

    /// The encoding this codec writes.
    pub fn encoding(&self) -> CheckpointEncoding {
        self.encoding
    }

    /// Encode a snapshot, framed with its format marker.
    pub fn encode(&self, checkpoint: &WorkflowCheckpoint) -> Result<Vec<u8>> {
        let body = match self.encoding {
            CheckpointEncoding::Json => serde_json::to_vec(checkpoint)?,
            CheckpointEncoding::Binary => bincode::serialize(checkpoint)?,
        };
        let mut framed = Vec::with_capacity(body.len() + 1);
        framed.push(self.encoding.marker());
        framed.extend(body);
        Ok(framed)
    }

    /// Decode a framed snapshot, whatever encoding wrote it.
    pub fn decode(&self, bytes: &[u8]) -> Result<WorkflowCheckpoint> {
        let (marker, body) = bytes
            .split_first()
            .ok_or_else(|| CheckpointError::Invalid("empty snapshot".to_string()))?;
        match CheckpointEncoding::from_marker(*marker)? {
            CheckpointEncoding::Json => Ok(serde_json::from_slice(body)?),
            CheckpointEncoding::Binary => Ok(bincode::deserialize(body)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{PortableEnvelope, PortableJoin, PortableRequest};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn populated_checkpoint() -> WorkflowCheckpoint {
        let mut checkpoint = WorkflowCheckpoint::new("run-1", 4);
        checkpoint.executors.push("solver".to_string());
        checkpoint
            .executor_state
            .insert("solver".to_string(), vec![0xde, 0xad]);
        checkpoint.queued_envelopes.push(
            PortableEnvelope::encode(
                "int",
                &json!(7),
                Some("solver".to_string()),
                Some("judge".to_string()),
                BTreeMap::new(),
            )
            .unwrap(),
        );
        checkpoint.partial_joins.push(PortableJoin {
            edge_id: 2,
            source_id: "solver".to_string(),
            envelopes: vec![PortableEnvelope::encode(
                "text",
                &json!("half"),
                Some("solver".to_string()),
                None,
                BTreeMap::new(),
            )
            .unwrap()],
        });
        checkpoint
            .outstanding_requests
            .push(PortableRequest::encode("req-9", "guess", &json!({"hint": 1})).unwrap());
        checkpoint
    }

    #[test]
    fn json_snapshot_round_trips() {
        let codec = CheckpointCodec::default();
        let bytes = codec.encode(&populated_checkpoint()).unwrap();
        assert_eq!(bytes[0], MARKER_JSON);

        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back.run_id, "run-1");
        assert_eq!(back.partial_joins[0].edge_id, 2);
        assert_eq!(
            back.outstanding_requests[0].decode_payload().unwrap(),
            json!({"hint": 1})
        );
    }

    #[test]
    fn binary_snapshot_round_trips() {
        let codec = CheckpointCodec::new(CheckpointEncoding::Binary);
        let bytes = codec.encode(&populated_checkpoint()).unwrap();
        assert_eq!(bytes[0], MARKER_BINARY);

        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back.step_number, 4);
        assert_eq!(back.queued_envelopes[0].decode_value().unwrap(), json!(7));
        assert_eq!(
            back.partial_joins[0].envelopes[0].decode_value().unwrap(),
            json!("half")
        );
    }

    #[test]
    fn decode_dispatches_on_marker_not_configuration() {
        let binary = CheckpointCodec::new(CheckpointEncoding::Binary)
            .encode(&populated_checkpoint())
            .unwrap();
        let json = CheckpointCodec::default()
            .encode(&populated_checkpoint())
            .unwrap();

        // Each codec reads the other's output.
        assert!(CheckpointCodec::default().decode(&binary).is_ok());
        assert!(CheckpointCodec::new(CheckpointEncoding::Binary)
            .decode(&json)
            .is_ok());
    }

    #[test]
    fn unknown_marker_is_rejected() {
        let result = CheckpointCodec::default().decode(&[b'z', 1, 2, 3]);
        assert!(matches!(result, Err(CheckpointError::Invalid(_))));
    }

    #[test]
    fn empty_snapshot_is_rejected() {
        let result = CheckpointCodec::default().decode(&[]);
        assert!(matches!(result, Err(CheckpointError::Invalid(_))));
    }
}
