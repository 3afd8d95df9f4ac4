//! Core checkpoint data structures.
//!
//! A checkpoint is a point-in-time, restorable snapshot of everything the
//! workflow runner owns at a superstep boundary:
//!
//! - which executors have been instantiated,
//! - an opaque state blob per instantiated executor,
//! - the envelopes queued for the next superstep (in portable form),
//! - the partially accumulated fan-in join buffers,
//! - the external requests still awaiting a response.
//!
//! The snapshot is taken **between** supersteps, so no handler is ever
//! mid-flight inside a checkpoint. Restoring a checkpoint into a fresh run
//! handle and replaying the same external inputs reproduces the same event
//! sequence as the uninterrupted run - which is why the unfinished join
//! buffers are part of the snapshot: a join waiting on one source must still
//! fire after a restore once the remaining sources contribute.
//!
//! # Structure
//!
//! ```text
//! WorkflowCheckpoint
//! ├── run_id: "2f4c..."              identifies the originating run
//! ├── step_number: 3                  last completed superstep
//! ├── executors: ["planner", "tool"]  instantiated executor ids
//! ├── executor_state: { "planner": <bytes>, ... }
//! ├── queued_envelopes: [PortableEnvelope, ...]
//! ├── partial_joins: [PortableJoin, ...]
//! └── outstanding_requests: [PortableRequest, ...]
//! ```
//!
//! Payload values travel as encoded bytes ([`PortableEnvelope::encoded_value`],
//! [`PortableRequest::encoded_payload`]) so the store never needs to
//! understand the domain types; the encoding must round-trip
//! (`encode ∘ decode = identity`) for every type tag in use. The byte
//! encoding itself lives in the [`codec`](crate::codec) module.

use crate::codec::{decode_value, encode_value};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// An envelope flattened into a store-friendly form.
///
/// The runner's in-memory envelopes share payloads by reference; the portable
/// form carries the payload as encoded bytes plus the type tag needed to
/// route it again after a restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortableEnvelope {
    /// Declared type of the payload, used for route matching after restore.
    pub type_tag: String,
    /// Encoded payload bytes (see [`codec`](crate::codec)).
    pub encoded_value: Vec<u8>,
    /// Sending executor id, or `None` for external input.
    pub source_id: Option<String>,
    /// Target executor id, or `None` for broadcast.
    pub target_id: Option<String>,
    /// Trace context forwarded with the payload.
    #[serde(default)]
    pub trace: BTreeMap<String, String>,
}

impl PortableEnvelope {
    /// Encode a JSON payload into a portable envelope.
    pub fn encode(
        type_tag: impl Into<String>,
        value: &serde_json::Value,
        source_id: Option<String>,
        target_id: Option<String>,
        trace: BTreeMap<String, String>,
    ) -> Result<Self> {
        Ok(Self {
            type_tag: type_tag.into(),
            encoded_value: encode_value(value)?,
            source_id,
            target_id,
            trace,
        })
    }

    /// Decode the payload back into a JSON value.
    pub fn decode_value(&self) -> Result<serde_json::Value> {
        decode_value(&self.encoded_value)
    }
}

/// An outstanding external request in portable form.
///
/// Like envelopes, the request payload travels as encoded bytes so the whole
/// snapshot stays free of self-describing values and survives any snapshot
/// encoding the store picks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortableRequest {
    /// Unique id matched against incoming responses.
    pub request_id: String,
    /// The port the request was posted through.
    pub port_id: String,
    /// Encoded request payload.
    pub encoded_payload: Vec<u8>,
}

impl PortableRequest {
    /// Encode a request payload into portable form.
    pub fn encode(
        request_id: impl Into<String>,
        port_id: impl Into<String>,
        payload: &serde_json::Value,
    ) -> Result<Self> {
        Ok(Self {
            request_id: request_id.into(),
            port_id: port_id.into(),
            encoded_payload: encode_value(payload)?,
        })
    }

    /// Decode the request payload.
    pub fn decode_payload(&self) -> Result<serde_json::Value> {
        decode_value(&self.encoded_payload)
    }
}

/// One source's buffered contribution to a fan-in join that has not fired.
///
/// A join edge accumulates envelopes until every declared source has
/// contributed. When a checkpoint lands between those contributions, the
/// buffered half lives here so the join can still complete after a restore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortableJoin {
    /// Edge the buffer belongs to (registration index in the edge map).
    pub edge_id: usize,
    /// Source whose envelopes are waiting for the other sources.
    pub source_id: String,
    /// Buffered envelopes, in arrival order.
    pub envelopes: Vec<PortableEnvelope>,
}

/// Complete snapshot of runner-owned state at a superstep boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    /// Run this snapshot was taken from.
    pub run_id: String,
    /// Number of the last completed superstep (numbering starts at 1).
    pub step_number: u64,
    /// Ids of the executors that had been instantiated.
    pub executors: Vec<String>,
    /// Opaque per-executor state blob, produced by each executor.
    pub executor_state: HashMap<String, Vec<u8>>,
    /// Envelopes queued for the next superstep, in delivery order.
    pub queued_envelopes: Vec<PortableEnvelope>,
    /// Unfinished fan-in join buffers.
    #[serde(default)]
    pub partial_joins: Vec<PortableJoin>,
    /// Requests still awaiting an external response.
    pub outstanding_requests: Vec<PortableRequest>,
}

impl WorkflowCheckpoint {
    /// Create an empty checkpoint for a run.
    pub fn new(run_id: impl Into<String>, step_number: u64) -> Self {
        Self {
            run_id: run_id.into(),
            step_number,
            executors: Vec::new(),
            executor_state: HashMap::new(),
            queued_envelopes: Vec::new(),
            partial_joins: Vec::new(),
            outstanding_requests: Vec::new(),
        }
    }
}

/// Descriptor of a stored checkpoint, as recorded on the run handle.
///
/// Descriptors are cheap to copy around and are all a caller needs to restore:
/// the store resolves `checkpoint_id` back to the full snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointInfo {
    /// Store-assigned identifier.
    pub checkpoint_id: String,
    /// Run the checkpoint belongs to.
    pub run_id: String,
    /// Superstep the checkpoint was taken after.
    pub step_number: u64,
    /// When the checkpoint was persisted.
    pub created_at: DateTime<Utc>,
}
