//! Message envelope and identity types.
//!
//! An [`Envelope`] is the immutable carrier that wraps a payload with routing
//! and trace metadata. Envelopes are shared by reference (`Arc<Envelope>`)
//! throughout the runtime: fan-out edges deliver the same allocation to
//! several targets, and equality is by identity, never by payload.
//!
//! Payloads travel as `serde_json::Value` tagged with a declared [`TypeTag`];
//! edges and route tables match on the tag, not on the value shape. The
//! portable form used by checkpoints encodes the payload to bytes and is
//! required to round-trip exactly.

use crate::error::Result;
use agentflow_checkpoint::PortableEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Unique identifier of an executor in the graph.
pub type ExecutorId = String;

/// Declared type of a payload, used for edge and route matching.
pub type TypeTag = String;

/// Where an envelope came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SenderId {
    /// Input or response delivered from outside the graph.
    External,
    /// A named executor inside the graph.
    Executor(ExecutorId),
}

impl SenderId {
    /// The executor id, if this sender is an executor.
    pub fn executor_id(&self) -> Option<&str> {
        match self {
            SenderId::External => None,
            SenderId::Executor(id) => Some(id),
        }
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderId::External => write!(f, "__external__"),
            SenderId::Executor(id) => write!(f, "{}", id),
        }
    }
}

/// Typed carrier of a payload plus source/target/trace metadata.
///
/// Envelopes are immutable once constructed. Derived envelopes (a fan-out
/// copy bound to a concrete target, a join result) are new allocations.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The payload.
    pub value: Value,
    /// Declared payload type.
    pub type_tag: TypeTag,
    /// Sender identity.
    pub source: SenderId,
    /// Concrete delivery target, once routing has resolved one.
    pub target: Option<ExecutorId>,
    /// Trace context forwarded from the producing side.
    pub trace: BTreeMap<String, String>,
}

impl Envelope {
    /// Create an envelope with no resolved target.
    pub fn new(value: Value, type_tag: impl Into<TypeTag>, source: SenderId) -> Self {
        Self {
            value,
            type_tag: type_tag.into(),
            source,
            target: None,
            trace: BTreeMap::new(),
        }
    }

    /// Create an external-input envelope.
    pub fn external(value: Value, type_tag: impl Into<TypeTag>) -> Self {
        Self::new(value, type_tag, SenderId::External)
    }

    /// Attach trace context.
    pub fn with_trace(mut self, trace: BTreeMap<String, String>) -> Self {
        self.trace = trace;
        self
    }

    /// Set an explicit delivery target.
    pub fn with_target(mut self, target: impl Into<ExecutorId>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// A copy of this envelope bound to a concrete target.
    ///
    /// Used when routing resolves a delivery; the original stays untouched
    /// so other edges can still evaluate it.
    pub fn bound_to(&self, target: impl Into<ExecutorId>) -> Arc<Envelope> {
        Arc::new(Envelope {
            value: self.value.clone(),
            type_tag: self.type_tag.clone(),
            source: self.source.clone(),
            target: Some(target.into()),
            trace: self.trace.clone(),
        })
    }

    /// Convert to the portable checkpoint form.
    pub fn to_portable(&self) -> Result<PortableEnvelope> {
        Ok(PortableEnvelope::encode(
            self.type_tag.clone(),
            &self.value,
            self.source.executor_id().map(str::to_string),
            self.target.clone(),
            self.trace.clone(),
        )?)
    }

    /// Rebuild an envelope from its portable form.
    pub fn from_portable(portable: &PortableEnvelope) -> Result<Envelope> {
        let source = match &portable.source_id {
            Some(id) => SenderId::Executor(id.clone()),
            None => SenderId::External,
        };
        Ok(Envelope {
            value: portable.decode_value()?,
            type_tag: portable.type_tag.clone(),
            source,
            target: portable.target_id.clone(),
            trace: portable.trace.clone(),
        })
    }
}
