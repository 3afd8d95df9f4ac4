//! External request/response coordination.
//!
//! Executors interact with out-of-graph systems through named **ports**:
//! posting an [`ExternalRequest`] registers it in the outstanding-requests
//! registry and surfaces a `RequestInfo` event; the run can then park in
//! `PendingRequests` until the embedding application delivers a matching
//! [`ExternalResponse`], which removes the entry and routes the payload back
//! into the graph along the port's response edge.
//!
//! A request stays in the registry until exactly one matching response
//! arrives, the owner requests end-of-run, or the run completes. The
//! registry preserves posting order so checkpoints republish `RequestInfo`
//! events deterministically.

use crate::envelope::TypeTag;
use crate::error::Result;
use agentflow_checkpoint::PortableRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// A request posted by an executor, awaiting an external response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalRequest {
    /// Unique id matched against the eventual response.
    pub request_id: String,
    /// The port the request was posted through.
    pub port_id: String,
    /// Request payload handed to the external system.
    pub payload: Value,
}

impl ExternalRequest {
    /// Create a request with a generated id.
    pub fn new(port_id: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            port_id: port_id.into(),
            payload,
        }
    }

    /// Create a request with an explicit id.
    pub fn with_id(
        request_id: impl Into<String>,
        port_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            port_id: port_id.into(),
            payload,
        }
    }

    /// Convert to the portable checkpoint form.
    pub fn to_portable(&self) -> Result<PortableRequest> {
        Ok(PortableRequest::encode(
            &self.request_id,
            &self.port_id,
            &self.payload,
        )?)
    }

    /// Rebuild from the portable checkpoint form.
    pub fn from_portable(portable: &PortableRequest) -> Result<Self> {
        Ok(Self {
            request_id: portable.request_id.clone(),
            port_id: portable.port_id.clone(),
            payload: portable.decode_payload()?,
        })
    }
}

/// A response delivered by the embedding application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalResponse {
    /// Id of the request this answers.
    pub request_id: String,
    /// Response payload routed into the graph.
    pub payload: Value,
}

impl ExternalResponse {
    /// Create a response for a request id.
    pub fn new(request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: request_id.into(),
            payload,
        }
    }
}

/// A named entry/exit point for request/response interactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestPort {
    /// Port name executors post through.
    pub id: String,
    /// Declared type of request payloads.
    pub request_type: TypeTag,
    /// Declared type of response payloads; used to tag response envelopes.
    pub response_type: TypeTag,
}

impl RequestPort {
    /// Declare a port.
    pub fn new(
        id: impl Into<String>,
        request_type: impl Into<TypeTag>,
        response_type: impl Into<TypeTag>,
    ) -> Self {
        Self {
            id: id.into(),
            request_type: request_type.into(),
            response_type: response_type.into(),
        }
    }
}

/// Outstanding-requests registry, preserving posting order.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    order: Vec<String>,
    entries: HashMap<String, ExternalRequest>,
}

impl RequestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding request. Re-registering the same id replaces
    /// the payload but keeps the original position.
    pub fn register(&mut self, request: ExternalRequest) {
        if self
            .entries
            .insert(request.request_id.clone(), request.clone())
            .is_none()
        {
            self.order.push(request.request_id);
        }
    }

    /// Remove and return the request matching an id.
    ///
    /// Returns `None` when the id is not outstanding - including for the
    /// second delivery of the same response.
    pub fn take(&mut self, request_id: &str) -> Option<ExternalRequest> {
        let request = self.entries.remove(request_id)?;
        self.order.retain(|id| id != request_id);
        Some(request)
    }

    /// Whether an id is outstanding.
    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outstanding requests in posting order.
    pub fn snapshot(&self) -> Vec<ExternalRequest> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    /// Drop every entry (end of run, or the clear phase of a restore).
    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}
