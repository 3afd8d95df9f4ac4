//! Per-superstep message buffer.
//!
//! A [`StepContext`] is the ordered buffer of envelopes queued for one
//! superstep: an insertion-ordered mapping from sender to the sequence of
//! envelopes that sender produced. Two invariants hold:
//!
//! - within one step context, the order of envelopes from a single sender is
//!   preserved exactly as they were committed;
//! - the handoff between steps is a single atomic swap ([`StepContext::take`]),
//!   so no envelope is ever delivered in the step in which it was produced.
//!
//! The runner is the only writer. Checkpoints serialize the buffer through
//! [`StepContext::to_portable`], which flattens it to delivery order.

use crate::envelope::{Envelope, SenderId};
use crate::error::Result;
use agentflow_checkpoint::PortableEnvelope;
use std::collections::HashMap;
use std::sync::Arc;

/// Ordered mapping `sender → sequence of envelopes` for one superstep.
#[derive(Debug, Default)]
pub struct StepContext {
    /// Senders in first-commit order.
    order: Vec<SenderId>,
    /// Envelopes per sender, in commit order.
    buffers: HashMap<SenderId, Vec<Arc<Envelope>>>,
}

impl StepContext {
    /// Create an empty step context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit an envelope under its sender.
    ///
    /// The envelope must already be bound to a target; routing happens
    /// before commit, when the delivery mapping is applied.
    pub fn commit(&mut self, envelope: Arc<Envelope>) {
        let sender = envelope.source.clone();
        match self.buffers.get_mut(&sender) {
            Some(buffer) => buffer.push(envelope),
            None => {
                self.order.push(sender.clone());
                self.buffers.insert(sender, vec![envelope]);
            }
        }
    }

    /// Whether the buffer holds no envelopes.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Total number of queued envelopes.
    pub fn len(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }

    /// Atomically exchange this buffer with a fresh empty one.
    ///
    /// The returned context is the work of the step being started.
    pub fn take(&mut self) -> StepContext {
        std::mem::take(self)
    }

    /// Iterate `(sender, envelopes)` pairs in first-commit order.
    pub fn iter(&self) -> impl Iterator<Item = (&SenderId, &[Arc<Envelope>])> {
        self.order
            .iter()
            .map(move |sender| (sender, self.buffers[sender].as_slice()))
    }

    /// Consume the buffer into `(sender, envelopes)` pairs in commit order.
    pub fn into_pairs(mut self) -> Vec<(SenderId, Vec<Arc<Envelope>>)> {
        self.order
            .drain(..)
            .map(|sender| {
                let envelopes = self.buffers.remove(&sender).unwrap_or_default();
                (sender, envelopes)
            })
            .collect()
    }

    /// Flatten to portable envelopes in delivery order.
    pub fn to_portable(&self) -> Result<Vec<PortableEnvelope>> {
        let mut portable = Vec::with_capacity(self.len());
        for (_, envelopes) in self.iter() {
            for envelope in envelopes {
                portable.push(envelope.to_portable()?);
            }
        }
        Ok(portable)
    }

    /// Rebuild a step context from portable envelopes.
    pub fn from_portable(portable: &[PortableEnvelope]) -> Result<StepContext> {
        let mut step = StepContext::new();
        for entry in portable {
            step.commit(Arc::new(Envelope::from_portable(entry)?));
        }
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(source: &str, value: i64) -> Arc<Envelope> {
        Arc::new(
            Envelope::new(json!(value), "int", SenderId::Executor(source.into())).with_target("t"),
        )
    }

    #[test]
    fn test_per_sender_order_preserved() {
        let mut step = StepContext::new();
        step.commit(envelope("a", 1));
        step.commit(envelope("b", 10));
        step.commit(envelope("a", 2));
        step.commit(envelope("a", 3));

        let pairs = step.into_pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, SenderId::Executor("a".into()));
        let values: Vec<i64> = pairs[0]
            .1
            .iter()
            .map(|e| e.value.as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_sender_order_is_first_commit() {
        let mut step = StepContext::new();
        step.commit(envelope("b", 1));
        step.commit(envelope("a", 2));
        step.commit(envelope("b", 3));

        let senders: Vec<SenderId> = step.iter().map(|(s, _)| s.clone()).collect();
        assert_eq!(
            senders,
            vec![
                SenderId::Executor("b".into()),
                SenderId::Executor("a".into())
            ]
        );
    }

    #[test]
    fn test_take_swaps_atomically() {
        let mut step = StepContext::new();
        step.commit(envelope("a", 1));

        let work = step.take();
        assert_eq!(work.len(), 1);
        assert!(step.is_empty());

        // New commits land in the fresh buffer, not the taken one.
        step.commit(envelope("a", 2));
        assert_eq!(step.len(), 1);
        assert_eq!(work.len(), 1);
    }

    #[test]
    fn test_portable_round_trip_keeps_order() {
        let mut step = StepContext::new();
        step.commit(envelope("a", 1));
        step.commit(envelope("a", 2));
        step.commit(envelope("b", 3));

        let portable = step.to_portable().unwrap();
        assert_eq!(portable.len(), 3);

        let rebuilt = StepContext::from_portable(&portable).unwrap();
        let pairs = rebuilt.into_pairs();
        assert_eq!(pairs[0].0, SenderId::Executor("a".into()));
        assert_eq!(pairs[0].1.len(), 2);
        assert_eq!(pairs[1].0, SenderId::Executor("b".into()));
        assert_eq!(pairs[1].1[0].value, json!(3));
    }
}
