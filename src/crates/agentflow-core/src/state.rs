//! Per-executor scoped key/value store with step-fenced visibility.
//!
//! The state manager backs the `read_state` / `write_state` / `clear_scope`
//! operations of the bound context. Writes made during a superstep go to a
//! **pending** overlay; [`StateManager::publish_updates`] applies the overlay
//! to the base at the end of the step. Reads therefore see pre-step values
//! for the whole step (snapshot isolation per step), mirroring the barrier
//! discipline the channel system applies to graph state.
//!
//! The base map is shared read-only with handler contexts through
//! [`StateView`]; only the runner mutates it, and only inside
//! `publish_updates` when no handler is running.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Scope used when an executor does not name one.
pub const DEFAULT_SCOPE: &str = "default";

/// Key addressing one scope of one executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopeKey {
    executor_id: String,
    scope: String,
}

impl ScopeKey {
    fn new(executor_id: &str, scope: &str) -> Self {
        Self {
            executor_id: executor_id.to_string(),
            scope: scope.to_string(),
        }
    }
}

type BaseMap = HashMap<ScopeKey, HashMap<String, Value>>;

/// A queued mutation, applied at publish time in queue order.
#[derive(Debug, Clone)]
enum StateOp {
    Write { key: String, value: Value },
    ClearScope,
}

/// Read-only view of the published base, handed to handler contexts.
#[derive(Debug, Clone, Default)]
pub struct StateView {
    base: Arc<RwLock<BaseMap>>,
}

impl StateView {
    /// Read a published value. Pending writes of the current step are not
    /// visible.
    pub fn read(&self, executor_id: &str, scope: &str, key: &str) -> Option<Value> {
        let base = self.base.read().expect("state base lock poisoned");
        base.get(&ScopeKey::new(executor_id, scope))
            .and_then(|scope_map| scope_map.get(key))
            .cloned()
    }
}

/// Runner-owned state store with a queued-then-published commit discipline.
#[derive(Debug, Default)]
pub struct StateManager {
    base: Arc<RwLock<BaseMap>>,
    pending: Vec<(ScopeKey, StateOp)>,
}

impl StateManager {
    /// Create an empty state manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared read-only view for handler contexts.
    pub fn view(&self) -> StateView {
        StateView {
            base: self.base.clone(),
        }
    }

    /// Queue a write. Invisible until the owning step publishes.
    pub fn queue_write(&mut self, executor_id: &str, scope: &str, key: String, value: Value) {
        self.pending
            .push((ScopeKey::new(executor_id, scope), StateOp::Write { key, value }));
    }

    /// Queue a scope clear. Invisible until the owning step publishes.
    pub fn queue_clear_scope(&mut self, executor_id: &str, scope: &str) {
        self.pending
            .push((ScopeKey::new(executor_id, scope), StateOp::ClearScope));
    }

    /// Read a published value.
    pub fn read(&self, executor_id: &str, scope: &str, key: &str) -> Option<Value> {
        self.view().read(executor_id, scope, key)
    }

    /// Apply all pending operations to the base, in queue order.
    ///
    /// Called by the runner at the end of each superstep, after every handler
    /// of the step has completed.
    pub fn publish_updates(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut base = self.base.write().expect("state base lock poisoned");
        for (scope_key, op) in self.pending.drain(..) {
            match op {
                StateOp::Write { key, value } => {
                    base.entry(scope_key).or_default().insert(key, value);
                }
                StateOp::ClearScope => {
                    base.remove(&scope_key);
                }
            }
        }
    }

    /// Export the published scopes of one executor for checkpointing.
    pub fn export(&self, executor_id: &str) -> HashMap<String, HashMap<String, Value>> {
        let base = self.base.read().expect("state base lock poisoned");
        base.iter()
            .filter(|(scope_key, _)| scope_key.executor_id == executor_id)
            .map(|(scope_key, scope_map)| (scope_key.scope.clone(), scope_map.clone()))
            .collect()
    }

    /// Replace one executor's scopes from a checkpoint export.
    pub fn import(&mut self, executor_id: &str, scopes: HashMap<String, HashMap<String, Value>>) {
        let mut base = self.base.write().expect("state base lock poisoned");
        base.retain(|scope_key, _| scope_key.executor_id != executor_id);
        for (scope, scope_map) in scopes {
            base.insert(ScopeKey::new(executor_id, &scope), scope_map);
        }
    }

    /// Drop everything, pending included.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.base.write().expect("state base lock poisoned").clear();
    }
}
