//! Name-dispatched mutator registry.
//!
//! The engine treats "what a mutation does to application data" as an
//! opaque capability: a handler registered under the mutation's name,
//! invoked against the push's write buffer. Unknown names are rejected as
//! decode errors before the store is touched.
//!
//! The built-in `put` and `del` mutators cover the protocol-generic
//! subset; applications register their own domain mutators at startup.

use crate::buffer::WriteBuffer;
use crate::error::SyncError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// A mutation handler: `(write buffer, args) -> ()`.
pub trait Mutator: Send + Sync {
    fn apply(&self, tx: &mut WriteBuffer<'_>, args: &Value) -> Result<(), SyncError>;
}

/// Plain functions and closures are mutators.
impl<F> Mutator for F
where
    F: Fn(&mut WriteBuffer<'_>, &Value) -> Result<(), SyncError> + Send + Sync,
{
    fn apply(&self, tx: &mut WriteBuffer<'_>, args: &Value) -> Result<(), SyncError> {
        self(tx, args)
    }
}

/// Mutation-name → handler mapping, registered at startup.
#[derive(Default)]
pub struct MutatorRegistry {
    mutators: HashMap<String, Box<dyn Mutator>>,
}

impl MutatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in `put` and `del` mutators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("put", PutMutator);
        registry.register("del", DelMutator);
        registry
    }

    /// Register a handler under a mutation name. Re-registering a name
    /// replaces the previous handler.
    pub fn register(&mut self, name: impl Into<String>, mutator: impl Mutator + 'static) {
        self.mutators.insert(name.into(), Box::new(mutator));
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<&dyn Mutator> {
        self.mutators.get(name).map(|m| m.as_ref())
    }

    /// Whether a handler is registered under this name.
    pub fn contains(&self, name: &str) -> bool {
        self.mutators.contains_key(name)
    }
}

/// Built-in upsert: `{"key": ..., "value": ...}`.
pub struct PutMutator;

#[derive(Deserialize)]
struct PutArgs {
    key: String,
    value: Value,
}

impl Mutator for PutMutator {
    fn apply(&self, tx: &mut WriteBuffer<'_>, args: &Value) -> Result<(), SyncError> {
        let args: PutArgs = serde_json::from_value(args.clone())?;
        tx.put(args.key, args.value);
        Ok(())
    }
}

/// Built-in delete: `{"key": ...}`.
pub struct DelMutator;

#[derive(Deserialize)]
struct DelArgs {
    key: String,
}

impl Mutator for DelMutator {
    fn apply(&self, tx: &mut WriteBuffer<'_>, args: &Value) -> Result<(), SyncError> {
        let args: DelArgs = serde_json::from_value(args.clone())?;
        tx.delete(args.key);
        Ok(())
    }
}
