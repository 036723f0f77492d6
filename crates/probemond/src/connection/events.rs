//! Per-connection event handler table.
//!
//! At most one handler is bound per event name. Binding a second handler
//! for the same name is an error; `remove_all_events` is the teardown path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;

/// Handler invoked with the event payload.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Handler already bound for event '{0}'")]
    AlreadyBound(String),
}

#[derive(Default)]
pub struct EventTable {
    handlers: Mutex<HashMap<String, EventHandler>>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EventHandler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `handler` to `name`.
    ///
    /// # Errors
    ///
    /// `EventError::AlreadyBound` if a handler is already bound.
    pub fn add_event(&self, name: impl Into<String>, handler: EventHandler) -> Result<(), EventError> {
        let name = name.into();
        let mut handlers = self.lock();
        if handlers.contains_key(&name) {
            return Err(EventError::AlreadyBound(name));
        }
        handlers.insert(name, handler);
        Ok(())
    }

    /// Unbinds the handler for `name`. Returns true if one was bound.
    pub fn remove_event(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    /// Unbinds every handler. Returns how many were bound.
    pub fn remove_all_events(&self) -> usize {
        let mut handlers = self.lock();
        let count = handlers.len();
        handlers.clear();
        count
    }

    /// Invokes the handler for `name`. Returns false if none is bound.
    ///
    /// The handler runs outside the table lock, so it may bind or unbind.
    pub fn dispatch(&self, name: &str, payload: Value) -> bool {
        let handler = self.lock().get(name).cloned();
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
