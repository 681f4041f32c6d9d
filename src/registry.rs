use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{DispatcherMap, Features};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("handler '{0}' is not registered")]
    NotRegistered(String),
}

/// A worker known to the agent, keyed by its handler name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub handler: String,
    pub process_id: Option<u32>,
    /// Unix socket path the worker accepts dispatches on.
    pub local_address: String,
    pub features: Features,
    /// Inbound content is a URL the agent must fetch before dispatch.
    pub detached_content: bool,
}

impl WorkerDescriptor {
    pub fn new(handler: impl Into<String>, local_address: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            process_id: None,
            local_address: local_address.into(),
            features: Features::new(),
            detached_content: false,
        }
    }

    pub fn process_id(mut self, pid: u32) -> Self {
        self.process_id = Some(pid);
        self
    }

    pub fn features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn detached_content(mut self, detached: bool) -> Self {
        self.detached_content = detached;
        self
    }
}

/// Handler-name keyed set of registered workers.
///
/// At most one worker owns a handler at any time. Registration checks and
/// inserts under a single write lock, so two racing registrations for the
/// same handler cannot both succeed.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerDescriptor>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: WorkerDescriptor) -> Result<(), RegistryError> {
        let mut workers = self.write();
        if workers.contains_key(&descriptor.handler) {
            return Err(RegistryError::AlreadyRegistered(descriptor.handler));
        }
        workers.insert(descriptor.handler.clone(), descriptor);
        Ok(())
    }

    pub fn lookup(&self, handler: &str) -> Option<WorkerDescriptor> {
        self.read().get(handler).cloned()
    }

    pub fn unregister(&self, handler: &str) -> Option<WorkerDescriptor> {
        self.write().remove(handler)
    }

    /// Drops every handler owned by `pid`, returning the removed names.
    pub fn unregister_process(&self, pid: u32) -> Vec<String> {
        let mut workers = self.write();
        let handlers: Vec<String> = workers
            .values()
            .filter(|w| w.process_id == Some(pid))
            .map(|w| w.handler.clone())
            .collect();
        for handler in &handlers {
            workers.remove(handler);
        }
        handlers
    }

    pub fn update_features(&self, handler: &str, features: Features) -> Result<(), RegistryError> {
        let mut workers = self.write();
        let worker = workers
            .get_mut(handler)
            .ok_or_else(|| RegistryError::NotRegistered(handler.to_string()))?;
        worker.features = features;
        Ok(())
    }

    /// Handler to features, as advertised upstream.
    pub fn snapshot(&self) -> DispatcherMap {
        self.read()
            .values()
            .map(|w| (w.handler.clone(), w.features.clone()))
            .collect()
    }

    pub fn descriptors(&self) -> Vec<WorkerDescriptor> {
        let mut list: Vec<WorkerDescriptor> = self.read().values().cloned().collect();
        list.sort_by(|a, b| a.handler.cmp(&b.handler));
        list
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panicking writer never leaves the map half-updated, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, WorkerDescriptor>> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, WorkerDescriptor>> {
        self.workers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Adds a hyphenated alias for every handler name containing `_`.
///
/// Servers predating directive scrubbing still address workers by the
/// hyphenated form, so both spellings are advertised.
pub fn with_legacy_aliases(map: DispatcherMap) -> DispatcherMap {
    let mut flattened = map.clone();
    for (handler, features) in map {
        if handler.contains('_') {
            flattened
                .entry(handler.replace('_', "-"))
                .or_insert(features);
        }
    }
    flattened
}

/// Normalises a directive received from the server to a handler name.
pub fn scrub_directive(directive: &str) -> String {
    directive.replace('-', "_")
}
