//! Adapter registry: built at startup, frozen before the first race.

use std::collections::HashSet;
use std::sync::Arc;

use super::{BackendAdapter, SharedAdapter};

/// Registration failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("backend '{0}' registered twice")]
    DuplicateId(String),
}

/// An adapter together with its registration position.
///
/// The index fixes the output order of race results.
#[derive(Clone)]
pub struct RegisteredAdapter {
    pub index: usize,
    pub adapter: SharedAdapter,
}

impl RegisteredAdapter {
    pub fn id(&self) -> &str {
        self.adapter.id()
    }
}

impl std::fmt::Debug for RegisteredAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAdapter")
            .field("index", &self.index)
            .field("id", &self.adapter.id())
            .finish()
    }
}

/// Builder collecting adapters in registration order.
#[derive(Default)]
pub struct AdapterRegistryBuilder {
    entries: Vec<SharedAdapter>,
    seen: HashSet<String>,
}

impl AdapterRegistryBuilder {
    pub fn register<A: BackendAdapter + 'static>(self, adapter: A) -> Result<Self, RegistryError> {
        self.register_shared(Arc::new(adapter))
    }

    pub fn register_shared(mut self, adapter: SharedAdapter) -> Result<Self, RegistryError> {
        let id = adapter.id().to_string();
        if !self.seen.insert(id.clone()) {
            return Err(RegistryError::DuplicateId(id));
        }
        self.entries.push(adapter);
        Ok(self)
    }

    pub fn build(self) -> AdapterRegistry {
        let entries = self
            .entries
            .into_iter()
            .enumerate()
            .map(|(index, adapter)| RegisteredAdapter { index, adapter })
            .collect::<Vec<_>>();
        AdapterRegistry {
            entries: Arc::from(entries),
        }
    }
}

/// Read-only set of registered adapters. Cheap to clone.
#[derive(Clone, Debug)]
pub struct AdapterRegistry {
    entries: Arc<[RegisteredAdapter]>,
}

impl AdapterRegistry {
    pub fn builder() -> AdapterRegistryBuilder {
        AdapterRegistryBuilder::default()
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredAdapter> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredAdapter> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.id()).collect()
    }
}
