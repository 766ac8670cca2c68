//! Entry registry
//!
//! Process-wide name → entry map, injected wherever entries are registered
//! or looked up.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::backend::BackendAdapter;
use crate::entry::{DatastoreEntry, Entry};

pub trait Registry: Send + Sync {
    /// Store `entry` under its name, returning the entry it replaced.
    fn add(&self, entry: Arc<dyn Entry>) -> Option<Arc<dyn Entry>>;

    fn get(&self, name: &str) -> Option<Arc<dyn Entry>>;

    fn remove(&self, name: &str) -> Option<Arc<dyn Entry>>;

    /// Registered names, sorted.
    fn names(&self) -> Vec<String>;
}

#[derive(Default)]
pub struct InMemoryRegistry {
    entries: RwLock<HashMap<String, Arc<dyn Entry>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registry for InMemoryRegistry {
    fn add(&self, entry: Arc<dyn Entry>) -> Option<Arc<dyn Entry>> {
        let name = entry.name().to_string();
        let replaced = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), entry);

        if let Some(prev) = &replaced {
            tracing::warn!("Entry {} ({}) replaced by a new registration", name, prev.entry_type());
        }
        replaced
    }

    fn get(&self, name: &str) -> Option<Arc<dyn Entry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn remove(&self, name: &str) -> Option<Arc<dyn Entry>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Look up `name` and downcast it to a concrete entry type, e.g.
/// `get_entry::<MySqlAdapter>(&registry, "user-db")`.
pub fn get_entry<A: BackendAdapter>(registry: &dyn Registry, name: &str) -> Option<Arc<DatastoreEntry<A>>> {
    registry.get(name)?.as_any().downcast::<DatastoreEntry<A>>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RedisAdapter, SqliteAdapter};
    use crate::config::RedisSection;

    fn sqlite(name: &str) -> Arc<dyn Entry> {
        Arc::new(DatastoreEntry::builder(name, SqliteAdapter::new()).build())
    }

    #[test]
    fn test_add_get_remove() {
        let registry = InMemoryRegistry::new();
        assert!(registry.add(sqlite("b")).is_none());
        assert!(registry.add(sqlite("a")).is_none());

        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().name(), "a");
        assert!(registry.get("missing").is_none());

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert_eq!(registry.names(), vec!["b"]);
    }

    #[test]
    fn test_add_replaces_same_name() {
        let registry = InMemoryRegistry::new();
        let first = sqlite("cache");
        registry.add(first.clone());

        let redis: Arc<dyn Entry> = Arc::new(
            DatastoreEntry::builder("cache", RedisAdapter::new(RedisSection::default())).build(),
        );
        let replaced = registry.add(redis).unwrap();

        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(registry.get("cache").unwrap().entry_type(), "RedisEntry");
    }

    #[test]
    fn test_typed_lookup() {
        let registry = InMemoryRegistry::new();
        let entry = Arc::new(DatastoreEntry::builder("local", SqliteAdapter::new()).build());
        registry.add(entry.clone());

        let found = get_entry::<SqliteAdapter>(&registry, "local").unwrap();
        assert!(Arc::ptr_eq(&found, &entry));
        assert!(get_entry::<RedisAdapter>(&registry, "local").is_none());
        assert!(get_entry::<SqliteAdapter>(&registry, "missing").is_none());
    }
}
