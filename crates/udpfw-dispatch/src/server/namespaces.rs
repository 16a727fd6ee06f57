use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::server::connection::Connection;

/// Namespace -> connections subscribed to it.
///
/// Writers are brief; fan-out never iterates under the lock, it works
/// on a snapshot instead.
pub struct NamespaceIndex {
    inner: RwLock<HashMap<String, Vec<Arc<Connection>>>>,
}

impl NamespaceIndex {
    pub fn new() -> NamespaceIndex {
        NamespaceIndex {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, namespace: &str, conn: Arc<Connection>) {
        let mut map = self.inner.write().expect("namespace index lock");
        map.entry(namespace.to_string()).or_default().push(conn);
    }

    /// Cloned membership list for lock-free iteration.
    pub fn snapshot(&self, namespace: &str) -> Vec<Arc<Connection>> {
        let map = self.inner.read().expect("namespace index lock");
        map.get(namespace).cloned().unwrap_or_default()
    }

    /// Remove this exact connection; drops the entry once it empties.
    pub fn delete(&self, namespace: &str, conn: &Arc<Connection>) {
        let mut map = self.inner.write().expect("namespace index lock");
        if let Some(list) = map.get_mut(namespace) {
            list.retain(|c| !Arc::ptr_eq(c, conn));
            if list.is_empty() {
                map.remove(namespace);
            }
        }
    }

    #[cfg(test)]
    pub fn namespace_count(&self) -> usize {
        self.inner.read().expect("namespace index lock").len()
    }
}

impl Default for NamespaceIndex {
    fn default() -> NamespaceIndex {
        NamespaceIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> Arc<Connection> {
        Arc::new(Connection::new(id.to_string()))
    }

    #[test]
    fn add_and_snapshot() {
        let index = NamespaceIndex::new();
        let a = conn("a");
        let b = conn("b");
        index.add("ns1", Arc::clone(&a));
        index.add("ns1", Arc::clone(&b));
        index.add("ns2", Arc::clone(&a));

        let ns1 = index.snapshot("ns1");
        assert_eq!(ns1.len(), 2);
        assert_eq!(index.snapshot("ns2").len(), 1);
        assert!(index.snapshot("missing").is_empty());
    }

    #[test]
    fn delete_removes_exact_connection_only() {
        let index = NamespaceIndex::new();
        let a = conn("a");
        let b = conn("b");
        index.add("ns1", Arc::clone(&a));
        index.add("ns1", Arc::clone(&b));

        index.delete("ns1", &a);
        let left = index.snapshot("ns1");
        assert_eq!(left.len(), 1);
        assert!(Arc::ptr_eq(&left[0], &b));
    }

    #[test]
    fn empty_namespace_entry_is_dropped() {
        let index = NamespaceIndex::new();
        let a = conn("a");
        index.add("ns1", Arc::clone(&a));
        assert_eq!(index.namespace_count(), 1);
        index.delete("ns1", &a);
        assert_eq!(index.namespace_count(), 0);
    }
}
