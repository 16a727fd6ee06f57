use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::server::connection::Connection;

/// Client id -> connection, for the shutdown broadcast and accounting.
pub struct ClientMap {
    inner: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ClientMap {
    pub fn new() -> ClientMap {
        ClientMap {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: String, conn: Arc<Connection>) {
        self.inner.lock().expect("client map lock").insert(id, conn);
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().expect("client map lock").remove(id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("client map lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cloned connection list, so callers never await under the lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .expect("client map lock")
            .values()
            .cloned()
            .collect()
    }
}

impl Default for ClientMap {
    fn default() -> ClientMap {
        ClientMap::new()
    }
}
