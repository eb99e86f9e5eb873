use crate::meta::record::{MetaHandle, MetaRecord};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Bounded LRU of path -> record handle. The recency deque keeps the most
/// recently used path at the front; eviction pops from the back, skipping
/// the path currently being inserted.
pub struct MetaStore {
    inner: Mutex<Inner>,
    max_count: usize,
}

struct Inner {
    map: HashMap<String, MetaHandle>,
    order: VecDeque<String>,
}

impl MetaStore {
    /// `max_count` of 0 means unbounded
    pub fn new(max_count: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_count,
        }
    }

    /// Look up a record, promoting it to most recently used
    pub fn get(&self, path: &str) -> Option<MetaHandle> {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.map.get(path).cloned()?;
        promote(&mut inner, path);
        Some(handle)
    }

    /// Look up without promoting
    pub fn peek(&self, path: &str) -> Option<MetaHandle> {
        let inner = self.inner.lock().unwrap();
        inner.map.get(path).cloned()
    }

    pub fn has(&self, path: &str) -> bool {
        self.inner.lock().unwrap().map.contains_key(path)
    }

    pub fn touch(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(path) {
            promote(&mut inner, path);
        }
    }

    /// Insert or overwrite a record and move it to the front. An existing
    /// handle is updated in place so tree nodes sharing it observe the new
    /// record. Evicts coldest entries until within capacity; the path being
    /// inserted is never evicted.
    pub fn upsert(&self, record: MetaRecord) -> MetaHandle {
        let path = record.path.clone();
        let mut inner = self.inner.lock().unwrap();

        if let Some(handle) = inner.map.get(&path).cloned() {
            *handle.write().unwrap() = record;
            promote(&mut inner, &path);
            return handle;
        }

        let handle = record.into_handle();
        inner.map.insert(path.clone(), handle.clone());
        inner.order.push_front(path.clone());

        if self.max_count > 0 {
            while inner.map.len() > self.max_count {
                let Some(victim) = coldest_except(&inner.order, &path) else {
                    break;
                };
                tracing::debug!(path = %victim, "evicting coldest metadata record");
                inner.map.remove(&victim);
                inner.order.retain(|p| p != &victim);
            }
        }

        handle
    }

    /// Re-insert an existing handle under its current path, so a node whose
    /// record was evicted earlier shares one handle with the store again.
    pub fn upsert_handle(&self, handle: MetaHandle) {
        let path = handle.read().unwrap().path.clone();
        let mut inner = self.inner.lock().unwrap();
        let present = inner.map.insert(path.clone(), handle).is_some();
        if present {
            promote(&mut inner, &path);
        } else {
            inner.order.push_front(path.clone());
            if self.max_count > 0 {
                while inner.map.len() > self.max_count {
                    let Some(victim) = coldest_except(&inner.order, &path) else {
                        break;
                    };
                    inner.map.remove(&victim);
                    inner.order.retain(|p| p != &victim);
                }
            }
        }
    }

    /// Idempotent removal
    pub fn erase(&self, path: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.remove(path).is_some() {
            inner.order.retain(|p| p != path);
        }
    }

    /// Rekey an entry without re-sorting. No-op when `old` is absent; an
    /// existing `new` entry is overwritten.
    pub fn rename(&self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.map.contains_key(old) {
            return;
        }
        if inner.map.remove(new).is_some() {
            inner.order.retain(|p| p != new);
        }
        let handle = inner.map.remove(old).unwrap();
        handle.write().unwrap().path = new.to_string();
        inner.map.insert(new.to_string(), handle);
        for p in inner.order.iter_mut() {
            if p == old {
                *p = new.to_string();
            }
        }
    }

    pub fn has_free_space(&self, need: usize) -> bool {
        if self.max_count == 0 {
            return true;
        }
        self.inner.lock().unwrap().map.len() + need <= self.max_count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.order.clear();
    }
}

fn promote(inner: &mut Inner, path: &str) {
    if let Some(pos) = inner.order.iter().position(|p| p == path) {
        inner.order.remove(pos);
        inner.order.push_front(path.to_string());
    }
}

fn coldest_except(order: &VecDeque<String>, keep: &str) -> Option<String> {
    order.iter().rev().find(|p| p.as_str() != keep).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::record::FileKind;

    fn record(path: &str) -> MetaRecord {
        MetaRecord::new(path, 0, 1, 0, 0, 0o644, FileKind::File)
    }

    #[test]
    fn test_lru_eviction() {
        let store = MetaStore::new(2);
        store.upsert(record("/p1"));
        store.upsert(record("/p2"));
        store.upsert(record("/p3"));
        assert_eq!(store.len(), 2);
        assert!(store.peek("/p1").is_none());
        assert!(store.peek("/p2").is_some());
        assert!(store.peek("/p3").is_some());
    }

    #[test]
    fn test_upsert_existing_keeps_handle_and_length() {
        let store = MetaStore::new(2);
        let h1 = store.upsert(record("/p1"));
        let mut updated = record("/p1");
        updated.size = 42;
        let h2 = store.upsert(updated);
        assert!(std::sync::Arc::ptr_eq(&h1, &h2));
        assert_eq!(store.len(), 1);
        assert_eq!(h1.read().unwrap().size, 42);
    }

    #[test]
    fn test_get_promotes() {
        let store = MetaStore::new(2);
        store.upsert(record("/p1"));
        store.upsert(record("/p2"));
        store.get("/p1");
        store.upsert(record("/p3"));
        // /p2 was coldest after the touch of /p1
        assert!(store.peek("/p1").is_some());
        assert!(store.peek("/p2").is_none());
    }

    #[test]
    fn test_rename() {
        let store = MetaStore::new(0);
        store.upsert(record("/old"));
        store.rename("/old", "/new");
        assert!(store.peek("/old").is_none());
        let handle = store.peek("/new").unwrap();
        assert_eq!(handle.read().unwrap().path, "/new");
        // renaming an absent path is a no-op
        store.rename("/ghost", "/whatever");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_erase_idempotent() {
        let store = MetaStore::new(0);
        store.upsert(record("/p"));
        store.erase("/p");
        store.erase("/p");
        assert!(store.is_empty());
    }
}
