use crate::meta::{FileKind, MetaHandle, MetaRecord};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

/// Tree vertex: shares its record handle with the MetaStore, holds a weak
/// back-reference to its parent and owns its children. All structural
/// mutation happens under the DirectoryTree lock.
pub struct Node {
    meta: MetaHandle,
    parent: RwLock<Weak<Node>>,
    children: RwLock<BTreeMap<String, Arc<Node>>>,
    symlink: RwLock<Option<String>>,
}

impl Node {
    pub fn new(meta: MetaHandle) -> Arc<Self> {
        Arc::new(Self {
            meta,
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(BTreeMap::new()),
            symlink: RwLock::new(None),
        })
    }

    pub fn meta(&self) -> MetaHandle {
        self.meta.clone()
    }

    pub fn path(&self) -> String {
        self.meta.read().unwrap().path.clone()
    }

    pub fn kind(&self) -> FileKind {
        self.meta.read().unwrap().kind
    }

    pub fn is_directory(&self) -> bool {
        self.meta.read().unwrap().is_directory()
    }

    pub fn file_size(&self) -> u64 {
        self.meta.read().unwrap().size
    }

    pub fn mtime(&self) -> i64 {
        self.meta.read().unwrap().mtime
    }

    pub fn is_dirty(&self) -> bool {
        self.meta.read().unwrap().dirty
    }

    pub fn record(&self) -> MetaRecord {
        self.meta.read().unwrap().clone()
    }

    pub fn update_record<F: FnOnce(&mut MetaRecord)>(&self, f: F) {
        f(&mut self.meta.write().unwrap());
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.read().unwrap().upgrade()
    }

    pub fn set_parent(&self, parent: &Arc<Node>) {
        *self.parent.write().unwrap() = Arc::downgrade(parent);
    }

    pub fn find_child(&self, path: &str) -> Option<Arc<Node>> {
        self.children.read().unwrap().get(path).cloned()
    }

    pub fn has_child(&self, path: &str) -> bool {
        self.children.read().unwrap().contains_key(path)
    }

    pub fn children(&self) -> Vec<Arc<Node>> {
        self.children.read().unwrap().values().cloned().collect()
    }

    pub fn children_paths(&self) -> Vec<String> {
        self.children.read().unwrap().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.children.read().unwrap().is_empty()
    }

    /// Attach a child. Inserting a directory bumps this node's link count.
    pub fn insert_child(self: &Arc<Self>, child: &Arc<Node>) {
        debug_assert!(self.is_directory());
        let path = child.path();
        let mut children = self.children.write().unwrap();
        if children.insert(path.clone(), child.clone()).is_none() && child.is_directory() {
            self.meta.write().unwrap().num_links += 1;
        }
        drop(children);
        tracing::trace!(parent = %self.path(), child = %path, "attached child node");
    }

    /// Detach a child, symmetrically decrementing the link count.
    pub fn remove_child(&self, path: &str) {
        let mut children = self.children.write().unwrap();
        if let Some(child) = children.remove(path) {
            if child.is_directory() {
                let mut rec = self.meta.write().unwrap();
                rec.num_links = rec.num_links.saturating_sub(1);
            }
        }
    }

    /// Rekey a child in place, preserving its node
    pub fn rename_child(&self, old_path: &str, new_path: &str) {
        if old_path == new_path {
            return;
        }
        let mut children = self.children.write().unwrap();
        if let Some(child) = children.remove(old_path) {
            children.insert(new_path.to_string(), child);
        }
    }

    pub fn symlink_target(&self) -> Option<String> {
        self.symlink.read().unwrap().clone()
    }

    pub fn set_symlink_target(&self, target: &str) {
        *self.symlink.write().unwrap() = Some(target.to_string());
    }
}
