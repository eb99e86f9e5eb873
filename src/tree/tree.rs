use crate::common::error::{Error, Result};
use crate::common::path::{is_root, parent_path};
use crate::common::util::unix_now;
use crate::meta::{MetaRecord, MetaStore};
use crate::tree::node::Node;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// The virtual namespace. The primary index holds weak references; nodes
/// are kept alive by their parent's child map and by the parent->children
/// multimap, which also lets an orphan ingested before its parent survive
/// until the parent arrives and adopts it.
///
/// The lock guards structure only and is never held across remote I/O.
pub struct DirectoryTree {
    inner: Mutex<TreeInner>,
    meta: Arc<MetaStore>,
}

struct TreeInner {
    root: Arc<Node>,
    index: HashMap<String, Weak<Node>>,
    by_parent: HashMap<String, Vec<Arc<Node>>>,
    current: Weak<Node>,
}

impl DirectoryTree {
    pub fn new(meta: Arc<MetaStore>, uid: u32, gid: u32, root_mode: u32) -> Self {
        let mut record = MetaRecord::directory("/", root_mode, unix_now());
        record.uid = uid;
        record.gid = gid;
        let root = Node::new(meta.upsert(record));
        let mut index = HashMap::new();
        index.insert("/".to_string(), Arc::downgrade(&root));
        Self {
            inner: Mutex::new(TreeInner {
                current: Arc::downgrade(&root),
                root,
                index,
                by_parent: HashMap::new(),
            }),
            meta,
        }
    }

    pub fn root(&self) -> Arc<Node> {
        self.inner.lock().unwrap().root.clone()
    }

    pub fn current_node(&self) -> Option<Arc<Node>> {
        self.inner.lock().unwrap().current.upgrade()
    }

    pub fn find(&self, path: &str) -> Option<Arc<Node>> {
        let inner = self.inner.lock().unwrap();
        inner.index.get(path).and_then(|w| w.upgrade())
    }

    pub fn has(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    /// Children of a directory via the parent->children multimap
    pub fn find_children(&self, dir_path: &str) -> Vec<Arc<Node>> {
        let inner = self.inner.lock().unwrap();
        inner.by_parent.get(dir_path).cloned().unwrap_or_default()
    }

    /// Ingest one record: overwrite the record of an existing node when the
    /// incoming one is newer, else create a node, attach it to its parent if
    /// known, and adopt any orphans waiting for this path.
    pub fn grow(&self, record: MetaRecord) -> Arc<Node> {
        let mut inner = self.inner.lock().unwrap();
        self.grow_locked(&mut inner, record)
    }

    pub fn grow_many(&self, records: Vec<MetaRecord>) {
        let mut inner = self.inner.lock().unwrap();
        for record in records {
            self.grow_locked(&mut inner, record);
        }
    }

    fn grow_locked(&self, inner: &mut TreeInner, record: MetaRecord) -> Arc<Node> {
        let path = record.path.clone();

        if let Some(node) = inner.index.get(&path).and_then(|w| w.upgrade()) {
            if record.mtime > node.mtime() {
                node.update_record(|rec| rec.absorb(record));
                self.meta.upsert_handle(node.meta());
            } else {
                self.meta.touch(&path);
            }
            inner.current = Arc::downgrade(&node);
            return node;
        }

        let is_dir = record.is_directory();
        let handle = self.meta.upsert(record);
        let node = Node::new(handle);
        inner.index.insert(path.clone(), Arc::downgrade(&node));

        if let Some(dir) = parent_path(&path) {
            if let Some(parent) = inner.index.get(&dir).and_then(|w| w.upgrade()) {
                parent.insert_child(&node);
                node.set_parent(&parent);
            } else {
                tracing::debug!(path = %path, parent = %dir, "parent not in tree yet, node kept as orphan");
            }
            inner.by_parent.entry(dir).or_default().push(node.clone());
        }

        if is_dir {
            if let Some(children) = inner.by_parent.get(&path) {
                for child in children {
                    node.insert_child(child);
                    child.set_parent(&node);
                }
            }
        }

        inner.current = Arc::downgrade(&node);
        node
    }

    /// Reconcile a directory with a fresh remote listing: children present
    /// locally but absent from the listing are dropped, the rest are grown.
    pub fn update_directory(&self, dir_path: &str, children: Vec<MetaRecord>) -> Result<Arc<Node>> {
        let mut keep: Vec<MetaRecord> = Vec::with_capacity(children.len());
        for child in children {
            match parent_path(&child.path) {
                Some(dir) if dir == dir_path => keep.push(child),
                _ => {
                    tracing::warn!(path = %child.path, dir = %dir_path, "listing entry outside directory, skipped");
                }
            }
        }

        let node = match self.find(dir_path) {
            Some(node) => {
                if !node.is_directory() {
                    return Err(Error::NotADirectory(dir_path.to_string()));
                }
                let new_paths: std::collections::HashSet<&str> =
                    keep.iter().map(|r| r.path.as_str()).collect();
                let stale: Vec<String> = node
                    .children_paths()
                    .into_iter()
                    .filter(|p| !new_paths.contains(p.as_str()))
                    .collect();
                for path in stale {
                    self.erase(&path, true);
                }
                node
            }
            None => self.grow(MetaRecord::directory(dir_path, 0o755, unix_now())),
        };

        self.grow_many(keep);
        let mut inner = self.inner.lock().unwrap();
        inner.current = Arc::downgrade(&node);
        Ok(node)
    }

    /// Atomically move a node to a new path. An existing node at `new_path`
    /// is overwritten (its subtree dropped). Descendant keys are not
    /// rewritten; directory renames are followed by a remote refresh.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        if old_path == new_path {
            return Ok(());
        }
        if is_root(old_path) {
            return Err(Error::InvalidArgument("cannot rename root".to_string()));
        }

        let target_exists = {
            let inner = self.inner.lock().unwrap();
            inner
                .index
                .get(new_path)
                .map(|w| w.upgrade().is_some())
                .unwrap_or(false)
        };
        if target_exists {
            self.erase(new_path, true);
        }

        let mut inner = self.inner.lock().unwrap();
        let Some(node) = inner.index.get(old_path).and_then(|w| w.upgrade()) else {
            tracing::warn!(path = %old_path, "rename of a path not in the tree");
            return Err(Error::NotFound(old_path.to_string()));
        };

        let old_parent = parent_path(old_path);
        let new_parent = parent_path(new_path);
        let same_parent = old_parent == new_parent;

        self.meta.rename(old_path, new_path);
        inner.index.remove(old_path);
        inner
            .index
            .insert(new_path.to_string(), Arc::downgrade(&node));

        if same_parent {
            // rekey in place, preserving the child and the multimap entry
            if let Some(dir) = &old_parent {
                if let Some(parent) = inner.index.get(dir).and_then(|w| w.upgrade()) {
                    parent.rename_child(old_path, new_path);
                }
            }
        } else {
            if let Some(dir) = &old_parent {
                if let Some(parent) = inner.index.get(dir).and_then(|w| w.upgrade()) {
                    parent.remove_child(old_path);
                }
                remove_one(inner.by_parent.entry(dir.clone()).or_default(), &node);
            }
            if let Some(dir) = new_parent {
                if let Some(parent) = inner.index.get(&dir).and_then(|w| w.upgrade()) {
                    parent.insert_child(&node);
                    node.set_parent(&parent);
                }
                inner.by_parent.entry(dir).or_default().push(node.clone());
            }
        }

        if node.is_directory() {
            if let Some(children) = inner.by_parent.remove(old_path) {
                inner
                    .by_parent
                    .entry(new_path.to_string())
                    .or_default()
                    .extend(children);
            }
        }

        inner.current = Arc::downgrade(&node);
        Ok(())
    }

    /// Remove a path. Descendants are erased first (post-order); each erased
    /// node releases its record from the MetaStore once its link count
    /// reaches zero (one for directories).
    pub fn erase(&self, path: &str, recursive: bool) {
        if is_root(path) {
            tracing::error!("refusing to erase root");
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let Some(node) = inner.index.get(path).and_then(|w| w.upgrade()) else {
            inner.index.remove(path);
            return;
        };

        // A hard-link alias maps to a node whose own path differs: drop only
        // the alias and one link.
        if node.path() != path {
            inner.index.remove(path);
            if let Some(dir) = parent_path(path) {
                if let Some(siblings) = inner.by_parent.get_mut(&dir) {
                    remove_one(siblings, &node);
                }
            }
            drop(inner);
            let depleted = {
                let handle = node.meta();
                let mut rec = handle.write().unwrap();
                rec.num_links = rec.num_links.saturating_sub(1);
                rec.num_links == 0
            };
            if depleted {
                self.meta.erase(&node.path());
            }
            return;
        }

        if !recursive && !node.is_empty() {
            tracing::debug!(path = %path, "erasing a non-empty directory node drops its subtree");
        }

        // Post-order: deepest descendants first, then the node itself
        let mut ordered: Vec<Arc<Node>> = Vec::new();
        let mut stack = vec![node.clone()];
        while let Some(n) = stack.pop() {
            ordered.push(n.clone());
            stack.extend(n.children());
        }

        for n in ordered.iter().rev() {
            let n_path = n.path();
            inner.index.remove(&n_path);
            inner.by_parent.remove(&n_path);
            if let Some(dir) = parent_path(&n_path) {
                if let Some(siblings) = inner.by_parent.get_mut(&dir) {
                    remove_one(siblings, n);
                }
            }
        }

        if let Some(parent) = node.parent() {
            parent.remove_child(path);
        }
        drop(inner);

        for n in ordered.iter().rev() {
            let n_path = n.path();
            let release = {
                let handle = n.meta();
                let mut rec = handle.write().unwrap();
                rec.num_links = rec.num_links.saturating_sub(1);
                rec.num_links == 0 || (rec.is_directory() && rec.num_links <= 1)
            };
            if release {
                self.meta.erase(&n_path);
            }
        }
    }

    /// Local-only hard link: a second index entry onto the same node.
    pub fn hard_link(&self, target_path: &str, link_path: &str) -> Result<Arc<Node>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(node) = inner.index.get(target_path).and_then(|w| w.upgrade()) else {
            return Err(Error::NotFound(target_path.to_string()));
        };
        if node.is_directory() {
            return Err(Error::IsADirectory(target_path.to_string()));
        }
        if inner
            .index
            .get(link_path)
            .map(|w| w.upgrade().is_some())
            .unwrap_or(false)
        {
            return Err(Error::AlreadyExists(link_path.to_string()));
        }

        inner
            .index
            .insert(link_path.to_string(), Arc::downgrade(&node));
        if let Some(dir) = parent_path(link_path) {
            inner.by_parent.entry(dir).or_default().push(node.clone());
        }
        node.meta().write().unwrap().num_links += 1;
        inner.current = Arc::downgrade(&node);
        Ok(node)
    }
}

fn remove_one(nodes: &mut Vec<Arc<Node>>, target: &Arc<Node>) {
    if let Some(pos) = nodes.iter().position(|n| Arc::ptr_eq(n, target)) {
        nodes.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::FileKind;

    fn tree() -> DirectoryTree {
        DirectoryTree::new(Arc::new(MetaStore::new(0)), 0, 0, 0o777)
    }

    fn file_record(path: &str, mtime: i64) -> MetaRecord {
        MetaRecord::new(path, 4, mtime, 0, 0, 0o644, FileKind::File)
    }

    fn dir_record(path: &str) -> MetaRecord {
        MetaRecord::directory(path, 0o755, 1)
    }

    #[test]
    fn test_grow_attaches_to_parent() {
        let t = tree();
        t.grow(dir_record("/d"));
        let file = t.grow(file_record("/d/a", 1));
        let dir = t.find("/d/").unwrap();
        assert!(Arc::ptr_eq(&dir.find_child("/d/a").unwrap(), &file));
        assert!(Arc::ptr_eq(&file.parent().unwrap(), &dir));
        assert!(Arc::ptr_eq(&t.current_node().unwrap(), &file));
    }

    #[test]
    fn test_orphan_survives_and_is_adopted() {
        let t = tree();
        // the returned handle is dropped: the multimap must keep the orphan
        t.grow(file_record("/d/a", 1));
        let child = t.find("/d/a").unwrap();
        assert!(child.parent().is_none());

        let dir = t.grow(dir_record("/d"));
        assert!(Arc::ptr_eq(&dir.find_child("/d/a").unwrap(), &child));
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &dir));
    }

    #[test]
    fn test_grow_existing_updates_only_when_newer() {
        let t = tree();
        let node = t.grow(file_record("/f", 5));
        t.grow({
            let mut r = file_record("/f", 3);
            r.size = 99;
            r
        });
        assert_eq!(node.file_size(), 4);

        t.grow({
            let mut r = file_record("/f", 9);
            r.size = 99;
            r
        });
        assert_eq!(node.file_size(), 99);
        assert_eq!(node.mtime(), 9);
    }

    #[test]
    fn test_erase_recursive_post_order() {
        let t = tree();
        t.grow(dir_record("/d"));
        t.grow(dir_record("/d/sub"));
        t.grow(file_record("/d/sub/f", 1));

        t.erase("/d/", true);
        assert!(t.find("/d/").is_none());
        assert!(t.find("/d/sub/").is_none());
        assert!(t.find("/d/sub/f").is_none());
        assert!(t.find("/").is_some());
        assert!(t.find_children("/d/").is_empty());
    }

    #[test]
    fn test_rename_file() {
        let t = tree();
        t.grow(dir_record("/d"));
        let node = t.grow(file_record("/d/a", 1));
        t.rename("/d/a", "/d/c").unwrap();

        assert!(t.find("/d/a").is_none());
        assert!(Arc::ptr_eq(&t.find("/d/c").unwrap(), &node));
        assert_eq!(node.path(), "/d/c");
        let dir = t.find("/d/").unwrap();
        assert!(dir.find_child("/d/a").is_none());
        assert!(dir.find_child("/d/c").is_some());
    }

    #[test]
    fn test_rename_across_directories() {
        let t = tree();
        t.grow(dir_record("/a"));
        t.grow(dir_record("/b"));
        let node = t.grow(file_record("/a/f", 1));
        t.rename("/a/f", "/b/g").unwrap();

        assert!(t.find("/a/f").is_none());
        assert!(Arc::ptr_eq(&t.find("/b/g").unwrap(), &node));
        assert!(t.find("/a/").unwrap().is_empty());
        let target_dir = t.find("/b/").unwrap();
        assert!(target_dir.find_child("/b/g").is_some());
        assert!(Arc::ptr_eq(&node.parent().unwrap(), &target_dir));
        assert!(t.find_children("/a/").is_empty());
        assert_eq!(t.find_children("/b/").len(), 1);
    }

    #[test]
    fn test_rename_overwrites_target() {
        let t = tree();
        t.grow(dir_record("/d"));
        t.grow(file_record("/d/a", 1));
        t.grow(file_record("/d/b", 1));
        t.rename("/d/a", "/d/b").unwrap();
        let dir = t.find("/d/").unwrap();
        assert_eq!(dir.children().len(), 1);
        assert_eq!(t.find("/d/b").unwrap().path(), "/d/b");
        assert_eq!(t.find_children("/d/").len(), 1);
    }

    #[test]
    fn test_hard_link_shares_node() {
        let t = tree();
        t.grow(dir_record("/d"));
        let target = t.grow(file_record("/d/a", 1));
        t.hard_link("/d/a", "/d/lnk").unwrap();

        assert!(Arc::ptr_eq(&t.find("/d/lnk").unwrap(), &target));
        assert_eq!(target.meta().read().unwrap().num_links, 2);

        t.erase("/d/lnk", false);
        assert!(t.find("/d/lnk").is_none());
        assert!(t.find("/d/a").is_some());
        assert_eq!(target.meta().read().unwrap().num_links, 1);
    }

    #[test]
    fn test_update_directory_prunes_stale_children() {
        let t = tree();
        t.grow(dir_record("/d"));
        t.grow(file_record("/d/old", 1));
        t.update_directory("/d/", vec![file_record("/d/new", 2)])
            .unwrap();

        assert!(t.find("/d/old").is_none());
        assert!(t.find("/d/new").is_some());
        let children = t.find_children("/d/");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].path(), "/d/new");
    }
}
