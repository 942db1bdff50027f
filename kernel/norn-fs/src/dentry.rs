//! Dentry arena.
//!
//! Directory entries connect inodes into a navigable tree with parent
//! links and name caches. Dentries live in one arena and refer to each
//! other by index, so the root's self-parent (a 1-cycle) and the
//! cross-tree mount links never form reference-counting cycles.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use crate::Inode;

/// Handle to a dentry in the arena.
pub type DentryId = usize;

/// A directory entry.
pub struct Dentry {
    /// Name of this entry within its parent ("" for tree roots).
    pub name: String,
    /// The inode this entry refers to.
    pub inode: Arc<dyn Inode>,
    /// Parent dentry; tree roots are their own parent.
    pub parent: DentryId,
    /// Root dentry of a filesystem mounted on this entry, if any.
    pub mounted_by: Option<DentryId>,
    /// Cache of looked-up children.
    children: BTreeMap<String, DentryId>,
}

/// Arena of dentries.
pub struct DentryTable {
    arena: alloc::vec::Vec<Dentry>,
}

impl DentryTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            arena: alloc::vec::Vec::new(),
        }
    }

    /// Inserts the root dentry of a filesystem tree: its parent is itself.
    pub fn insert_root(&mut self, inode: Arc<dyn Inode>) -> DentryId {
        let id = self.arena.len();
        self.arena.push(Dentry {
            name: String::new(),
            inode,
            parent: id,
            mounted_by: None,
            children: BTreeMap::new(),
        });
        id
    }

    /// Inserts a child dentry under `parent` and caches it by name.
    pub fn insert_child(&mut self, parent: DentryId, name: &str, inode: Arc<dyn Inode>) -> DentryId {
        let id = self.arena.len();
        self.arena.push(Dentry {
            name: name.to_string(),
            inode,
            parent,
            mounted_by: None,
            children: BTreeMap::new(),
        });
        self.arena[parent].children.insert(name.to_string(), id);
        id
    }

    /// Returns the dentry with the given id.
    pub fn get(&self, id: DentryId) -> &Dentry {
        &self.arena[id]
    }

    /// Returns the dentry mutably.
    pub fn get_mut(&mut self, id: DentryId) -> &mut Dentry {
        &mut self.arena[id]
    }

    /// Looks up a cached child by name.
    pub fn cached_child(&self, parent: DentryId, name: &str) -> Option<DentryId> {
        self.arena[parent].children.get(name).copied()
    }

    /// Returns `true` if `id` is the root of its dentry tree.
    pub fn is_tree_root(&self, id: DentryId) -> bool {
        self.arena[id].parent == id
    }
}

impl Default for DentryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::RamFs;
    use crate::FileSystem;

    #[test]
    fn root_is_its_own_parent() {
        let fs = RamFs::new();
        let mut table = DentryTable::new();
        let root = table.insert_root(fs.root());
        assert_eq!(table.get(root).parent, root);
        assert!(table.is_tree_root(root));
    }

    #[test]
    fn children_are_cached() {
        let fs = RamFs::new();
        let mut table = DentryTable::new();
        let root = table.insert_root(fs.root());
        let child_inode = fs
            .root()
            .create("etc", crate::InodeType::Directory, 0o755)
            .unwrap();
        let child = table.insert_child(root, "etc", child_inode);

        assert_eq!(table.cached_child(root, "etc"), Some(child));
        assert_eq!(table.cached_child(root, "usr"), None);
        assert_eq!(table.get(child).parent, root);
        assert!(!table.is_tree_root(child));
        assert_eq!(table.get(child).name, "etc");
    }
}
