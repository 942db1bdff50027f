//! VFS: mount table and dentry-walking path resolution.
//!
//! The VFS owns the dentry arena and a mount table. Resolution walks path
//! components against cached dentries, falling back to [`Inode::lookup`]
//! for misses; arriving at a mount point transparently crosses into the
//! mounted filesystem's root, and `..` at a mounted root crosses back.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::dentry::{DentryId, DentryTable};
use crate::{FileSystem, FsError, Inode, InodeType, path};

/// One mounted filesystem.
struct Mount {
    /// Absolute mount path (diagnostics only).
    path: String,
    /// The filesystem instance.
    fs: Arc<dyn FileSystem>,
    /// The dentry this mount covers.
    covered: DentryId,
    /// The mounted filesystem's root dentry.
    root_dentry: DentryId,
}

/// The virtual filesystem.
pub struct Vfs {
    dentries: DentryTable,
    mounts: Vec<Mount>,
    root: DentryId,
}

impl Vfs {
    /// Creates a VFS with `root_fs` mounted at `/`.
    pub fn new(root_fs: Arc<dyn FileSystem>) -> Self {
        let mut dentries = DentryTable::new();
        let root = dentries.insert_root(root_fs.root());
        let mounts = alloc::vec![Mount {
            path: "/".to_string(),
            fs: root_fs,
            covered: root,
            root_dentry: root,
        }];
        Self {
            dentries,
            mounts,
            root,
        }
    }

    /// The root dentry.
    pub fn root(&self) -> DentryId {
        self.root
    }

    /// Mounts `fs` on the directory at `mount_path`.
    pub fn mount(&mut self, mount_path: &str, fs: Arc<dyn FileSystem>) -> Result<(), FsError> {
        let covered = self.resolve(mount_path, self.root)?;
        if self.dentries.get(covered).inode.inode_type() != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }
        if self.dentries.get(covered).mounted_by.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let root_dentry = self.dentries.insert_root(fs.root());
        self.dentries.get_mut(covered).mounted_by = Some(root_dentry);
        self.mounts.push(Mount {
            path: mount_path.to_string(),
            fs,
            covered,
            root_dentry,
        });
        Ok(())
    }

    /// Resolves a path to a dentry. Relative paths start at `cwd`.
    pub fn resolve(&mut self, p: &str, cwd: DentryId) -> Result<DentryId, FsError> {
        if p.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let mut cur = if path::is_absolute(p) { self.root } else { cwd };
        cur = self.cross_mount(cur);
        for component in path::components(p) {
            cur = match component {
                "." => cur,
                ".." => self.parent_of(cur),
                name => self.lookup_child(cur, name)?,
            };
        }
        Ok(cur)
    }

    /// Resolves `p` up to its final component, returning the parent dentry
    /// and the final name. Used by `O_CREAT` opens.
    pub fn resolve_parent<'p>(
        &mut self,
        p: &'p str,
        cwd: DentryId,
    ) -> Result<(DentryId, &'p str), FsError> {
        let (dir, name) = path::split_parent(p).ok_or(FsError::InvalidArgument)?;
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument);
        }
        let parent = if dir.is_empty() {
            self.cross_mount(cwd)
        } else {
            self.resolve(dir, cwd)?
        };
        Ok((parent, name))
    }

    /// Returns the inode behind a dentry.
    pub fn inode(&self, id: DentryId) -> Arc<dyn Inode> {
        self.dentries.get(id).inode.clone()
    }

    /// Looks up `name` in the directory at `dir`, creating a dentry on
    /// cache miss and crossing any mount on the result.
    pub fn lookup_child(&mut self, dir: DentryId, name: &str) -> Result<DentryId, FsError> {
        if self.dentries.get(dir).inode.inode_type() != InodeType::Directory {
            return Err(FsError::NotDirectory);
        }
        let id = match self.dentries.cached_child(dir, name) {
            Some(id) => id,
            None => {
                let inode = self.dentries.get(dir).inode.lookup(name)?;
                self.dentries.insert_child(dir, name, inode)
            }
        };
        Ok(self.cross_mount(id))
    }

    /// Creates a file or directory at `name` under `dir` and returns its
    /// dentry.
    pub fn create_child(
        &mut self,
        dir: DentryId,
        name: &str,
        itype: InodeType,
        mode: u32,
    ) -> Result<DentryId, FsError> {
        let inode = self.dentries.get(dir).inode.create(name, itype, mode)?;
        Ok(self.dentries.insert_child(dir, name, inode))
    }

    /// Builds the absolute path of a dentry by walking parent links,
    /// crossing mount boundaries on the way up.
    pub fn path_of(&self, id: DentryId) -> String {
        let mut names: Vec<&str> = Vec::new();
        let mut cur = id;
        loop {
            if self.dentries.is_tree_root(cur) {
                match self.covered_of(cur) {
                    Some(covered) if covered != cur => cur = covered,
                    _ => break,
                }
            } else {
                names.push(&self.dentries.get(cur).name);
                cur = self.dentries.get(cur).parent;
            }
        }
        if names.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for name in names.iter().rev() {
            out.push('/');
            out.push_str(name);
        }
        out
    }

    /// Logs the mount table.
    pub fn dump_mounts(&self) {
        for mount in &self.mounts {
            norn_core::kinfo!("vfs: {} mounted at {}", mount.fs.name(), mount.path);
        }
    }

    /// Follows mount links downward: a dentry covered by a mount resolves
    /// to the mounted filesystem's root.
    fn cross_mount(&self, mut id: DentryId) -> DentryId {
        while let Some(root) = self.dentries.get(id).mounted_by {
            id = root;
        }
        id
    }

    /// Returns the dentry covered by the mount whose root is `id`.
    fn covered_of(&self, id: DentryId) -> Option<DentryId> {
        self.mounts
            .iter()
            .find(|m| m.root_dentry == id)
            .map(|m| m.covered)
    }

    /// `..` semantics: tree roots cross back to the covered dentry's
    /// parent; the global root is its own parent.
    fn parent_of(&self, id: DentryId) -> DentryId {
        if self.dentries.is_tree_root(id) {
            match self.covered_of(id) {
                Some(covered) if covered != id => self.dentries.get(covered).parent,
                _ => id,
            }
        } else {
            self.dentries.get(id).parent
        }
    }
}
