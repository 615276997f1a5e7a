//! In-memory branch filesystem.
//!
//! Directories keep their children in a `BTreeMap`, so `readdir` is sorted by
//! name. Whiteouts live beside the real children and are listed in the same
//! order. An optional latency is applied to every lookup and readdir to model a
//! branch whose storage blocks.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Component, Path};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{BranchFs, EntryKind, Inode, RealAttr, RealEntry, not_dir, not_found};

const ROOT_INO: Inode = 1;

#[derive(Debug)]
struct Node {
    kind: EntryKind,
    size: u64,
    opaque: bool,
    /// name -> child inode, or `None` for a whiteout.
    children: BTreeMap<OsString, Option<Inode>>,
}

impl Node {
    fn new(kind: EntryKind) -> Self {
        Node {
            kind,
            size: 0,
            opaque: false,
            children: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<Inode, Node>,
    next_ino: Inode,
}

impl Tree {
    fn node(&self, ino: Inode) -> io::Result<&Node> {
        self.nodes.get(&ino).ok_or_else(not_found)
    }

    fn dir_mut(&mut self, ino: Inode) -> io::Result<&mut Node> {
        let node = self.nodes.get_mut(&ino).ok_or_else(not_found)?;
        if !node.kind.is_dir() {
            return Err(not_dir());
        }
        Ok(node)
    }

    fn alloc(&mut self, kind: EntryKind) -> Inode {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, Node::new(kind));
        ino
    }

    /// Walk to the directory holding the last component, creating missing
    /// directories on the way when `create` is set.
    fn walk_parent<'p>(&mut self, path: &'p Path, create: bool) -> io::Result<(Inode, &'p OsStr)> {
        let mut parts: Vec<&OsStr> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(n) => Some(n),
                _ => None,
            })
            .collect();
        let name = parts
            .pop()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let mut cur = ROOT_INO;
        for part in parts {
            let next = self.dir_mut(cur)?.children.get(part).copied().flatten();
            cur = match next {
                Some(ino) => ino,
                None if create => {
                    let ino = self.alloc(EntryKind::Dir);
                    self.dir_mut(cur)?.children.insert(part.to_owned(), Some(ino));
                    ino
                }
                None => return Err(not_found()),
            };
        }
        Ok((cur, name))
    }

    fn insert(&mut self, path: &Path, kind: EntryKind, size: u64) -> io::Result<Inode> {
        let (parent, name) = self.walk_parent(path, true)?;
        if let Some(Some(ino)) = self.dir_mut(parent)?.children.get(name).copied() {
            if self.node(ino)?.kind == kind {
                return Ok(ino);
            }
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        let ino = self.alloc(kind);
        if let Some(node) = self.nodes.get_mut(&ino) {
            node.size = size;
        }
        self.dir_mut(parent)?
            .children
            .insert(name.to_owned(), Some(ino));
        Ok(ino)
    }

    fn lookup_path(&self, path: &Path) -> io::Result<Inode> {
        let mut cur = ROOT_INO;
        for c in path.components() {
            if let Component::Normal(part) = c {
                let node = self.node(cur)?;
                cur = node
                    .children
                    .get(part)
                    .copied()
                    .flatten()
                    .ok_or_else(not_found)?;
            }
        }
        Ok(cur)
    }
}

#[derive(Debug)]
pub struct MemoryLayer {
    tree: Mutex<Tree>,
    latency: Option<Duration>,
    next_fh: AtomicU64,
    open_handles: Mutex<HashMap<u64, Inode>>,
}

impl Default for MemoryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLayer {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::new(EntryKind::Dir));
        MemoryLayer {
            tree: Mutex::new(Tree {
                nodes,
                next_ino: ROOT_INO + 1,
            }),
            latency: None,
            next_fh: AtomicU64::new(1),
            open_handles: Mutex::new(HashMap::new()),
        }
    }

    /// Sleep this long in every lookup and readdir.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// mkdir -p.
    pub async fn mkdir_p(&self, path: impl AsRef<Path>) -> io::Result<Inode> {
        self.tree
            .lock()
            .await
            .insert(path.as_ref(), EntryKind::Dir, 0)
    }

    /// Create a regular file, creating missing parent directories.
    pub async fn create_file(&self, path: impl AsRef<Path>, size: u64) -> io::Result<Inode> {
        self.tree
            .lock()
            .await
            .insert(path.as_ref(), EntryKind::File, size)
    }

    pub async fn create_symlink(&self, path: impl AsRef<Path>) -> io::Result<Inode> {
        self.tree
            .lock()
            .await
            .insert(path.as_ref(), EntryKind::Symlink, 0)
    }

    /// Create whiteout for `path`. Fails with EEXIST if a real entry already has
    /// that name in this layer.
    pub async fn create_whiteout(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut tree = self.tree.lock().await;
        let (parent, name) = tree.walk_parent(path.as_ref(), true)?;
        let dir = tree.dir_mut(parent)?;
        match dir.children.get(name) {
            Some(Some(_)) => Err(io::Error::from_raw_os_error(libc::EEXIST)),
            Some(None) => Ok(()),
            None => {
                dir.children.insert(name.to_owned(), None);
                Ok(())
            }
        }
    }

    /// Delete whiteout for `path`. A real entry with that name is EINVAL.
    pub async fn delete_whiteout(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut tree = self.tree.lock().await;
        let (parent, name) = tree.walk_parent(path.as_ref(), false)?;
        let dir = tree.dir_mut(parent)?;
        match dir.children.get(name) {
            Some(None) => {
                dir.children.remove(name);
                Ok(())
            }
            Some(Some(_)) => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            None => Err(not_found()),
        }
    }

    /// Set the directory to opaque.
    pub async fn set_opaque(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut tree = self.tree.lock().await;
        let ino = tree.lookup_path(path.as_ref())?;
        tree.dir_mut(ino)?.opaque = true;
        Ok(())
    }

    /// Remove an entry (and, for directories, everything below it).
    pub async fn remove(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut tree = self.tree.lock().await;
        let (parent, name) = tree.walk_parent(path.as_ref(), false)?;
        let removed = tree
            .dir_mut(parent)?
            .children
            .remove(name)
            .ok_or_else(not_found)?;
        let mut pending: Vec<Inode> = removed.into_iter().collect();
        while let Some(ino) = pending.pop() {
            if let Some(node) = tree.nodes.remove(&ino) {
                pending.extend(node.children.values().flatten().copied());
            }
        }
        Ok(())
    }

    /// Number of handles opened and not yet released.
    pub async fn open_count(&self) -> usize {
        self.open_handles.lock().await.len()
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl BranchFs for MemoryLayer {
    fn fs_type(&self) -> &'static str {
        "memory"
    }

    fn root_inode(&self) -> Inode {
        ROOT_INO
    }

    async fn lookup(&self, parent: Inode, name: &OsStr) -> io::Result<Option<RealEntry>> {
        self.delay().await;
        let tree = self.tree.lock().await;
        let dir = tree.node(parent)?;
        if !dir.kind.is_dir() {
            return Err(not_dir());
        }
        let entry = match dir.children.get(name) {
            None => None,
            Some(None) => Some(RealEntry::whiteout(name)),
            Some(Some(ino)) => Some(RealEntry {
                name: name.to_owned(),
                ino: *ino,
                kind: tree.node(*ino)?.kind,
            }),
        };
        Ok(entry)
    }

    async fn getattr(&self, ino: Inode) -> io::Result<RealAttr> {
        let tree = self.tree.lock().await;
        let node = tree.node(ino)?;
        let (mode, nlink) = match node.kind {
            EntryKind::Dir => {
                let subdirs = node
                    .children
                    .values()
                    .flatten()
                    .filter(|c| tree.nodes.get(*c).is_some_and(|n| n.kind.is_dir()))
                    .count() as u64;
                (libc::S_IFDIR | 0o755, 2 + subdirs)
            }
            EntryKind::Symlink => (libc::S_IFLNK | 0o777, 1),
            _ => (libc::S_IFREG | 0o644, 1),
        };
        Ok(RealAttr {
            ino,
            kind: node.kind,
            mode,
            size: node.size,
            nlink,
            mtime: 0,
        })
    }

    async fn readdir(&self, dir: Inode) -> io::Result<Vec<RealEntry>> {
        self.delay().await;
        let tree = self.tree.lock().await;
        let node = tree.node(dir)?;
        if !node.kind.is_dir() {
            return Err(not_dir());
        }
        node.children
            .iter()
            .map(|(name, child)| match child {
                None => Ok(RealEntry::whiteout(name.clone())),
                Some(ino) => Ok(RealEntry {
                    name: name.clone(),
                    ino: *ino,
                    kind: tree.node(*ino)?.kind,
                }),
            })
            .collect()
    }

    async fn is_opaque(&self, dir: Inode) -> io::Result<bool> {
        let tree = self.tree.lock().await;
        let node = tree.node(dir)?;
        if !node.kind.is_dir() {
            return Err(not_dir());
        }
        Ok(node.opaque)
    }

    async fn open(&self, ino: Inode, _flags: u32) -> io::Result<u64> {
        self.tree.lock().await.node(ino)?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_handles.lock().await.insert(fh, ino);
        Ok(fh)
    }

    async fn release(&self, ino: Inode, fh: u64) -> io::Result<()> {
        match self.open_handles.lock().await.remove(&fh) {
            Some(opened) if opened == ino => Ok(()),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    async fn entry_count_hint(&self, dir: Inode) -> Option<usize> {
        let tree = self.tree.lock().await;
        tree.nodes.get(&dir).map(|n| n.children.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_and_readdir_order() {
        let layer = MemoryLayer::new();
        layer.create_file("b", 3).await.unwrap();
        layer.mkdir_p("a/x").await.unwrap();
        layer.create_whiteout("c").await.unwrap();

        let root = layer.root_inode();
        let names: Vec<_> = layer
            .readdir(root)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                (OsString::from("a"), EntryKind::Dir),
                (OsString::from("b"), EntryKind::File),
                (OsString::from("c"), EntryKind::Whiteout),
            ]
        );

        let a = layer.lookup(root, OsStr::new("a")).await.unwrap().unwrap();
        assert!(a.kind.is_dir());
        let x = layer.lookup(a.ino, OsStr::new("x")).await.unwrap().unwrap();
        assert!(x.kind.is_dir());
        assert!(layer.lookup(root, OsStr::new("nope")).await.unwrap().is_none());
        let wh = layer.lookup(root, OsStr::new("c")).await.unwrap().unwrap();
        assert!(wh.kind.is_whiteout());

        let attr = layer.getattr(a.ino).await.unwrap();
        assert_eq!(attr.nlink, 3);
        let attr = layer
            .getattr(layer.lookup(root, OsStr::new("b")).await.unwrap().unwrap().ino)
            .await
            .unwrap();
        assert_eq!(attr.size, 3);
    }

    #[tokio::test]
    async fn test_whiteout_create_delete() {
        let layer = MemoryLayer::new();
        layer.create_file("f", 0).await.unwrap();
        let err = layer.create_whiteout("f").await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));

        layer.create_whiteout("g").await.unwrap();
        let err = layer.delete_whiteout("f").await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        layer.delete_whiteout("g").await.unwrap();
        let root = layer.root_inode();
        assert!(layer.lookup(root, OsStr::new("g")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_opaque_on_non_directory() {
        let layer = MemoryLayer::new();
        layer.create_file("not_a_dir", 0).await.unwrap();
        let err = layer.set_opaque("not_a_dir").await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));

        layer.mkdir_p("d").await.unwrap();
        layer.set_opaque("d").await.unwrap();
        let d = layer
            .lookup(layer.root_inode(), OsStr::new("d"))
            .await
            .unwrap()
            .unwrap();
        assert!(layer.is_opaque(d.ino).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_subtree_and_handles() {
        let layer = MemoryLayer::new();
        let f = layer.create_file("d/e/f", 1).await.unwrap();
        let fh = layer.open(f, 0).await.unwrap();
        assert_eq!(layer.open_count().await, 1);
        layer.release(f, fh).await.unwrap();
        assert_eq!(layer.open_count().await, 0);
        assert!(layer.release(f, fh).await.is_err());

        layer.remove("d").await.unwrap();
        assert!(layer.getattr(f).await.is_err());
        assert!(
            layer
                .lookup(layer.root_inode(), OsStr::new("d"))
                .await
                .unwrap()
                .is_none()
        );
    }
}
