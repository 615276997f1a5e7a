//! Branch table and generation counter.
//!
//! The table is published as an immutable [`BranchTable`] snapshot carrying the
//! generation it was built under. Mutators are serialized by `admin`; each one
//! builds the new branch vector, swaps the snapshot and then stores the new
//! counter value while still holding the write lock, so a reader that observes
//! generation `g` through [`Branches::generation`] can only ever load a snapshot
//! of generation `g` or later.

use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Mutex, RwLock};

use crate::error::{Result, UnionError};
use crate::layer::BranchFs;

pub mod perm;
pub mod xino;

pub use perm::BranchPerm;
pub use xino::{InoAllocator, ROOT_INO, Xino};

/// Position of a branch in the table. Lower positions shadow higher ones.
pub type BIndex = usize;

/// Identity of a branch that survives reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchId(pub u32);

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "br{}", self.0)
    }
}

/// What the administrator hands in to add a branch.
pub struct BranchDesc {
    pub path: PathBuf,
    pub layer: Arc<dyn BranchFs>,
    /// `None` picks [`BranchPerm::default_for`] the insert position.
    pub perm: Option<BranchPerm>,
    pub xino: Option<PathBuf>,
}

impl BranchDesc {
    pub fn new(path: impl Into<PathBuf>, layer: Arc<dyn BranchFs>) -> Self {
        BranchDesc {
            path: path.into(),
            layer,
            perm: None,
            xino: None,
        }
    }

    pub fn perm(mut self, perm: BranchPerm) -> Self {
        self.perm = Some(perm);
        self
    }

    pub fn xino(mut self, path: impl Into<PathBuf>) -> Self {
        self.xino = Some(path.into());
        self
    }
}

pub struct Branch {
    id: BranchId,
    path: PathBuf,
    layer: Arc<dyn BranchFs>,
    perm: AtomicU32,
    count: AtomicUsize,
    xino: Xino,
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("type", &self.layer.fs_type())
            .field("perm", &self.perm().to_string())
            .field("count", &self.count())
            .field("xino", &self.xino.path())
            .finish()
    }
}

impl Branch {
    fn new(id: BranchId, desc: BranchDesc, bindex: BIndex) -> Result<Self> {
        let xino = match &desc.xino {
            Some(path) => Xino::open(path)?,
            None => Xino::memory(),
        };
        let perm = desc.perm.unwrap_or_else(|| BranchPerm::default_for(bindex));
        Ok(Branch {
            id,
            path: desc.path,
            layer: desc.layer,
            perm: AtomicU32::new(perm.bits()),
            count: AtomicUsize::new(0),
            xino,
        })
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layer(&self) -> &Arc<dyn BranchFs> {
        &self.layer
    }

    pub fn perm(&self) -> BranchPerm {
        BranchPerm::from_bits_truncate(self.perm.load(Ordering::Acquire))
    }

    /// Number of open references (open files) on this branch.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn xino(&self) -> &Xino {
        &self.xino
    }
}

/// Counted reference to a branch. The branch cannot be removed while one exists.
#[derive(Debug)]
pub struct BranchRef(Arc<Branch>);

impl BranchRef {
    pub fn new(branch: Arc<Branch>) -> Self {
        branch.count.fetch_add(1, Ordering::AcqRel);
        BranchRef(branch)
    }

    pub fn branch(&self) -> &Arc<Branch> {
        &self.0
    }
}

impl Clone for BranchRef {
    fn clone(&self) -> Self {
        BranchRef::new(self.0.clone())
    }
}

impl Deref for BranchRef {
    type Target = Branch;

    fn deref(&self) -> &Branch {
        &self.0
    }
}

impl Drop for BranchRef {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Immutable view of the branch table at one generation.
#[derive(Debug)]
pub struct BranchTable {
    generation: u64,
    branches: Vec<Arc<Branch>>,
}

impl BranchTable {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn count(&self) -> usize {
        self.branches.len()
    }

    /// Index of the last branch.
    pub fn bend(&self) -> BIndex {
        self.branches.len().saturating_sub(1)
    }

    pub fn get(&self, bindex: BIndex) -> Option<&Arc<Branch>> {
        self.branches.get(bindex)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BIndex, &Arc<Branch>)> {
        self.branches.iter().enumerate()
    }

    pub fn position(&self, id: BranchId) -> Option<BIndex> {
        self.branches.iter().position(|b| b.id == id)
    }
}

pub struct Branches {
    table: RwLock<Arc<BranchTable>>,
    generation: AtomicU64,
    admin: Mutex<()>,
    next_id: AtomicU32,
}

impl Branches {
    pub fn new(descs: Vec<BranchDesc>) -> Result<Self> {
        if descs.is_empty() {
            return Err(UnionError::InvalidConfig("no branch specified".into()));
        }
        let mut paths = HashSet::new();
        let mut branches = Vec::with_capacity(descs.len());
        for (bindex, desc) in descs.into_iter().enumerate() {
            if !paths.insert(desc.path.clone()) {
                return Err(UnionError::InvalidConfig(format!(
                    "branch {} specified twice",
                    desc.path.display()
                )));
            }
            branches.push(Arc::new(Branch::new(
                BranchId(bindex as u32),
                desc,
                bindex,
            )?));
        }
        let next_id = branches.len() as u32;
        Ok(Branches {
            table: RwLock::new(Arc::new(BranchTable {
                generation: 0,
                branches,
            })),
            generation: AtomicU64::new(0),
            admin: Mutex::new(()),
            next_id: AtomicU32::new(next_id),
        })
    }

    /// The current table. The read lock is held only long enough to clone the `Arc`.
    pub async fn snapshot(&self) -> Arc<BranchTable> {
        self.table.read().await.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn count(&self) -> usize {
        self.table.read().await.count()
    }

    pub async fn get(&self, bindex: BIndex) -> Option<Arc<Branch>> {
        self.table.read().await.get(bindex).cloned()
    }

    /// Insert a branch at `bindex`, shifting the branches at and after it down.
    pub async fn add(&self, desc: BranchDesc, bindex: BIndex) -> Result<BIndex> {
        let _admin = self.admin.lock().await;
        let cur = self.snapshot().await;
        if bindex > cur.count() {
            return Err(UnionError::InvalidArgument(format!(
                "branch index {bindex} out of range 0..={}",
                cur.count()
            )));
        }
        if cur.branches.iter().any(|b| b.path == desc.path) {
            return Err(UnionError::InvalidArgument(format!(
                "{} is already a branch",
                desc.path.display()
            )));
        }
        let id = BranchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let branch = Arc::new(Branch::new(id, desc, bindex)?);
        let mut branches = cur.branches.clone();
        branches.insert(bindex, branch.clone());
        let generation = self.publish(branches).await;
        info!(
            "add branch {} {} at b{bindex} ({}), generation {generation}",
            id,
            branch.path.display(),
            branch.perm()
        );
        Ok(bindex)
    }

    /// Remove the branch at `bindex`. Fails with `Busy` while it is referenced.
    pub async fn remove(&self, bindex: BIndex) -> Result<Arc<Branch>> {
        let _admin = self.admin.lock().await;
        let cur = self.snapshot().await;
        let branch = cur.get(bindex).cloned().ok_or_else(|| {
            UnionError::InvalidArgument(format!("no branch at index {bindex}"))
        })?;
        if cur.count() == 1 {
            return Err(UnionError::InvalidArgument(
                "cannot remove the last branch".into(),
            ));
        }
        let count = branch.count();
        if count > 0 {
            debug!("b{bindex} {} busy, {count} references", branch.id);
            return Err(UnionError::Busy { bindex, count });
        }
        let mut branches = cur.branches.clone();
        branches.remove(bindex);
        let generation = self.publish(branches).await;
        info!(
            "del branch {} {} from b{bindex}, generation {generation}",
            branch.id,
            branch.path.display()
        );
        Ok(branch)
    }

    /// New position `i` holds the branch previously at `perm[i]`.
    pub async fn reorder(&self, perm: &[BIndex]) -> Result<()> {
        let _admin = self.admin.lock().await;
        let cur = self.snapshot().await;
        let mut seen = vec![false; cur.count()];
        if perm.len() != cur.count() {
            return Err(UnionError::InvalidArgument(format!(
                "permutation has {} entries, table has {}",
                perm.len(),
                cur.count()
            )));
        }
        for &old in perm {
            match seen.get_mut(old) {
                Some(slot) if !*slot => *slot = true,
                _ => {
                    return Err(UnionError::InvalidArgument(format!(
                        "{perm:?} is not a permutation of 0..{}",
                        cur.count()
                    )));
                }
            }
        }
        let branches = perm.iter().map(|&old| cur.branches[old].clone()).collect();
        let generation = self.publish(branches).await;
        info!("reorder branches {perm:?}, generation {generation}");
        Ok(())
    }

    pub async fn set_perm(&self, bindex: BIndex, perm: BranchPerm) -> Result<()> {
        let _admin = self.admin.lock().await;
        let cur = self.snapshot().await;
        let branch = cur.get(bindex).ok_or_else(|| {
            UnionError::InvalidArgument(format!("no branch at index {bindex}"))
        })?;
        branch.perm.store(perm.bits(), Ordering::Release);
        let generation = self.publish(cur.branches.clone()).await;
        info!(
            "mod branch {} at b{bindex} to {perm}, generation {generation}",
            branch.id
        );
        Ok(())
    }

    /// Swap in the new table, then bump the counter. Callers hold `admin`.
    async fn publish(&self, branches: Vec<Arc<Branch>>) -> u64 {
        let mut table = self.table.write().await;
        let generation = table.generation + 1;
        *table = Arc::new(BranchTable {
            generation,
            branches,
        });
        self.generation.store(generation, Ordering::Release);
        generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::MemoryLayer;

    fn desc(path: &str) -> BranchDesc {
        BranchDesc::new(path, Arc::new(MemoryLayer::new()))
    }

    fn ids(table: &BranchTable) -> Vec<u32> {
        table.iter().map(|(_, b)| b.id().0).collect()
    }

    #[tokio::test]
    async fn test_generation_bumps_once_per_mutation() {
        let branches = Branches::new(vec![desc("/b0"), desc("/b1")]).unwrap();
        assert_eq!(branches.generation(), 0);

        branches.add(desc("/b2"), 2).await.unwrap();
        assert_eq!(branches.generation(), 1);
        branches.reorder(&[2, 0, 1]).await.unwrap();
        assert_eq!(branches.generation(), 2);
        branches
            .set_perm(0, BranchPerm::RO | BranchPerm::WH)
            .await
            .unwrap();
        assert_eq!(branches.generation(), 3);
        branches.remove(1).await.unwrap();
        assert_eq!(branches.generation(), 4);

        let snap = branches.snapshot().await;
        assert_eq!(snap.generation(), 4);
        assert_eq!(ids(&snap), vec![2, 1]);
        assert_eq!(snap.get(0).unwrap().perm(), BranchPerm::RO | BranchPerm::WH);
    }

    #[tokio::test]
    async fn test_rejected_mutations_keep_generation() {
        let branches = Branches::new(vec![desc("/b0")]).unwrap();
        assert!(matches!(
            branches.remove(0).await,
            Err(UnionError::InvalidArgument(_))
        ));
        assert!(branches.add(desc("/b0"), 0).await.is_err());
        assert!(branches.add(desc("/b9"), 5).await.is_err());
        assert!(branches.reorder(&[1]).await.is_err());
        assert!(branches.reorder(&[0, 0]).await.is_err());
        assert!(branches.set_perm(3, BranchPerm::RW).await.is_err());
        assert_eq!(branches.generation(), 0);
        assert!(Branches::new(vec![]).is_err());
        assert!(Branches::new(vec![desc("/x"), desc("/x")]).is_err());
    }

    #[tokio::test]
    async fn test_remove_busy_branch() {
        let branches = Branches::new(vec![desc("/b0"), desc("/b1")]).unwrap();
        let b1 = branches.get(1).await.unwrap();
        let r = BranchRef::new(b1.clone());
        let r2 = r.clone();
        assert_eq!(b1.count(), 2);

        match branches.remove(1).await {
            Err(UnionError::Busy { bindex, count }) => {
                assert_eq!(bindex, 1);
                assert_eq!(count, 2);
            }
            other => panic!("expected Busy, got {other:?}"),
        }
        assert_eq!(branches.generation(), 0);

        drop(r);
        drop(r2);
        assert_eq!(b1.count(), 0);
        let removed = branches.remove(1).await.unwrap();
        assert_eq!(removed.id(), BranchId(1));
        assert_eq!(branches.count().await, 1);
    }

    #[tokio::test]
    async fn test_add_defaults_and_ids() {
        let branches = Branches::new(vec![desc("/b0")]).unwrap();
        assert_eq!(branches.add(desc("/top"), 0).await.unwrap(), 0);
        let snap = branches.snapshot().await;
        assert_eq!(ids(&snap), vec![1, 0]);
        assert_eq!(snap.get(0).unwrap().perm(), BranchPerm::RW);
        assert_eq!(snap.position(BranchId(0)), Some(1));
        assert_eq!(snap.bend(), 1);
    }
}
