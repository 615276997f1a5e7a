use futures::future::try_join_all;

use super::{DentryInfo, ShadowArray, Slot};
use crate::branch::{BIndex, BranchTable, InoAllocator, ROOT_INO};
use crate::error::{Result, UnionError};
use crate::layer::{EntryKind, Inode, RealAttr};

/// A real inode and the attributes it reported when the info was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HInode {
    pub ino: Inode,
    pub attr: RealAttr,
}

#[derive(Debug, Clone)]
pub struct InodeInfo {
    /// Union-wide inode number.
    ino: u64,
    shadow: ShadowArray<HInode>,
}

impl InodeInfo {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn shadow(&self) -> &ShadowArray<HInode> {
        &self.shadow
    }

    pub fn generation(&self) -> u64 {
        self.shadow.generation()
    }

    pub fn is_stale(&self, current: u64) -> bool {
        self.shadow.is_stale(current)
    }

    /// Build the metadata info of a resolved dentry. `dinfo` must have been
    /// built against `table`.
    pub(crate) async fn build(
        table: &BranchTable,
        dinfo: &DentryInfo,
        inos: &InoAllocator,
        is_root: bool,
    ) -> Result<Self> {
        let (start, _) = dinfo.shadow().range()?;
        let is_dir = dinfo.is_dir();
        let targets: Vec<(BIndex, Inode)> = dinfo
            .shadow()
            .reals()
            .take(if is_dir { usize::MAX } else { 1 })
            .map(|(bindex, h)| (bindex, h.ino))
            .collect();

        let attrs = try_join_all(targets.iter().map(|&(bindex, h_ino)| async move {
            let branch = table
                .get(bindex)
                .ok_or_else(|| UnionError::invalid_range(format!("b{bindex} past table end")))?;
            let attr = branch.layer().getattr(h_ino).await?;
            Ok::<_, UnionError>((bindex, HInode { ino: h_ino, attr }))
        }))
        .await?;

        let ino = if is_root {
            ROOT_INO
        } else {
            let top = table
                .get(start)
                .ok_or_else(|| UnionError::invalid_range(format!("b{start} past table end")))?;
            top.xino().get_or_alloc(targets[0].1, inos).await?
        };

        let mut shadow = ShadowArray::building(table.count(), table.generation());
        for (bindex, h) in attrs {
            shadow.set(bindex, Slot::Real(h));
        }
        shadow.seal();
        debug!(
            "inode {ino} built at generation {}, {:?}",
            shadow.generation(),
            shadow.backing()
        );
        Ok(InodeInfo { ino, shadow })
    }

    /// Attributes as the union reports them.
    pub fn attr(&self) -> Result<RealAttr> {
        let mut reals = self.shadow.reals();
        let (_, top) = reals.next().ok_or_else(|| {
            UnionError::invalid_range(format!("inode {} has no real inode", self.ino))
        })?;
        let mut attr = top.attr.clone();
        attr.ino = self.ino;
        if attr.kind == EntryKind::Dir {
            for (_, lower) in reals {
                attr.nlink += lower.attr.nlink.saturating_sub(2);
            }
        }
        Ok(attr)
    }
}
