//! The merge pass: one scan over a directory's branches, top to bottom.

use std::os::unix::ffi::OsStrExt;

use super::{DeblkWriter, VDir};
use crate::branch::{Branch, BIndex, BranchTable, InoAllocator};
use crate::error::{Result, UnionError};
use crate::layer::{Inode, NAME_MAX};
use crate::shadow::{Backing, DentryInfo};
use crate::whiteout::{WhiteoutSet, nbuckets_for};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Block size in bytes, 0 for the default.
    pub rdblk: usize,
    /// Whiteout hash buckets, 0 to estimate from the directory sizes.
    pub rdhash: usize,
}

struct MergePass<'a> {
    table: &'a BranchTable,
    inos: &'a InoAllocator,
    whs: WhiteoutSet,
    out: DeblkWriter,
}

impl<'a> MergePass<'a> {
    async fn init(
        table: &'a BranchTable,
        dinfo: &DentryInfo,
        inos: &'a InoAllocator,
        opts: MergeOptions,
    ) -> Self {
        let nbuckets = if opts.rdhash > 0 {
            opts.rdhash
        } else {
            let mut expected = 0;
            for (bindex, h) in dinfo.shadow().reals() {
                if let Some(branch) = table.get(bindex) {
                    expected += branch.layer().entry_count_hint(h.ino).await.unwrap_or(0);
                }
            }
            nbuckets_for(expected)
        };
        MergePass {
            table,
            inos,
            whs: WhiteoutSet::with_buckets(nbuckets),
            out: DeblkWriter::new(opts.rdblk),
        }
    }

    /// Emit the real entries of one branch, then record its whiteouts. A
    /// whiteout only hides names of lower branches, never a sibling.
    async fn scan(&mut self, bindex: BIndex, branch: &Branch, dir: Inode) -> Result<()> {
        let (whiteouts, reals): (Vec<_>, Vec<_>) = branch
            .layer()
            .readdir(dir)
            .await?
            .into_iter()
            .partition(|e| e.kind.is_whiteout());

        for entry in reals {
            let name = entry.name.as_bytes();
            if !self.fits(bindex, name) || !self.whs.test_and_insert(name, bindex, false) {
                continue;
            }
            let ino = branch.xino().get_or_alloc(entry.ino, self.inos).await?;
            self.out.push(ino, bindex, entry.kind, name)?;
        }

        if whiteouts.is_empty() {
            return Ok(());
        }
        if !branch.perm().is_whable() {
            warn!(
                "{} whiteouts on b{bindex} ignored, {} is {}",
                whiteouts.len(),
                branch.id(),
                branch.perm()
            );
            return Ok(());
        }
        for wh in whiteouts {
            let name = wh.name.as_bytes();
            if self.fits(bindex, name) {
                self.whs.test_and_insert(name, bindex, true);
            }
        }
        Ok(())
    }

    fn fits(&self, bindex: BIndex, name: &[u8]) -> bool {
        if name.len() > NAME_MAX {
            warn!(
                "skip {:?} on b{bindex}, name is {} bytes",
                String::from_utf8_lossy(name),
                name.len()
            );
            return false;
        }
        true
    }

    fn finish(self) -> VDir {
        trace!(
            "merge done, {} names over {} buckets (depth {})",
            self.whs.len(),
            self.whs.nbuckets(),
            self.whs.max_depth()
        );
        self.out.finish(self.table.generation())
    }
}

/// Merge the real directories of `dinfo` into one listing.
///
/// Branches are scanned in ascending order. The first branch to mention a
/// name decides it: a whiteout hides it from every lower branch, a real entry
/// is emitted once. `dinfo` must have been resolved against `table`.
pub async fn build(
    table: &BranchTable,
    dinfo: &DentryInfo,
    inos: &InoAllocator,
    opts: MergeOptions,
) -> Result<VDir> {
    match dinfo.shadow().backing() {
        Backing::Absent => return Ok(VDir::empty(table.generation(), opts.rdblk)),
        Backing::Unresolved => {
            return Err(UnionError::invalid_range(
                "merge of an unresolved directory",
            ));
        }
        Backing::Range { .. } => {}
    }
    let mut pass = MergePass::init(table, dinfo, inos, opts).await;
    for (bindex, h) in dinfo.shadow().reals() {
        if !h.kind.is_dir() {
            continue;
        }
        let branch = table.get(bindex).ok_or_else(|| {
            UnionError::invalid_range(format!(
                "b{bindex} past table end ({} branches)",
                table.count()
            ))
        })?;
        pass.scan(bindex, branch, h.ino).await?;
    }
    let vdir = pass.finish();
    debug!(
        "merged {} entries in {} blocks at generation {}",
        vdir.len(),
        vdir.nblk(),
        vdir.generation()
    );
    Ok(vdir)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::io;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::branch::{BranchDesc, BranchPerm, Branches};
    use crate::layer::{BranchFs, EntryKind, MemoryLayer, RealAttr, RealEntry};

    async fn root_of(layers: &[(Arc<MemoryLayer>, BranchPerm)]) -> (Arc<BranchTable>, DentryInfo) {
        let descs = layers
            .iter()
            .enumerate()
            .map(|(i, (l, p))| BranchDesc::new(format!("/b{i}"), l.clone()).perm(*p))
            .collect();
        let table = Branches::new(descs).unwrap().snapshot().await;
        let root = DentryInfo::root(&table);
        (table, root)
    }

    fn listed(vdir: &VDir) -> Vec<(String, EntryKind, BIndex)> {
        vdir.entries()
            .unwrap()
            .into_iter()
            .map(|e| (e.name.to_string_lossy().into_owned(), e.kind, e.bindex))
            .collect()
    }

    #[tokio::test]
    async fn test_whiteout_and_shadowing() {
        let b0 = Arc::new(MemoryLayer::new());
        let b1 = Arc::new(MemoryLayer::new());
        b0.create_file("a", 0).await.unwrap();
        b0.create_whiteout("b").await.unwrap();
        b0.create_file("same", 1).await.unwrap();
        b1.create_file("b", 0).await.unwrap();
        b1.mkdir_p("c").await.unwrap();
        b1.create_file("same", 2).await.unwrap();
        let (table, root) = root_of(&[(b0, BranchPerm::RW), (b1, BranchPerm::RO)]).await;

        let inos = InoAllocator::default();
        let vdir = build(&table, &root, &inos, MergeOptions::default())
            .await
            .unwrap();
        assert_eq!(
            listed(&vdir),
            vec![
                ("a".to_string(), EntryKind::File, 0),
                ("same".to_string(), EntryKind::File, 0),
                ("c".to_string(), EntryKind::Dir, 1),
            ]
        );
        let again = build(&table, &root, &inos, MergeOptions::default())
            .await
            .unwrap();
        assert_eq!(vdir, again);
    }

    /// Lists a whiteout ahead of every real entry of the wrapped layer, the
    /// way a host directory holding both `x` and `.wh.x` may report them.
    struct SiblingWhiteouts(MemoryLayer);

    #[async_trait]
    impl BranchFs for SiblingWhiteouts {
        fn fs_type(&self) -> &'static str {
            "sibling-whiteouts"
        }

        fn root_inode(&self) -> Inode {
            self.0.root_inode()
        }

        async fn lookup(&self, parent: Inode, name: &OsStr) -> io::Result<Option<RealEntry>> {
            self.0.lookup(parent, name).await
        }

        async fn getattr(&self, ino: Inode) -> io::Result<RealAttr> {
            self.0.getattr(ino).await
        }

        async fn readdir(&self, dir: Inode) -> io::Result<Vec<RealEntry>> {
            let reals = self.0.readdir(dir).await?;
            let mut out: Vec<_> = reals
                .iter()
                .map(|e| RealEntry::whiteout(e.name.clone()))
                .collect();
            out.extend(reals);
            Ok(out)
        }

        async fn is_opaque(&self, dir: Inode) -> io::Result<bool> {
            self.0.is_opaque(dir).await
        }

        async fn open(&self, ino: Inode, flags: u32) -> io::Result<u64> {
            self.0.open(ino, flags).await
        }

        async fn release(&self, ino: Inode, fh: u64) -> io::Result<()> {
            self.0.release(ino, fh).await
        }
    }

    #[tokio::test]
    async fn test_whiteout_hides_lower_branches_only() {
        let upper = SiblingWhiteouts(MemoryLayer::new());
        for i in 0..40 {
            upper.0.create_file(format!("n{i:02}"), 1).await.unwrap();
        }
        let lower = Arc::new(MemoryLayer::new());
        lower.create_file("n00", 2).await.unwrap();
        lower.create_file("z", 0).await.unwrap();
        let descs = vec![
            BranchDesc::new("/upper", Arc::new(upper)).perm(BranchPerm::RW),
            BranchDesc::new("/lower", lower).perm(BranchPerm::RO),
        ];
        let table = Branches::new(descs).unwrap().snapshot().await;
        let root = DentryInfo::root(&table);
        let vdir = build(&table, &root, &InoAllocator::default(), MergeOptions::default())
            .await
            .unwrap();
        let entries = listed(&vdir);
        assert_eq!(entries.len(), 41);
        assert!(entries[..40].iter().all(|e| e.2 == 0));
        assert_eq!(entries[40], ("z".to_string(), EntryKind::File, 1));
    }

    #[tokio::test]
    async fn test_whiteout_on_plain_ro_is_ignored() {
        let b0 = Arc::new(MemoryLayer::new());
        let b1 = Arc::new(MemoryLayer::new());
        let b2 = Arc::new(MemoryLayer::new());
        b1.create_whiteout("x").await.unwrap();
        b2.create_file("x", 0).await.unwrap();
        let (table, root) = root_of(&[
            (b0, BranchPerm::RW),
            (b1, BranchPerm::RO),
            (b2, BranchPerm::RO),
        ])
        .await;
        let vdir = build(&table, &root, &InoAllocator::default(), MergeOptions::default())
            .await
            .unwrap();
        assert_eq!(
            listed(&vdir),
            vec![("x".to_string(), EntryKind::File, 2)]
        );
    }

    #[tokio::test]
    async fn test_absent_dir_is_empty_listing() {
        let b0 = Arc::new(MemoryLayer::new());
        let (table, root) = root_of(&[(b0, BranchPerm::RW)]).await;
        let gone = DentryInfo::lookup(&table, &root, OsStr::new("gone"))
            .await
            .unwrap();
        let vdir = build(&table, &gone, &InoAllocator::default(), MergeOptions::default())
            .await
            .unwrap();
        assert!(vdir.is_empty());
        assert_eq!(vdir.nblk(), 0);

        assert!(
            build(
                &table,
                &DentryInfo::default(),
                &InoAllocator::default(),
                MergeOptions::default()
            )
            .await
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_fixed_rdhash_and_small_blocks() {
        let b0 = Arc::new(MemoryLayer::new());
        let b1 = Arc::new(MemoryLayer::new());
        for i in 0..50 {
            b0.create_file(format!("f{i:02}"), 0).await.unwrap();
            b1.create_file(format!("f{:02}", i + 25), 0).await.unwrap();
        }
        let (table, root) = root_of(&[(b0, BranchPerm::RW), (b1, BranchPerm::RO)]).await;
        let opts = MergeOptions {
            rdblk: 1,
            rdhash: 1,
        };
        let vdir = build(&table, &root, &InoAllocator::default(), opts)
            .await
            .unwrap();
        assert_eq!(vdir.len(), 75);
        assert!(vdir.nblk() > 1);
        let from_b1 = listed(&vdir).iter().filter(|e| e.2 == 1).count();
        assert_eq!(from_b1, 25);
    }
}
