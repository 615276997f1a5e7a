use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{InodeInfo, ShadowArray, Slot};
use crate::branch::{BIndex, BranchTable};
use crate::error::Result;
use crate::layer::{EntryKind, Inode};

/// A directory entry as one branch sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HDentry {
    pub ino: Inode,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Default)]
pub struct DentryInfo {
    shadow: ShadowArray<HDentry>,
    /// Branch whose whiteout ended the search.
    bwh: Option<BIndex>,
    /// Branch whose opaque directory ended the search.
    bdiropq: Option<BIndex>,
}

impl DentryInfo {
    pub fn shadow(&self) -> &ShadowArray<HDentry> {
        &self.shadow
    }

    pub fn generation(&self) -> u64 {
        self.shadow.generation()
    }

    pub fn is_stale(&self, current: u64) -> bool {
        self.shadow.is_stale(current)
    }

    pub fn bwh(&self) -> Option<BIndex> {
        self.bwh
    }

    pub fn bdiropq(&self) -> Option<BIndex> {
        self.bdiropq
    }

    /// Kind of the topmost real entry.
    pub fn kind(&self) -> Option<EntryKind> {
        self.shadow.reals().next().map(|(_, h)| h.kind)
    }

    pub fn is_dir(&self) -> bool {
        self.kind().is_some_and(EntryKind::is_dir)
    }

    /// The root directory is backed by every branch root.
    pub(crate) fn root(table: &BranchTable) -> Self {
        let mut shadow = ShadowArray::building(table.count(), table.generation());
        for (bindex, branch) in table.iter() {
            shadow.set(
                bindex,
                Slot::Real(HDentry {
                    ino: branch.layer().root_inode(),
                    kind: EntryKind::Dir,
                }),
            );
        }
        shadow.seal();
        DentryInfo {
            shadow,
            bwh: None,
            bdiropq: None,
        }
    }

    /// Resolve `name` below `parent` against `table`.
    ///
    /// Branches are scanned in ascending order over the parent's range. The
    /// scan stops at a whiteout on a whiteout-capable branch, at the first
    /// non-directory, at an opaque directory, and at an entry whose kind differs
    /// from the topmost one. The result is `Absent` when no branch backs the
    /// name; it is never `Unresolved`.
    pub(crate) async fn lookup(
        table: &BranchTable,
        parent: &DentryInfo,
        name: &OsStr,
    ) -> Result<Self> {
        let (pstart, pend) = parent.shadow.range()?;
        let mut shadow = ShadowArray::building(table.count(), table.generation());
        let mut bwh = None;
        let mut bdiropq = None;
        let mut top_kind: Option<EntryKind> = None;

        for bindex in pstart..=pend {
            let Some(h_parent) = parent.shadow.real(bindex) else {
                continue;
            };
            if !h_parent.kind.is_dir() {
                continue;
            }
            let Some(branch) = table.get(bindex) else {
                break;
            };
            let Some(entry) = branch.layer().lookup(h_parent.ino, name).await? else {
                continue;
            };
            if entry.kind.is_whiteout() {
                if branch.perm().is_whable() {
                    shadow.set(bindex, Slot::Whiteout);
                    bwh = Some(bindex);
                    break;
                }
                warn!(
                    "{name:?}: whiteout on b{bindex} ignored, {} is {}",
                    branch.id(),
                    branch.perm()
                );
                continue;
            }
            match top_kind {
                None => top_kind = Some(entry.kind),
                Some(k) if k.is_dir() && entry.kind.is_dir() => {}
                Some(_) => break,
            }
            shadow.set(
                bindex,
                Slot::Real(HDentry {
                    ino: entry.ino,
                    kind: entry.kind,
                }),
            );
            if !entry.kind.is_dir() {
                break;
            }
            if branch.layer().is_opaque(entry.ino).await? {
                bdiropq = Some(bindex);
                break;
            }
        }
        shadow.seal();
        Ok(DentryInfo {
            shadow,
            bwh,
            bdiropq,
        })
    }
}

/// A virtual directory entry. The host keeps these alive between operations.
#[derive(Debug)]
pub struct Dentry {
    parent: Option<Arc<Dentry>>,
    name: OsString,
    info: RwLock<Arc<DentryInfo>>,
    inode: RwLock<Option<Arc<InodeInfo>>>,
}

impl Dentry {
    pub(crate) fn root() -> Arc<Self> {
        Arc::new(Dentry {
            parent: None,
            name: OsString::from("/"),
            info: RwLock::new(Arc::new(DentryInfo::default())),
            inode: RwLock::new(None),
        })
    }

    pub(crate) fn child(parent: &Arc<Dentry>, name: &OsStr) -> Arc<Self> {
        Arc::new(Dentry {
            parent: Some(parent.clone()),
            name: name.to_owned(),
            info: RwLock::new(Arc::new(DentryInfo::default())),
            inode: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<Dentry>> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Union path, for logs.
    pub fn path(&self) -> String {
        let mut names = Vec::new();
        let mut cur = Some(self);
        while let Some(d) = cur {
            if d.parent.is_some() {
                names.push(d.name.to_string_lossy());
            }
            cur = d.parent.as_deref();
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// The last published info. May be stale.
    pub async fn info(&self) -> Arc<DentryInfo> {
        self.info.read().await.clone()
    }

    /// Root first, `self` last.
    pub(crate) fn ancestry(self: &Arc<Self>) -> Vec<Arc<Dentry>> {
        let mut chain = vec![self.clone()];
        let mut cur = self.parent.clone();
        while let Some(d) = cur {
            cur = d.parent.clone();
            chain.push(d);
        }
        chain.reverse();
        chain
    }

    /// Replace the info unless a newer one was published meanwhile.
    pub(crate) async fn publish(&self, info: Arc<DentryInfo>) {
        let mut cur = self.info.write().await;
        if cur.shadow.backing() == super::Backing::Unresolved
            || cur.generation() <= info.generation()
        {
            *cur = info;
        }
    }

    pub(crate) async fn cached_inode(&self) -> Option<Arc<InodeInfo>> {
        self.inode.read().await.clone()
    }

    pub(crate) async fn set_inode(&self, inode: Arc<InodeInfo>) {
        let mut cur = self.inode.write().await;
        if cur
            .as_ref()
            .is_none_or(|c| c.generation() <= inode.generation())
        {
            *cur = Some(inode);
        }
    }
}
