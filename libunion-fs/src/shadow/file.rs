use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use super::{Dentry, DentryInfo, ShadowArray, Slot};
use crate::branch::{BIndex, BranchRef, BranchTable};
use crate::error::{Result, UnionError};
use crate::layer::Inode;
use crate::vdir::VDir;

/// An open handle on one branch. Holding it pins the branch.
#[derive(Debug)]
pub struct HFile {
    pub fh: u64,
    pub h_ino: Inode,
    pub branch: BranchRef,
}

#[derive(Debug, Default)]
pub struct FileInfo {
    shadow: ShadowArray<HFile>,
    /// Merged listing, directories only.
    vdir: Option<Arc<VDir>>,
}

impl FileInfo {
    pub fn shadow(&self) -> &ShadowArray<HFile> {
        &self.shadow
    }

    pub fn vdir(&self) -> Option<&Arc<VDir>> {
        self.vdir.as_ref()
    }

    pub(crate) fn set_vdir(&mut self, vdir: Option<Arc<VDir>>) {
        self.vdir = vdir;
    }
}

/// A virtual open file.
#[derive(Debug)]
pub struct OpenFile {
    dentry: Arc<Dentry>,
    flags: u32,
    info: Mutex<FileInfo>,
}

impl OpenFile {
    pub(crate) async fn open(
        table: &BranchTable,
        dentry: Arc<Dentry>,
        dinfo: &DentryInfo,
        flags: u32,
    ) -> Result<Self> {
        let shadow = open_branches(table, dinfo, flags, Vec::new()).await?;
        debug!(
            "open {} flags {flags:#o}, {:?} at generation {}",
            dentry.path(),
            shadow.backing(),
            shadow.generation()
        );
        Ok(OpenFile {
            dentry,
            flags,
            info: Mutex::new(FileInfo {
                shadow,
                vdir: None,
            }),
        })
    }

    pub fn dentry(&self) -> &Arc<Dentry> {
        &self.dentry
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub async fn generation(&self) -> u64 {
        self.info.lock().await.shadow.generation()
    }

    pub async fn is_stale(&self, current: u64) -> bool {
        self.info.lock().await.shadow.is_stale(current)
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, FileInfo> {
        self.info.lock().await
    }

    /// Reopen against `table`. Handles on the same branch and real inode are
    /// kept; the others are released. The merged listing is dropped.
    pub(crate) async fn refresh(
        info: &mut FileInfo,
        table: &BranchTable,
        dinfo: &DentryInfo,
        flags: u32,
    ) -> Result<()> {
        let old = info.shadow.clear();
        info.vdir = None;
        info.shadow = open_branches(table, dinfo, flags, old).await?;
        Ok(())
    }

    /// Release every branch handle. The file stays usable only after a refresh.
    pub(crate) async fn release(&self) -> Result<()> {
        let mut info = self.info.lock().await;
        info.vdir = None;
        let handles = info.shadow.clear();
        debug!("release {}, {} handles", self.dentry.path(), handles.len());
        release_handles(handles).await
    }
}

/// Open the slots a file needs: every real slot of a directory, the top one
/// of anything else. `reuse` holds handles from a previous open; matching ones
/// move into the new array and the rest are released.
async fn open_branches(
    table: &BranchTable,
    dinfo: &DentryInfo,
    flags: u32,
    mut reuse: Vec<(BIndex, HFile)>,
) -> Result<ShadowArray<HFile>> {
    if let Err(e) = dinfo.shadow().range() {
        release_handles(reuse).await.ok();
        return Err(e);
    }
    let take = if dinfo.is_dir() { usize::MAX } else { 1 };
    let mut shadow = ShadowArray::building(table.count(), table.generation());
    let mut opened = Vec::new();

    for (bindex, h) in dinfo.shadow().reals().take(take) {
        let Some(branch) = table.get(bindex) else {
            release_handles(opened).await.ok();
            release_handles(reuse).await.ok();
            return Err(UnionError::invalid_range(format!(
                "b{bindex} past table end ({} branches)",
                table.count()
            )));
        };
        if let Some(pos) = reuse
            .iter()
            .position(|(_, f)| Arc::ptr_eq(f.branch.branch(), branch) && f.h_ino == h.ino)
        {
            let (_, f) = reuse.swap_remove(pos);
            opened.push((bindex, f));
            continue;
        }
        match branch.layer().open(h.ino, flags).await {
            Ok(fh) => opened.push((
                bindex,
                HFile {
                    fh,
                    h_ino: h.ino,
                    branch: BranchRef::new(branch.clone()),
                },
            )),
            Err(e) => {
                release_handles(opened).await.ok();
                release_handles(reuse).await.ok();
                return Err(e.into());
            }
        }
    }
    release_handles(reuse).await?;
    for (bindex, f) in opened {
        shadow.set(bindex, Slot::Real(f));
    }
    shadow.seal();
    Ok(shadow)
}

async fn release_handles(handles: Vec<(BIndex, HFile)>) -> Result<()> {
    let mut first_err = None;
    for (bindex, f) in handles {
        if let Err(e) = f.branch.layer().release(f.h_ino, f.fh).await {
            warn!("release fh {} on b{bindex} {}: {e}", f.fh, f.branch.id());
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
