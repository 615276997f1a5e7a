//! The union filesystem instance seen by the host dispatch layer.
//!
//! Every operation resolves the objects it touches against a branch table
//! snapshot and checks, after any branch I/O, that the generation did not move
//! while it worked. If it did, the work is thrown away and redone on the new
//! table, at most `max_retry` times.

use std::ffi::OsStr;
use std::io;
use std::sync::Arc;

use moka::future::Cache;

use crate::branch::{BIndex, Branch, BranchDesc, BranchPerm, BranchTable, Branches, InoAllocator};
use crate::config::UnionConfig;
use crate::error::{Result, UnionError};
use crate::layer::{PassthroughLayer, RealAttr, WHITEOUT_PREFIX};
use crate::shadow::{Dentry, DentryInfo, InodeInfo, OpenFile};
use crate::vdir::{self, Cursor, DirBlock, MergeOptions, VDir, VDirEntry};

/// A dentry resolved against one table snapshot.
struct Resolved {
    table: Arc<BranchTable>,
    dinfo: Arc<DentryInfo>,
    inode: Arc<InodeInfo>,
}

pub struct UnionFs {
    config: UnionConfig,
    branches: Branches,
    inos: InoAllocator,
    /// Merged listings by directory inode number.
    vdir_cache: Option<Cache<u64, Arc<VDir>>>,
    root: Arc<Dentry>,
}

impl UnionFs {
    /// A union over `descs`, top branch first. `config.branches` is ignored.
    pub fn new(config: UnionConfig, descs: Vec<BranchDesc>) -> Result<Self> {
        if config.max_retry == 0 {
            return Err(UnionError::InvalidConfig("max_retry must be positive".into()));
        }
        let branches = Branches::new(descs)?;
        let vdir_cache = config.rdcache_ttl().map(|ttl| {
            Cache::builder()
                .max_capacity(config.rdcache_capacity)
                .time_to_live(ttl)
                .build()
        });
        Ok(UnionFs {
            config,
            branches,
            inos: InoAllocator::default(),
            vdir_cache,
            root: Dentry::root(),
        })
    }

    /// A union over host directories, as listed in `config.branches`.
    pub async fn mount(config: UnionConfig) -> Result<Self> {
        config.validate()?;
        let mut descs = Vec::with_capacity(config.branches.len());
        for br in &config.branches {
            let layer = PassthroughLayer::new(&br.path).await?;
            let mut desc = BranchDesc::new(&br.path, Arc::new(layer));
            if let Some(perm) = br.perm()? {
                desc = desc.perm(perm);
            }
            if let Some(xino) = &br.xino {
                desc = desc.xino(xino);
            }
            descs.push(desc);
        }
        let fs = Self::new(config, descs)?;
        info!(
            "mounted union of {} branches, rdblk {} rdhash {} rdcache {}s",
            fs.branches.count().await,
            fs.config.rdblk,
            fs.config.rdhash,
            fs.config.rdcache
        );
        Ok(fs)
    }

    pub fn config(&self) -> &UnionConfig {
        &self.config
    }

    pub fn root(&self) -> Arc<Dentry> {
        self.root.clone()
    }

    pub fn current_generation(&self) -> u64 {
        self.branches.generation()
    }

    pub async fn branch_count(&self) -> usize {
        self.branches.count().await
    }

    pub async fn branch(&self, bindex: BIndex) -> Option<Arc<Branch>> {
        self.branches.get(bindex).await
    }

    /// Topmost writable branch.
    pub async fn writable_branch(&self) -> Option<BIndex> {
        let table = self.branches.snapshot().await;
        table
            .iter()
            .find(|(_, b)| b.perm().is_writable())
            .map(|(bindex, _)| bindex)
    }

    /// Resolve `name` in directory `parent`.
    pub async fn lookup(&self, parent: &Arc<Dentry>, name: &OsStr) -> Result<Arc<Dentry>> {
        check_name(name)?;
        let child = Dentry::child(parent, name);
        self.fresh_info(&child).await?;
        Ok(child)
    }

    /// Bring `dentry` up to date with the current table.
    pub async fn revalidate(&self, dentry: &Arc<Dentry>) -> Result<Arc<DentryInfo>> {
        Ok(self.fresh_info(dentry).await?.1)
    }

    pub async fn is_stale(&self, dentry: &Dentry) -> bool {
        dentry.info().await.is_stale(self.current_generation())
    }

    pub async fn file_is_stale(&self, file: &OpenFile) -> bool {
        file.is_stale(self.current_generation()).await
    }

    /// Metadata info of `dentry`, rebuilt if stale.
    pub async fn inode(&self, dentry: &Arc<Dentry>) -> Result<Arc<InodeInfo>> {
        Ok(self.resolve(dentry).await?.inode)
    }

    pub async fn getattr(&self, dentry: &Arc<Dentry>) -> Result<RealAttr> {
        self.inode(dentry).await?.attr()
    }

    pub async fn open(&self, dentry: &Arc<Dentry>, flags: u32) -> Result<Arc<OpenFile>> {
        for _ in 0..self.config.max_retry {
            let (table, dinfo) = self.fresh_info(dentry).await?;
            let opened = OpenFile::open(&table, dentry.clone(), &dinfo, flags).await;
            if self.moved(&table) {
                if let Ok(file) = opened {
                    file.release().await.ok();
                }
                continue;
            }
            return Ok(Arc::new(opened?));
        }
        Err(self.retry_exceeded(dentry))
    }

    /// Read the directory listing of `file` from `cursor` to the end of the
    /// block it points into. Pass [`Cursor::START`] first, then the returned
    /// `next` until it is `None`.
    pub async fn read_next_block(&self, file: &OpenFile, cursor: Cursor) -> Result<DirBlock> {
        let dentry = file.dentry();
        for _ in 0..self.config.max_retry {
            let mut info = file.lock().await;
            let current = self.current_generation();
            let usable = !info.shadow().is_stale(current)
                && info.vdir().is_some_and(|v| v.generation() == current);
            if !usable {
                let resolved = self.resolve(dentry).await?;
                if !resolved.dinfo.is_dir() {
                    return Err(io::Error::from_raw_os_error(libc::ENOTDIR).into());
                }
                if info.shadow().is_stale(resolved.table.generation()) {
                    debug!(
                        "refresh open dir {} to generation {}",
                        dentry.path(),
                        resolved.table.generation()
                    );
                    OpenFile::refresh(&mut info, &resolved.table, &resolved.dinfo, file.flags())
                        .await?;
                }
                let vdir = self.listing(&resolved).await?;
                if self.moved(&resolved.table) {
                    continue;
                }
                info.set_vdir(Some(vdir));
            }
            let Some(vdir) = info.vdir().cloned() else {
                continue;
            };
            drop(info);
            return vdir.read(cursor);
        }
        Err(self.retry_exceeded(dentry))
    }

    /// The whole listing, read block by block.
    pub async fn readdir_all(&self, file: &OpenFile) -> Result<Vec<VDirEntry>> {
        let mut entries = Vec::new();
        let mut cursor = Cursor::START;
        loop {
            let blk = self.read_next_block(file, cursor).await?;
            entries.extend(blk.entries);
            match blk.next {
                Some(next) => cursor = next,
                None => return Ok(entries),
            }
        }
    }

    pub async fn release(&self, file: &OpenFile) -> Result<()> {
        file.release().await
    }

    /// A directory is empty when its merged listing is.
    pub async fn test_empty(&self, dentry: &Arc<Dentry>) -> Result<bool> {
        for _ in 0..self.config.max_retry {
            let resolved = self.resolve(dentry).await?;
            if !resolved.dinfo.is_dir() {
                return Err(io::Error::from_raw_os_error(libc::ENOTDIR).into());
            }
            let vdir = self.listing(&resolved).await?;
            if self.moved(&resolved.table) {
                continue;
            }
            return Ok(vdir.is_empty());
        }
        Err(self.retry_exceeded(dentry))
    }

    pub async fn add_branch(&self, desc: BranchDesc, bindex: BIndex) -> Result<BIndex> {
        let bindex = self.branches.add(desc, bindex).await?;
        self.drop_listings();
        Ok(bindex)
    }

    pub async fn remove_branch(&self, bindex: BIndex) -> Result<()> {
        self.branches.remove(bindex).await?;
        self.drop_listings();
        Ok(())
    }

    /// New position `i` holds the branch previously at `perm[i]`.
    pub async fn reorder_branches(&self, perm: &[BIndex]) -> Result<()> {
        self.branches.reorder(perm).await?;
        self.drop_listings();
        Ok(())
    }

    pub async fn set_branch_perm(&self, bindex: BIndex, perm: BranchPerm) -> Result<()> {
        self.branches.set_perm(bindex, perm).await?;
        self.drop_listings();
        Ok(())
    }

    fn drop_listings(&self) {
        if let Some(cache) = &self.vdir_cache {
            cache.invalidate_all();
        }
    }

    /// True if the table was mutated after `table` was taken.
    fn moved(&self, table: &BranchTable) -> bool {
        self.branches.generation() != table.generation()
    }

    fn retry_exceeded(&self, dentry: &Dentry) -> UnionError {
        let path = dentry.path();
        error!(
            "{path}: gave up after {} attempts, generation {}",
            self.config.max_retry,
            self.current_generation()
        );
        UnionError::StaleRetryExceeded {
            path,
            attempts: self.config.max_retry,
        }
    }

    /// Dentry info of `dentry` valid for the returned table.
    ///
    /// The ancestry is walked root first inside one snapshot; stale levels are
    /// rebuilt from their freshly validated parent and published once complete.
    async fn fresh_info(&self, dentry: &Arc<Dentry>) -> Result<(Arc<BranchTable>, Arc<DentryInfo>)> {
        let chain = dentry.ancestry();
        'retry: for attempt in 1..=self.config.max_retry {
            let table = self.branches.snapshot().await;
            let generation = table.generation();
            let mut parent: Option<Arc<DentryInfo>> = None;

            for (depth, d) in chain.iter().enumerate() {
                let cur = d.info().await;
                let info = if !cur.is_stale(generation) {
                    cur
                } else {
                    let built = match &parent {
                        None => Ok(DentryInfo::root(&table)),
                        Some(p) => DentryInfo::lookup(&table, p, d.name()).await,
                    };
                    if self.moved(&table) {
                        debug!(
                            "{}: generation moved past {generation}, attempt {attempt}",
                            d.path()
                        );
                        continue 'retry;
                    }
                    let built = Arc::new(built?);
                    trace!(
                        "{}: {:?} at generation {generation}",
                        d.path(),
                        built.shadow().backing()
                    );
                    d.publish(built.clone()).await;
                    built
                };
                if info.shadow().is_absent() {
                    return Err(UnionError::NotFound(d.name().to_owned()));
                }
                if depth + 1 < chain.len() && !info.is_dir() {
                    return Err(io::Error::from_raw_os_error(libc::ENOTDIR).into());
                }
                parent = Some(info);
            }
            if let Some(info) = parent {
                return Ok((table, info));
            }
        }
        Err(self.retry_exceeded(dentry))
    }

    async fn resolve(&self, dentry: &Arc<Dentry>) -> Result<Resolved> {
        for _ in 0..self.config.max_retry {
            let (table, dinfo) = self.fresh_info(dentry).await?;
            if let Some(inode) = dentry.cached_inode().await {
                if inode.generation() == table.generation() && !inode.is_stale(table.generation()) {
                    return Ok(Resolved {
                        table,
                        dinfo,
                        inode,
                    });
                }
            }
            let built = InodeInfo::build(&table, &dinfo, &self.inos, dentry.is_root()).await;
            if self.moved(&table) {
                continue;
            }
            let inode = Arc::new(built?);
            dentry.set_inode(inode.clone()).await;
            return Ok(Resolved {
                table,
                dinfo,
                inode,
            });
        }
        Err(self.retry_exceeded(dentry))
    }

    /// Merged listing of a resolved directory, from the cache when it was built
    /// under the same generation.
    async fn listing(&self, resolved: &Resolved) -> Result<Arc<VDir>> {
        let ino = resolved.inode.ino();
        let generation = resolved.table.generation();
        if let Some(cache) = &self.vdir_cache {
            if let Some(vdir) = cache.get(&ino).await {
                if vdir.generation() == generation {
                    trace!("listing of inode {ino} from cache");
                    return Ok(vdir);
                }
            }
        }
        let opts = MergeOptions {
            rdblk: self.config.rdblk,
            rdhash: self.config.rdhash,
        };
        let vdir = Arc::new(vdir::build(&resolved.table, &resolved.dinfo, &self.inos, opts).await?);
        if let Some(cache) = &self.vdir_cache {
            if !self.moved(&resolved.table) {
                cache.insert(ino, vdir.clone()).await;
            }
        }
        Ok(vdir)
    }
}

/// Names the union never resolves.
fn check_name(name: &OsStr) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes == b"." || bytes == b".." || bytes.contains(&b'/') {
        return Err(UnionError::InvalidArgument(format!("bad name {name:?}")));
    }
    if bytes.starts_with(WHITEOUT_PREFIX.as_bytes()) {
        return Err(UnionError::InvalidArgument(format!(
            "{name:?} is a reserved whiteout name"
        )));
    }
    Ok(())
}
