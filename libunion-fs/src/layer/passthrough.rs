//! Host directory as a union branch.
//!
//! Branch-local inode numbers are the host `st_ino` values. Both whiteout
//! conventions are understood: aufs `.wh.<name>` files and overlayfs 0/0
//! character devices.

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{
    BranchFs, EntryKind, Inode, OPAQUE_MARKER, OPAQUE_XATTR, OPAQUE_XATTR_LEN,
    PRIVILEGED_OPAQUE_XATTR, RealAttr, RealEntry, UNPRIVILEGED_OPAQUE_XATTR, not_dir, not_found,
    whiteout_name, whiteout_target,
};

pub struct PassthroughLayer {
    root: PathBuf,
    root_ino: Inode,
    paths: RwLock<HashMap<Inode, PathBuf>>,
    next_fh: AtomicU64,
    handles: Mutex<HashMap<u64, (Inode, Option<tokio::fs::File>)>>,
}

impl PassthroughLayer {
    pub async fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let meta = tokio::fs::metadata(&root).await?;
        if !meta.is_dir() {
            return Err(not_dir());
        }
        let mut paths = HashMap::new();
        paths.insert(meta.ino(), root.clone());
        Ok(PassthroughLayer {
            root,
            root_ino: meta.ino(),
            paths: RwLock::new(paths),
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn path_of(&self, ino: Inode) -> io::Result<PathBuf> {
        self.paths
            .read()
            .await
            .get(&ino)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ESTALE))
    }

    /// Record where `ino` was last seen. A host inode number reused by a new
    /// file replaces the old path.
    async fn remember(&self, ino: Inode, path: PathBuf) {
        let mut paths = self.paths.write().await;
        if paths.get(&ino) != Some(&path) {
            paths.insert(ino, path);
        }
    }

    /// Stat `path`, mapping ENOENT to `None`.
    async fn stat(path: &Path) -> io::Result<Option<std::fs::Metadata>> {
        match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn is_whiteout(meta: &std::fs::Metadata) -> bool {
    // A whiteout is created as a character device with 0/0 device number.
    // See ref: https://docs.kernel.org/filesystems/overlayfs.html#whiteouts-and-opaque-directories
    let major = libc::major(meta.rdev());
    let minor = libc::minor(meta.rdev());
    meta.file_type().is_char_device() && major == 0 && minor == 0
}

fn kind_of(meta: &std::fs::Metadata) -> EntryKind {
    if is_whiteout(meta) {
        EntryKind::Whiteout
    } else {
        EntryKind::from_file_type(meta.file_type())
    }
}

/// Return Ok(true) if the xattr `attr_name` of `path` holds "y".
fn check_opaque_xattr(path: &Path, attr_name: &str) -> io::Result<bool> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let cname =
        CString::new(attr_name).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let mut buf = [0u8; OPAQUE_XATTR_LEN as usize];
    // SAFETY: both strings are NUL terminated and `buf` outlives the call.
    let ret = unsafe {
        libc::lgetxattr(
            cpath.as_ptr(),
            cname.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if ret < 0 {
        let e = io::Error::last_os_error();
        return match e.raw_os_error() {
            Some(libc::ENODATA) | Some(libc::ENOTSUP) | Some(libc::ERANGE) => Ok(false),
            _ => Err(e),
        };
    }
    Ok(ret == 1 && buf[0].eq_ignore_ascii_case(&b'y'))
}

#[async_trait]
impl BranchFs for PassthroughLayer {
    fn fs_type(&self) -> &'static str {
        "passthrough"
    }

    fn root_inode(&self) -> Inode {
        self.root_ino
    }

    async fn lookup(&self, parent: Inode, name: &OsStr) -> io::Result<Option<RealEntry>> {
        // Whiteout names themselves never show up in the union.
        if whiteout_target(name).is_some() || name == OsStr::new(OPAQUE_MARKER) {
            return Ok(None);
        }
        let dir = self.path_of(parent).await?;
        let path = dir.join(name);
        match Self::stat(&path).await? {
            Some(meta) => {
                let kind = kind_of(&meta);
                if kind.is_whiteout() {
                    return Ok(Some(RealEntry::whiteout(name)));
                }
                self.remember(meta.ino(), path).await;
                Ok(Some(RealEntry {
                    name: name.to_owned(),
                    ino: meta.ino(),
                    kind,
                }))
            }
            None => {
                let wh = dir.join(whiteout_name(name));
                match Self::stat(&wh).await? {
                    Some(_) => Ok(Some(RealEntry::whiteout(name))),
                    None => Ok(None),
                }
            }
        }
    }

    async fn getattr(&self, ino: Inode) -> io::Result<RealAttr> {
        let path = self.path_of(ino).await?;
        let meta = Self::stat(&path).await?.ok_or_else(not_found)?;
        Ok(RealAttr {
            ino: meta.ino(),
            kind: kind_of(&meta),
            mode: meta.mode(),
            size: meta.len(),
            nlink: meta.nlink(),
            mtime: meta.mtime(),
        })
    }

    async fn readdir(&self, dir: Inode) -> io::Result<Vec<RealEntry>> {
        let path = self.path_of(dir).await?;
        let mut rd = tokio::fs::read_dir(&path).await?;
        let mut out = Vec::new();
        let mut seen = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name();
            if name == OsStr::new(OPAQUE_MARKER) {
                continue;
            }
            if let Some(target) = whiteout_target(&name) {
                out.push(RealEntry::whiteout(target));
                continue;
            }
            let meta = entry.metadata().await?;
            let kind = kind_of(&meta);
            if kind.is_whiteout() {
                out.push(RealEntry::whiteout(name));
                continue;
            }
            seen.push((entry.ino(), entry.path()));
            out.push(RealEntry {
                name,
                ino: entry.ino(),
                kind,
            });
        }
        if !seen.is_empty() {
            let mut paths = self.paths.write().await;
            for (ino, p) in seen {
                paths.insert(ino, p);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn is_opaque(&self, dir: Inode) -> io::Result<bool> {
        let path = self.path_of(dir).await?;
        let meta = Self::stat(&path).await?.ok_or_else(not_found)?;
        if !meta.is_dir() {
            return Err(not_dir());
        }
        if Self::stat(&path.join(OPAQUE_MARKER)).await?.is_some() {
            return Ok(true);
        }
        // A directory is made opaque by setting some specific xattr to "y".
        // See ref: https://docs.kernel.org/filesystems/overlayfs.html#whiteouts-and-opaque-directories
        for attr in [
            OPAQUE_XATTR,
            PRIVILEGED_OPAQUE_XATTR,
            UNPRIVILEGED_OPAQUE_XATTR,
        ] {
            if check_opaque_xattr(&path, attr)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn open(&self, ino: Inode, flags: u32) -> io::Result<u64> {
        let path = self.path_of(ino).await?;
        let meta = Self::stat(&path).await?.ok_or_else(not_found)?;
        let file = if meta.is_dir() {
            None
        } else {
            let acc = flags as i32 & libc::O_ACCMODE;
            let file = tokio::fs::OpenOptions::new()
                .read(acc != libc::O_WRONLY)
                .write(acc == libc::O_WRONLY || acc == libc::O_RDWR)
                .open(&path)
                .await?;
            Some(file)
        };
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().await.insert(fh, (ino, file));
        Ok(fh)
    }

    async fn release(&self, ino: Inode, fh: u64) -> io::Result<()> {
        match self.handles.lock().await.remove(&fh) {
            Some((opened, _file)) if opened == ino => Ok(()),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }
}
