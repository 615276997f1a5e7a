//! External inode number index.
//!
//! Maps a branch-local inode number to the union-wide one, so an object keeps
//! its inode number while its backing branch stays the same. The file form is
//! a flat array of little-endian `u64` indexed by the branch inode number;
//! zero marks an unassigned slot.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::layer::Inode;

/// Union inode number of the root directory.
pub const ROOT_INO: u64 = 1;

const SLOT_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// Hands out union inode numbers for one filesystem instance.
#[derive(Debug)]
pub struct InoAllocator {
    next: AtomicU64,
}

impl Default for InoAllocator {
    fn default() -> Self {
        InoAllocator {
            next: AtomicU64::new(ROOT_INO + 1),
        }
    }
}

impl InoAllocator {
    pub fn alloc(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug)]
enum Backing {
    Memory(HashMap<Inode, u64>),
    File(Arc<File>),
}

#[derive(Debug)]
pub struct Xino {
    path: Option<PathBuf>,
    backing: Mutex<Backing>,
}

impl Xino {
    pub fn memory() -> Self {
        Xino {
            path: None,
            backing: Mutex::new(Backing::Memory(HashMap::new())),
        }
    }

    /// Open (and truncate) an xino file. Stale numbers from an earlier mount are
    /// never reused.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Xino {
            path: Some(path.to_path_buf()),
            backing: Mutex::new(Backing::File(Arc::new(file))),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Union inode number of branch inode `h_ino`, allocating one on first use.
    ///
    /// The lock stays held across the file I/O so two callers never allocate
    /// for the same slot.
    pub async fn get_or_alloc(&self, h_ino: Inode, alloc: &InoAllocator) -> io::Result<u64> {
        let mut backing = self.backing.lock().await;
        match &mut *backing {
            Backing::Memory(map) => Ok(*map.entry(h_ino).or_insert_with(|| alloc.alloc())),
            Backing::File(file) => {
                let pos = slot_pos(h_ino)?;
                let reader = file.clone();
                if let Some(ino) = blocking(move || read_slot(&reader, pos)).await? {
                    return Ok(ino);
                }
                let ino = alloc.alloc();
                let writer = file.clone();
                blocking(move || writer.write_all_at(&ino.to_le_bytes(), pos)).await?;
                Ok(ino)
            }
        }
    }

    /// Union inode number previously assigned to `h_ino`, if any.
    pub async fn get(&self, h_ino: Inode) -> io::Result<Option<u64>> {
        let backing = self.backing.lock().await;
        match &*backing {
            Backing::Memory(map) => Ok(map.get(&h_ino).copied()),
            Backing::File(file) => {
                let pos = slot_pos(h_ino)?;
                let reader = file.clone();
                blocking(move || read_slot(&reader, pos)).await
            }
        }
    }
}

/// Run positioned file I/O on the blocking pool.
async fn blocking<T, F>(f: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

fn slot_pos(h_ino: Inode) -> io::Result<u64> {
    h_ino
        .checked_mul(SLOT_SIZE)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EFBIG))
}

fn read_slot(file: &File, pos: u64) -> io::Result<Option<u64>> {
    let mut buf = [0u8; SLOT_SIZE as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(&mut buf[filled..], pos + filled as u64)?;
        if n == 0 {
            // past EOF
            return Ok(None);
        }
        filled += n;
    }
    let ino = u64::from_le_bytes(buf);
    Ok((ino != 0).then_some(ino))
}
