use std::ffi::{OsStr, OsString};
use std::io;

use async_trait::async_trait;

pub mod memory;
pub mod passthrough;

pub use memory::MemoryLayer;
pub use passthrough::PassthroughLayer;

/// Branch-local inode number.
pub type Inode = u64;

pub const OPAQUE_XATTR_LEN: u32 = 16;
pub const OPAQUE_XATTR: &str = "user.fuseoverlayfs.opaque";
pub const UNPRIVILEGED_OPAQUE_XATTR: &str = "user.overlay.opaque";
pub const PRIVILEGED_OPAQUE_XATTR: &str = "trusted.overlay.opaque";

/// aufs style whiteout prefix, `.wh.<name>` hides `<name>`.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Marker file making its directory opaque.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

pub const NAME_MAX: usize = 255;

/// `d_type` of a whiteout, as BSD defines it.
const DT_WHT: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Special,
    Whiteout,
}

impl EntryKind {
    pub fn is_dir(self) -> bool {
        self == EntryKind::Dir
    }

    pub fn is_whiteout(self) -> bool {
        self == EntryKind::Whiteout
    }

    /// The `d_type` value used in packed directory blocks.
    pub fn dtype(self) -> u8 {
        match self {
            EntryKind::File => libc::DT_REG,
            EntryKind::Dir => libc::DT_DIR,
            EntryKind::Symlink => libc::DT_LNK,
            EntryKind::Special => libc::DT_UNKNOWN,
            EntryKind::Whiteout => DT_WHT,
        }
    }

    pub fn from_dtype(dtype: u8) -> Self {
        match dtype {
            libc::DT_REG => EntryKind::File,
            libc::DT_DIR => EntryKind::Dir,
            libc::DT_LNK => EntryKind::Symlink,
            DT_WHT => EntryKind::Whiteout,
            _ => EntryKind::Special,
        }
    }

    pub fn from_file_type(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            EntryKind::Dir
        } else if ft.is_file() {
            EntryKind::File
        } else if ft.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Special
        }
    }
}

/// One name as seen by a single branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealEntry {
    pub name: OsString,
    /// Zero for whiteouts.
    pub ino: Inode,
    pub kind: EntryKind,
}

impl RealEntry {
    pub fn whiteout(name: impl Into<OsString>) -> Self {
        RealEntry {
            name: name.into(),
            ino: 0,
            kind: EntryKind::Whiteout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealAttr {
    pub ino: Inode,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub nlink: u64,
    pub mtime: i64,
}

/// A filesystem must implement BranchFs, or it cannot be stacked as a union branch.
#[async_trait]
pub trait BranchFs: Send + Sync {
    /// Short filesystem type name, used in logs.
    fn fs_type(&self) -> &'static str;

    /// Return the root inode number
    fn root_inode(&self) -> Inode;

    /// Look `name` up in directory `parent`.
    ///
    /// A miss is `Ok(None)`. A whiteout hiding `name` is returned as an entry of
    /// kind [`EntryKind::Whiteout`].
    async fn lookup(&self, parent: Inode, name: &OsStr) -> io::Result<Option<RealEntry>>;

    async fn getattr(&self, ino: Inode) -> io::Result<RealAttr>;

    /// All entries of `dir` except `.`, `..` and the opaque marker. Whiteouts are
    /// reported under the name they hide.
    async fn readdir(&self, dir: Inode) -> io::Result<Vec<RealEntry>>;

    /// Check if the directory is opaque.
    async fn is_opaque(&self, dir: Inode) -> io::Result<bool>;

    async fn open(&self, ino: Inode, flags: u32) -> io::Result<u64>;

    async fn release(&self, ino: Inode, fh: u64) -> io::Result<()>;

    /// Expected number of entries in `dir`, used to size the whiteout hash.
    async fn entry_count_hint(&self, _dir: Inode) -> Option<usize> {
        None
    }
}

/// `.wh.foo` -> `foo`. The opaque marker is not a whiteout.
pub(crate) fn whiteout_target(name: &OsStr) -> Option<&OsStr> {
    use std::os::unix::ffi::OsStrExt;

    let bytes = name.as_bytes();
    if name == OsStr::new(OPAQUE_MARKER) {
        return None;
    }
    bytes
        .strip_prefix(WHITEOUT_PREFIX.as_bytes())
        .filter(|rest| !rest.is_empty())
        .map(OsStr::from_bytes)
}

pub(crate) fn whiteout_name(name: &OsStr) -> OsString {
    let mut wh = OsString::from(WHITEOUT_PREFIX);
    wh.push(name);
    wh
}

pub(crate) fn not_found() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

pub(crate) fn not_dir() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOTDIR)
}
