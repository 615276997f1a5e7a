#[macro_use]
extern crate log;

pub mod branch;
pub mod config;
pub mod error;
pub mod layer;
pub mod shadow;
pub mod unionfs;
pub mod vdir;
pub mod whiteout;

pub use branch::{BIndex, BranchDesc, BranchPerm};
pub use config::{BranchConfig, UnionConfig};
pub use error::{Result, UnionError};
pub use layer::{BranchFs, EntryKind, MemoryLayer, PassthroughLayer};
pub use unionfs::UnionFs;
pub use vdir::{Cursor, DirBlock, VDirEntry};
