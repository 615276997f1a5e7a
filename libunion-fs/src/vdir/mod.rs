//! Virtual directory listings.
//!
//! A listing is a sequence of packed blocks ("deblk"). Each entry is laid out
//! as `ino: u64 LE | bindex: u16 LE | d_type: u8 | namelen: u8 | name`. Blocks
//! are filled in merge order and an entry never straddles two blocks.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::branch::BIndex;
use crate::error::{Result, UnionError};
use crate::layer::{EntryKind, NAME_MAX};

pub mod merge;

pub use merge::{MergeOptions, build};

/// Bytes of an entry before its name.
pub const ENTRY_HEADER: usize = 8 + 2 + 1 + 1;
/// Default block size.
pub const RDBLK_DEFAULT: usize = 512;

/// Position in a listing, handed back verbatim by the host between reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Cursor {
    /// Generation of the listing the cursor was issued for.
    pub version: u64,
    pub block: usize,
    /// Byte offset inside `block`.
    pub offset: usize,
    /// Ordinal of the next entry in the whole listing.
    pub pos: usize,
}

impl Cursor {
    /// Start of any listing.
    pub const START: Cursor = Cursor {
        version: 0,
        block: 0,
        offset: 0,
        pos: 0,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VDirEntry {
    pub name: OsString,
    /// Union inode number.
    pub ino: u64,
    pub kind: EntryKind,
    /// Branch the entry comes from.
    pub bindex: BIndex,
}

/// Result of one read: the rest of a block and where to continue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirBlock {
    pub entries: Vec<VDirEntry>,
    /// `None` once the listing is exhausted.
    pub next: Option<Cursor>,
}

/// Block size actually used for `rdblk`: at least one maximal entry.
pub fn effective_rdblk(rdblk: usize) -> usize {
    let rdblk = if rdblk == 0 { RDBLK_DEFAULT } else { rdblk };
    rdblk.max(ENTRY_HEADER + NAME_MAX)
}

/// Appends entries to fixed-capacity blocks.
#[derive(Debug)]
pub(crate) struct DeblkWriter {
    rdblk: usize,
    blocks: Vec<Bytes>,
    cur: BytesMut,
    nentries: usize,
}

impl DeblkWriter {
    pub(crate) fn new(rdblk: usize) -> Self {
        let rdblk = effective_rdblk(rdblk);
        DeblkWriter {
            rdblk,
            blocks: Vec::new(),
            cur: BytesMut::with_capacity(rdblk),
            nentries: 0,
        }
    }

    /// Append one entry. The name must be at most [`NAME_MAX`] bytes.
    pub(crate) fn push(&mut self, ino: u64, bindex: BIndex, kind: EntryKind, name: &[u8]) -> Result<()> {
        let namelen = u8::try_from(name.len())
            .map_err(|_| UnionError::InvalidArgument(format!("name of {} bytes", name.len())))?;
        let bindex = u16::try_from(bindex)
            .map_err(|_| UnionError::invalid_range(format!("b{bindex} does not fit a deblk entry")))?;
        let need = ENTRY_HEADER + name.len();
        if self.cur.len() + need > self.rdblk {
            self.seal_block();
        }
        self.cur.put_u64_le(ino);
        self.cur.put_u16_le(bindex);
        self.cur.put_u8(kind.dtype());
        self.cur.put_u8(namelen);
        self.cur.put_slice(name);
        self.nentries += 1;
        Ok(())
    }

    fn seal_block(&mut self) {
        let full = std::mem::replace(&mut self.cur, BytesMut::with_capacity(self.rdblk));
        self.blocks.push(full.freeze());
    }

    pub(crate) fn finish(mut self, generation: u64) -> VDir {
        if !self.cur.is_empty() {
            self.seal_block();
        }
        VDir {
            deblks: self.blocks,
            generation,
            nentries: self.nentries,
            rdblk: self.rdblk,
        }
    }
}

/// A merged listing, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VDir {
    deblks: Vec<Bytes>,
    generation: u64,
    nentries: usize,
    rdblk: usize,
}

impl VDir {
    pub fn empty(generation: u64, rdblk: usize) -> Self {
        DeblkWriter::new(rdblk).finish(generation)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn nblk(&self) -> usize {
        self.deblks.len()
    }

    pub fn len(&self) -> usize {
        self.nentries
    }

    pub fn is_empty(&self) -> bool {
        self.nentries == 0
    }

    pub fn rdblk(&self) -> usize {
        self.rdblk
    }

    pub fn block(&self, i: usize) -> Option<&Bytes> {
        self.deblks.get(i)
    }

    /// Every entry in listing order.
    pub fn entries(&self) -> Result<Vec<VDirEntry>> {
        let mut out = Vec::with_capacity(self.nentries);
        for blk in &self.deblks {
            for entry in decode_block(blk.clone()) {
                out.push(entry?.1);
            }
        }
        Ok(out)
    }

    /// Cursor of the entry with ordinal `pos`, or past the end.
    pub fn seek(&self, pos: usize) -> Result<Cursor> {
        let mut seen = 0;
        for (block, blk) in self.deblks.iter().enumerate() {
            for entry in decode_block(blk.clone()) {
                let (offset, _) = entry?;
                if seen == pos {
                    return Ok(Cursor {
                        version: self.generation,
                        block,
                        offset,
                        pos,
                    });
                }
                seen += 1;
            }
        }
        Ok(Cursor {
            version: self.generation,
            block: self.deblks.len(),
            offset: 0,
            pos: seen,
        })
    }

    /// Read from `cursor` to the end of its block.
    ///
    /// A cursor issued for another generation is re-seeked to its entry
    /// ordinal in this listing.
    pub fn read(&self, cursor: Cursor) -> Result<DirBlock> {
        let cursor = if cursor.version == self.generation {
            cursor
        } else {
            debug!(
                "cursor of generation {} on listing of {}, seek to entry {}",
                cursor.version, self.generation, cursor.pos
            );
            self.seek(cursor.pos)?
        };
        let Some(blk) = self.deblks.get(cursor.block) else {
            return Ok(DirBlock::default());
        };

        let mut entries = Vec::new();
        let mut aligned = cursor.offset == 0;
        for entry in decode_block(blk.clone()) {
            let (offset, entry) = entry?;
            if offset == cursor.offset {
                aligned = true;
            }
            if offset >= cursor.offset {
                entries.push(entry);
            }
        }
        if !aligned && cursor.offset < blk.len() {
            return Err(UnionError::InvalidArgument(format!(
                "offset {} is not an entry boundary in block {}",
                cursor.offset, cursor.block
            )));
        }

        let next = (cursor.block + 1 < self.deblks.len()).then(|| Cursor {
            version: self.generation,
            block: cursor.block + 1,
            offset: 0,
            pos: cursor.pos + entries.len(),
        });
        Ok(DirBlock { entries, next })
    }
}

/// Entries of one block with their byte offsets.
fn decode_block(mut blk: Bytes) -> impl Iterator<Item = Result<(usize, VDirEntry)>> {
    let total = blk.len();
    std::iter::from_fn(move || {
        if !blk.has_remaining() {
            return None;
        }
        let offset = total - blk.remaining();
        if blk.remaining() < ENTRY_HEADER {
            blk.clear();
            return Some(Err(UnionError::invalid_range(format!(
                "truncated deblk entry at offset {offset}"
            ))));
        }
        let ino = blk.get_u64_le();
        let bindex = blk.get_u16_le() as BIndex;
        let kind = EntryKind::from_dtype(blk.get_u8());
        let namelen = blk.get_u8() as usize;
        if blk.remaining() < namelen {
            blk.clear();
            return Some(Err(UnionError::invalid_range(format!(
                "deblk name at offset {offset} overruns the block"
            ))));
        }
        let name = OsString::from_vec(blk.split_to(namelen).to_vec());
        Some(Ok((
            offset,
            VDirEntry {
                name,
                ino,
                kind,
                bindex,
            },
        )))
    })
}
