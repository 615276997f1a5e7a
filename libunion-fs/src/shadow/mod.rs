//! Per-object, branch-indexed arrays of real objects.
//!
//! Every virtual object (dentry, inode, open file) keeps one slot per branch
//! position and the generation of the branch table it was built under. The
//! `[start, end]` bounds are derived from the real slots when the array is
//! sealed.

use crate::branch::BIndex;
use crate::error::{Result, UnionError};

pub mod dentry;
pub mod file;
pub mod inode;

pub use dentry::{Dentry, DentryInfo, HDentry};
pub use file::{FileInfo, HFile, OpenFile};
pub use inode::{HInode, InodeInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot<T> {
    Absent,
    Real(T),
    /// The branch explicitly hides the name (dentries only).
    Whiteout,
}

impl<T> Slot<T> {
    pub fn real(&self) -> Option<&T> {
        match self {
            Slot::Real(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_whiteout(&self) -> bool {
        matches!(self, Slot::Whiteout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Never built, or cleared. Always stale.
    Unresolved,
    /// Built, and no branch backs the object.
    Absent,
    Range { start: BIndex, end: BIndex },
}

#[derive(Debug, Clone)]
pub struct ShadowArray<T> {
    backing: Backing,
    generation: u64,
    slots: Vec<Slot<T>>,
}

impl<T> Default for ShadowArray<T> {
    fn default() -> Self {
        Self::unresolved()
    }
}

impl<T> ShadowArray<T> {
    pub fn unresolved() -> Self {
        ShadowArray {
            backing: Backing::Unresolved,
            generation: 0,
            slots: Vec::new(),
        }
    }

    /// An array being built for a table of `nbranch` branches at `generation`.
    /// Stays `Unresolved` until [`ShadowArray::seal`].
    pub fn building(nbranch: usize, generation: u64) -> Self {
        ShadowArray {
            backing: Backing::Unresolved,
            generation,
            slots: (0..nbranch).map(|_| Slot::Absent).collect(),
        }
    }

    pub fn set(&mut self, bindex: BIndex, slot: Slot<T>) {
        if let Some(s) = self.slots.get_mut(bindex) {
            *s = slot;
        }
    }

    /// Compute `[start, end]` from the real slots.
    pub fn seal(&mut self) {
        let mut reals = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Slot::Real(_)))
            .map(|(i, _)| i);
        self.backing = match reals.next() {
            None => Backing::Absent,
            Some(start) => Backing::Range {
                start,
                end: reals.last().unwrap_or(start),
            },
        };
    }

    pub fn backing(&self) -> Backing {
        self.backing
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn nbranch(&self) -> usize {
        self.slots.len()
    }

    /// True if the array must be rebuilt before use against `current`.
    pub fn is_stale(&self, current: u64) -> bool {
        self.backing == Backing::Unresolved || self.generation != current
    }

    pub fn is_absent(&self) -> bool {
        self.backing == Backing::Absent
    }

    pub fn start(&self) -> Option<BIndex> {
        match self.backing {
            Backing::Range { start, .. } => Some(start),
            _ => None,
        }
    }

    pub fn end(&self) -> Option<BIndex> {
        match self.backing {
            Backing::Range { end, .. } => Some(end),
            _ => None,
        }
    }

    /// `[start, end]`, for code paths that cannot run without one.
    pub fn range(&self) -> Result<(BIndex, BIndex)> {
        match self.backing {
            Backing::Range { start, end } if start <= end && end < self.slots.len() => {
                Ok((start, end))
            }
            other => Err(UnionError::invalid_range(format!(
                "{other:?} at generation {} over {} branches",
                self.generation,
                self.slots.len()
            ))),
        }
    }

    pub fn slot(&self, bindex: BIndex) -> Option<&Slot<T>> {
        self.slots.get(bindex)
    }

    pub fn real(&self, bindex: BIndex) -> Option<&T> {
        self.slots.get(bindex).and_then(Slot::real)
    }

    /// Real slots inside `[start, end]`, in branch order.
    pub fn reals(&self) -> impl Iterator<Item = (BIndex, &T)> {
        let (start, end) = match self.backing {
            Backing::Range { start, end } => (start, end + 1),
            _ => (0, 0),
        };
        self.slots
            .iter()
            .enumerate()
            .take(end)
            .skip(start)
            .filter_map(|(i, s)| s.real().map(|t| (i, t)))
    }

    /// Drop every slot and go back to `Unresolved`, handing back the real
    /// objects with the position they had.
    pub fn clear(&mut self) -> Vec<(BIndex, T)> {
        let slots = std::mem::take(&mut self.slots);
        self.backing = Backing::Unresolved;
        slots
            .into_iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Real(t) => Some((i, t)),
                _ => None,
            })
            .collect()
    }
}
