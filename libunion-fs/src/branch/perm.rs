use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::UnionError;

/// Readable and writable.
const BR_PERM_RW: u32 = 1;

/// Readonly. The branch may be modified by someone else outside the union.
const BR_PERM_RO: u32 = 2;

/// Real readonly. Nobody modifies the branch.
const BR_PERM_RR: u32 = 4;

/// Whiteouts on a readonly branch are honoured.
const BR_ATTR_WH: u32 = 8;

/// Writable branch that never receives whiteouts.
const BR_WH_NOLWH: u32 = 16;

bitflags! {
    /// Permission and write policy of a branch, in aufs terms.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BranchPerm: u32 {
        const RW = BR_PERM_RW;
        const RO = BR_PERM_RO;
        const RR = BR_PERM_RR;
        const WH = BR_ATTR_WH;
        const NOLWH = BR_WH_NOLWH;
    }
}

impl BranchPerm {
    /// Default for the branch at `bindex` when nothing was configured.
    pub fn default_for(bindex: usize) -> Self {
        if bindex == 0 {
            BranchPerm::RW
        } else {
            BranchPerm::RO | BranchPerm::WH
        }
    }

    pub fn is_writable(self) -> bool {
        self.contains(BranchPerm::RW)
    }

    /// Whether whiteouts found on this branch hide lower entries.
    pub fn is_whable(self) -> bool {
        self.contains(BranchPerm::RW) || self.contains(BranchPerm::WH)
    }
}

impl FromStr for BranchPerm {
    type Err = UnionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let perm = match s {
            "rw" => BranchPerm::RW,
            "rw+nolwh" => BranchPerm::RW | BranchPerm::NOLWH,
            "ro" => BranchPerm::RO,
            "ro+wh" => BranchPerm::RO | BranchPerm::WH,
            "rr" => BranchPerm::RR,
            "rr+wh" => BranchPerm::RR | BranchPerm::WH,
            other => {
                return Err(UnionError::InvalidConfig(format!(
                    "unknown branch permission {other:?}"
                )));
            }
        };
        Ok(perm)
    }
}

impl fmt::Display for BranchPerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = if self.contains(BranchPerm::RW) {
            "rw"
        } else if self.contains(BranchPerm::RR) {
            "rr"
        } else {
            "ro"
        };
        f.write_str(base)?;
        if self.contains(BranchPerm::WH) && !self.contains(BranchPerm::RW) {
            f.write_str("+wh")?;
        }
        if self.contains(BranchPerm::NOLWH) && self.contains(BranchPerm::RW) {
            f.write_str("+nolwh")?;
        }
        Ok(())
    }
}
