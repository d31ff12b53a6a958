//! Basic blocks: maximal straight-line instruction runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Why a block must keep its original entry offset reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixedReason {
    /// Symbol-table function entry.
    SymbolEntry,
    /// Target of a direct or resolved call.
    CallTarget,
    /// Referenced by a data relocation into an executable section.
    RelocationTarget,
    /// Potential landing of an unresolved indirect jump.
    UnknownJumpLanding,
    /// Pinned by the reachability sweep through a dispatch edge whose
    /// computed target depends on the original layout.
    PinnedByDispatch,
}

/// Placement class assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mobility {
    /// Not classified yet.
    Unclassified,
    /// Entry must stay individually reachable at its original offset.
    Fixed(FixedReason),
    /// Free to be relocated and reordered.
    Movable,
}

/// A maximal straight-line run of instructions ending at a control transfer
/// or a recognized block boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlock {
    /// File offset of the first instruction.
    pub entry: u64,
    /// Total encoded size in bytes.
    pub size: u64,
    /// Ordered entry offsets of the member instructions.
    pub instrs: Vec<u64>,
    /// Entry offsets of the blocks this one can transfer to.
    pub succs: BTreeSet<u64>,
    /// Placement class; written exactly once by the classifier.
    pub mobility: Mobility,
}

impl BasicBlock {
    /// Offset of the first byte after the block.
    #[inline]
    pub fn end(&self) -> u64 {
        self.entry + self.size
    }

    /// True when `off` falls inside the block's byte range.
    #[inline]
    pub fn contains(&self, off: u64) -> bool {
        off >= self.entry && off < self.end()
    }

    /// True when the classifier pinned this block.
    #[inline]
    pub fn is_fixed(&self) -> bool {
        matches!(self.mobility, Mobility::Fixed(_))
    }

    /// True when the classifier released this block for relocation.
    #[inline]
    pub fn is_movable(&self) -> bool {
        matches!(self.mobility, Mobility::Movable)
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bbl 0x{:x}..0x{:x} ({} instrs, {:?})",
            self.entry,
            self.end(),
            self.instrs.len(),
            self.mobility
        )
    }
}
