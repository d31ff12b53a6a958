//! Decoded-instruction model.
//!
//! Instructions arrive from the external disassembler keyed by file offset.
//! The model keeps the raw bytes plus the decoded summary the analysis passes
//! need: how the instruction transfers control, where a rip-relative data
//! displacement sits, and whether the encoding starts with a lock/repeat
//! prefix (branches may target the byte after such a prefix, so the cache
//! records a second entry point for those blocks).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Decoded control-transfer summary for one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchInfo {
    /// No control transfer; execution falls through.
    None,
    /// Unconditional direct jump.
    Jump { target: u64 },
    /// Conditional direct branch; falls through when not taken.
    CondJump { target: u64 },
    /// Direct near call.
    Call { target: u64 },
    /// Computed jump through a register.
    IndirectJump,
    /// Computed call.
    IndirectCall,
    /// Near return.
    Return,
}

/// One decoded machine instruction, owned by its module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// File offset of the first byte.
    pub offset: u64,
    /// Raw machine-code bytes, prefixes included.
    pub bytes: Vec<u8>,
    /// Control-transfer summary.
    pub branch: BranchInfo,
    /// Byte position (within `bytes`) of a 32-bit rip-relative data
    /// displacement, if the instruction has one.
    pub rip_disp_pos: Option<u8>,
    /// File offset of the jump table a rip-relative `lea` materializes.
    pub table_base: Option<u64>,
    /// Register number an indirect jump dispatches through.
    pub jump_reg: Option<u8>,
    /// Encoding starts with a lock or repeat prefix.
    pub has_lock_or_rep: bool,
    /// Addresses memory through the gs segment.
    pub uses_gs: bool,
}

impl Instruction {
    /// Creates an instruction with no operand annotations.
    pub fn new(offset: u64, bytes: Vec<u8>, branch: BranchInfo) -> Self {
        Self {
            offset,
            bytes,
            branch,
            rip_disp_pos: None,
            table_base: None,
            jump_reg: None,
            has_lock_or_rep: false,
            uses_gs: false,
        }
    }

    /// Encoded length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length placeholder (never produced by a real decode).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of the first byte after this instruction.
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.offset + self.bytes.len() as u64
    }

    /// True when this instruction terminates a basic block.
    #[inline]
    pub fn ends_block(&self) -> bool {
        !matches!(self.branch, BranchInfo::None)
    }

    /// Target of a direct jump, branch or call.
    pub fn direct_target(&self) -> Option<u64> {
        match self.branch {
            BranchInfo::Jump { target }
            | BranchInfo::CondJump { target }
            | BranchInfo::Call { target } => Some(target),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x} ", self.offset)?;
        for b in &self.bytes {
            write!(f, " {b:02x}")?;
        }
        write!(f, "  {:?}", self.branch)
    }
}
