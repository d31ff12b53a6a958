//! Core result and error types.

use thiserror::Error;

/// Core error type encompassing all analysis failures.
///
/// Everything in here signals an upstream analysis or input bug, not a
/// runtime condition to recover from; callers are expected to abort the
/// attach rather than continue with a broken model.
#[derive(Debug, Error)]
pub enum Error {
    /// A recorded branch target does not resolve to an instruction entry.
    #[error("branch target 0x{target:x} (from 0x{from_instr:x}) is not an instruction entry")]
    BranchTargetMissing {
        /// The destination offset that failed to resolve.
        target: u64,
        /// The source instruction that recorded the edge.
        from_instr: u64,
    },

    /// An inserted instruction overlaps the previous one.
    #[error("instruction at 0x{0:x} overlaps its predecessor")]
    OverlappingInstruction(u64),

    /// An instruction offset was inserted twice.
    #[error("duplicate instruction at 0x{0:x}")]
    DuplicateInstruction(u64),

    /// A lookup named an offset with no instruction.
    #[error("no instruction at offset 0x{0:x}")]
    NoSuchInstruction(u64),

    /// Instructions ended up outside the block partition.
    #[error("{0} instructions are not covered by any basic block")]
    UncoveredInstructions(usize),

    /// Image read past the end of the mapped bytes.
    #[error("image read of {len} bytes at 0x{offset:x} is out of bounds")]
    ImageRead {
        /// Requested file offset.
        offset: u64,
        /// Requested length.
        len: usize,
    },

    /// The named module is not in the registry.
    #[error("module '{0}' is not registered")]
    UnknownModule(String),

    /// Invalid seed length.
    #[error("invalid seed length: expected 64 hex chars, got {0}")]
    InvalidSeedLength(usize),

    /// Invalid hexadecimal in seed.
    #[error("invalid hexadecimal in seed")]
    InvalidSeedHex,
}

/// Core result type.
pub type Result<T> = std::result::Result<T, Error>;
