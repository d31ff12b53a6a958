//! Access interface to a module's on-disk image.
//!
//! The ELF reader and the disassembler are external collaborators. This trait
//! is the surface they expose to the analysis: byte-level reads at file
//! offsets, executable-range queries, and the symbol/relocation facts the
//! classifier needs. [`StaticImage`] is the serde-backed realization those
//! collaborators produce; the CLI and the tests consume it from snapshot
//! files.

use crate::insn::Instruction;
use crate::result::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

/// Read-only view of one mapped binary image.
pub trait ModuleImage {
    /// Short module name (the basename the process maps carry).
    fn name(&self) -> &str;

    /// True for shared objects, false for the main executable.
    fn is_shared_object(&self) -> bool;

    /// Executable file-offset range of the text segment.
    fn exec_range(&self) -> Range<u64>;

    /// Raw bytes at a file offset.
    fn read(&self, offset: u64, len: usize) -> Result<&[u8]>;

    /// Symbol-table function entry offsets.
    fn symbol_entries(&self) -> &BTreeSet<u64>;

    /// Offsets inside executable sections referenced by data relocations.
    fn reloc_targets(&self) -> &BTreeSet<u64>;

    /// Alignment-padding entries that start a new block.
    fn align_entries(&self) -> &BTreeSet<u64>;

    /// File-offset range of the procedure linkage table.
    fn plt_range(&self) -> Range<u64>;

    /// Resolves a PLT stub to the local offset its relocation binds to.
    fn plt_link(&self, stub: u64) -> Option<u64>;

    /// `(call site, landing pad)` pairs from the exception unwind tables.
    fn exception_edges(&self) -> &[(u64, u64)];

    /// Indirect jumps known to implement longjmp.
    fn longjmp_sites(&self) -> &BTreeSet<u64>;

    /// Little-endian i32 at a file offset.
    fn read_i32(&self, offset: u64) -> Result<i32> {
        let b = self.read(offset, 4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Little-endian u64 at a file offset.
    fn read_u64(&self, offset: u64) -> Result<u64> {
        let b = self.read(offset, 8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// True when `offset` falls inside the executable range.
    fn is_executable(&self, offset: u64) -> bool {
        self.exec_range().contains(&offset)
    }

    /// True when `offset` falls inside the PLT.
    fn in_plt(&self, offset: u64) -> bool {
        self.plt_range().contains(&offset)
    }
}

/// Serde-backed [`ModuleImage`] produced by the ELF/disassembler side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticImage {
    pub name: String,
    pub shared_object: bool,
    /// The image bytes, indexed by file offset.
    pub bytes: Vec<u8>,
    pub exec: Range<u64>,
    pub symbols: BTreeSet<u64>,
    pub relocs: BTreeSet<u64>,
    pub aligns: BTreeSet<u64>,
    pub plt: Range<u64>,
    pub plt_links: BTreeMap<u64, u64>,
    pub exception_edges: Vec<(u64, u64)>,
    pub longjmp_sites: BTreeSet<u64>,
}

impl StaticImage {
    /// An image whose whole byte range is executable and which carries no
    /// symbol or relocation facts yet.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self {
            name: name.into(),
            shared_object: false,
            bytes,
            exec: 0..len,
            symbols: BTreeSet::new(),
            relocs: BTreeSet::new(),
            aligns: BTreeSet::new(),
            plt: 0..0,
            plt_links: BTreeMap::new(),
            exception_edges: Vec::new(),
            longjmp_sites: BTreeSet::new(),
        }
    }
}

impl ModuleImage for StaticImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_shared_object(&self) -> bool {
        self.shared_object
    }

    fn exec_range(&self) -> Range<u64> {
        self.exec.clone()
    }

    fn read(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(Error::ImageRead { offset, len })?;
        self.bytes
            .get(start..end)
            .ok_or(Error::ImageRead { offset, len })
    }

    fn symbol_entries(&self) -> &BTreeSet<u64> {
        &self.symbols
    }

    fn reloc_targets(&self) -> &BTreeSet<u64> {
        &self.relocs
    }

    fn align_entries(&self) -> &BTreeSet<u64> {
        &self.aligns
    }

    fn plt_range(&self) -> Range<u64> {
        self.plt.clone()
    }

    fn plt_link(&self, stub: u64) -> Option<u64> {
        self.plt_links.get(&stub).copied()
    }

    fn exception_edges(&self) -> &[(u64, u64)] {
        &self.exception_edges
    }

    fn longjmp_sites(&self) -> &BTreeSet<u64> {
        &self.longjmp_sites
    }
}

/// One analyzed module as serialized by the disassembler collaborator: the
/// image plus its decoded instruction stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    pub image: StaticImage,
    pub instructions: Vec<Instruction>,
}
