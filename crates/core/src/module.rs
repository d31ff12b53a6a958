//! One analyzed module: instructions, basic blocks, branch targets.
//!
//! The module owns every instruction and block for one binary image, keyed by
//! file offset, plus the branch-target map that closes over all recognized
//! control edges. The analysis runs as a fixed pipeline: classify indirect
//! jumps, record exception-unwind edges, split the instruction stream into
//! blocks, check the model for consistency, then partition the blocks into
//! fixed and movable sets.

use crate::block::{BasicBlock, Mobility};
use crate::classify::{self, CoverageReport};
use crate::image::{ModuleImage, ModuleSnapshot};
use crate::insn::{BranchInfo, Instruction};
use crate::resolver::{self, IndirectJumpInfo};
use crate::result::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// In-memory model of one loaded binary image.
pub struct Module {
    pub(crate) image: Box<dyn ModuleImage + Send + Sync>,
    pub(crate) instrs: BTreeMap<u64, Instruction>,
    pub(crate) blocks: BTreeMap<u64, BasicBlock>,
    /// Source instruction offset to the set of destinations it may reach.
    pub(crate) br_targets: BTreeMap<u64, BTreeSet<u64>>,
    /// Destination offset to the set of sources reaching it.
    pub(crate) br_sources: BTreeMap<u64, BTreeSet<u64>>,
    pub(crate) call_targets: BTreeSet<u64>,
    pub(crate) jumpins: BTreeMap<u64, IndirectJumpInfo>,
    pub(crate) fixed: BTreeSet<u64>,
    pub(crate) movable: BTreeSet<u64>,
}

impl Module {
    /// Creates an empty module over the given image.
    pub fn new(image: Box<dyn ModuleImage + Send + Sync>) -> Self {
        Self {
            image,
            instrs: BTreeMap::new(),
            blocks: BTreeMap::new(),
            br_targets: BTreeMap::new(),
            br_sources: BTreeMap::new(),
            call_targets: BTreeSet::new(),
            jumpins: BTreeMap::new(),
            fixed: BTreeSet::new(),
            movable: BTreeSet::new(),
        }
    }

    /// Builds a module from a snapshot, recording the direct control edges
    /// the instruction stream carries.
    pub fn from_snapshot(snapshot: ModuleSnapshot) -> Result<Self> {
        let ModuleSnapshot {
            image,
            instructions,
        } = snapshot;
        let mut module = Module::new(Box::new(image));
        for insn in instructions {
            module.insert_instr(insn)?;
        }
        Ok(module)
    }

    /// Inserts one decoded instruction, enforcing unique, non-overlapping
    /// offsets, and records its direct branch/call edges.
    pub fn insert_instr(&mut self, insn: Instruction) -> Result<()> {
        if self.instrs.contains_key(&insn.offset) {
            return Err(Error::DuplicateInstruction(insn.offset));
        }
        if let Some((_, prev)) = self.instrs.range(..insn.offset).next_back() {
            if prev.end_offset() > insn.offset {
                return Err(Error::OverlappingInstruction(insn.offset));
            }
        }
        if let Some(target) = insn.direct_target() {
            self.insert_branch_target(insn.offset, target);
        }
        if let BranchInfo::Call { target } = insn.branch {
            self.insert_call_target(target);
        }
        self.instrs.insert(insn.offset, insn);
        Ok(())
    }

    /// Records one control edge in both directions of the branch-target map.
    pub fn insert_branch_target(&mut self, source: u64, target: u64) {
        self.br_targets.entry(source).or_default().insert(target);
        self.br_sources.entry(target).or_default().insert(source);
    }

    /// Records a call destination; call targets start blocks and pin them.
    pub fn insert_call_target(&mut self, target: u64) {
        self.call_targets.insert(target);
    }

    /// Runs the full analysis pipeline over the inserted instructions.
    pub fn analyze(&mut self) -> Result<CoverageReport> {
        resolver::resolve_all(self)?;
        self.record_exception_edges();
        self.split_blocks()?;
        self.examine_blocks()?;
        classify::classify(self)
    }

    /// Inserts synthetic branch-target records for exception-unwind control
    /// transfers. Landing pads are reachable only through the unwind tables,
    /// which the generic branch model never sees; without these records the
    /// classifier would treat the pad blocks as unreachable private code.
    pub fn record_exception_edges(&mut self) {
        let edges: Vec<(u64, u64)> = self.image.exception_edges().to_vec();
        for (site, pad) in edges {
            debug!(site, pad, "exception edge");
            self.insert_branch_target(site, pad);
        }
    }

    /// Partitions the instruction map into basic blocks. A block ends at any
    /// control transfer, and before any offset that is a branch target, call
    /// target, symbol entry or alignment entry.
    pub fn split_blocks(&mut self) -> Result<()> {
        let mut boundaries: BTreeSet<u64> = self.br_sources.keys().copied().collect();
        boundaries.extend(self.call_targets.iter().copied());
        boundaries.extend(self.image.symbol_entries().iter().copied());
        boundaries.extend(self.image.align_entries().iter().copied());

        self.blocks.clear();
        let mut run: Vec<u64> = Vec::new();
        let mut prev_end = 0u64;

        let offsets: Vec<u64> = self.instrs.keys().copied().collect();
        for off in offsets {
            if !run.is_empty() && (boundaries.contains(&off) || prev_end != off) {
                // Fall through into the boundary only when the bytes are
                // contiguous; a gap means data, not padding.
                let succs = if prev_end == off {
                    BTreeSet::from([off])
                } else {
                    BTreeSet::new()
                };
                self.close_block(std::mem::take(&mut run), succs);
            }
            let insn = &self.instrs[&off];
            prev_end = insn.end_offset();
            run.push(off);
            if insn.ends_block() {
                let succs = self.successors_of(insn);
                self.close_block(std::mem::take(&mut run), succs);
            }
        }
        if !run.is_empty() {
            self.close_block(run, BTreeSet::new());
        }
        debug!(
            module = self.image.name(),
            blocks = self.blocks.len(),
            "split into basic blocks"
        );
        Ok(())
    }

    fn successors_of(&self, insn: &Instruction) -> BTreeSet<u64> {
        let next = insn.end_offset();
        let fallthrough = || {
            self.instrs
                .contains_key(&next)
                .then_some(next)
                .into_iter()
                .collect::<BTreeSet<u64>>()
        };
        match insn.branch {
            BranchInfo::None => fallthrough(),
            BranchInfo::Jump { target } => BTreeSet::from([target]),
            BranchInfo::CondJump { target } | BranchInfo::Call { target } => {
                let mut s = fallthrough();
                s.insert(target);
                s
            }
            BranchInfo::IndirectJump => self
                .jumpins
                .get(&insn.offset)
                .map(|info| info.targets.clone())
                .unwrap_or_default(),
            BranchInfo::IndirectCall => fallthrough(),
            BranchInfo::Return => BTreeSet::new(),
        }
    }

    fn close_block(&mut self, run: Vec<u64>, succs: BTreeSet<u64>) {
        let entry = run[0];
        let last = &self.instrs[run.last().unwrap_or(&entry)];
        let size = last.end_offset() - entry;
        self.blocks.insert(
            entry,
            BasicBlock {
                entry,
                size,
                instrs: run,
                succs,
                mobility: Mobility::Unclassified,
            },
        );
    }

    /// Whole-module consistency check: every recorded branch target must
    /// resolve to an instruction entry, and the blocks must cover every
    /// instruction. A violation indicates a disassembly or boundary-detection
    /// failure upstream, not a recoverable condition.
    pub fn examine_blocks(&self) -> Result<()> {
        self.check_branch_targets()?;
        let covered: usize = self.blocks.values().map(|b| b.instrs.len()).sum();
        if covered != self.instrs.len() {
            return Err(Error::UncoveredInstructions(self.instrs.len() - covered));
        }
        Ok(())
    }

    /// Verifies that every branch destination is an instruction entry point,
    /// accepting the byte after a lock/repeat prefix as an entry.
    pub fn check_branch_targets(&self) -> Result<()> {
        for (&target, sources) in &self.br_sources {
            if !self.is_instr_entry(target, true) {
                let from_instr = sources.iter().next().copied().unwrap_or(target);
                return Err(Error::BranchTargetMissing { target, from_instr });
            }
        }
        Ok(())
    }

    /// True when `off` starts an instruction, or (with `consider_prefix`)
    /// points at the byte after a lock/repeat prefix.
    pub fn is_instr_entry(&self, off: u64, consider_prefix: bool) -> bool {
        if self.instrs.contains_key(&off) {
            return true;
        }
        if consider_prefix && off > 0 {
            if let Some(prev) = self.instrs.get(&(off - 1)) {
                return prev.has_lock_or_rep;
            }
        }
        false
    }

    /// The image this module was built from.
    pub fn image(&self) -> &(dyn ModuleImage + Send + Sync) {
        self.image.as_ref()
    }

    /// Short module name.
    pub fn name(&self) -> String {
        self.image.name().to_string()
    }

    /// All instructions keyed by file offset.
    pub fn instrs(&self) -> &BTreeMap<u64, Instruction> {
        &self.instrs
    }

    /// All basic blocks keyed by entry offset.
    pub fn blocks(&self) -> &BTreeMap<u64, BasicBlock> {
        &self.blocks
    }

    /// All classified indirect jumps keyed by jump-instruction offset.
    pub fn jumpins(&self) -> &BTreeMap<u64, IndirectJumpInfo> {
        &self.jumpins
    }

    /// Entry offsets of the position-fixed blocks.
    pub fn fixed_blocks(&self) -> &BTreeSet<u64> {
        &self.fixed
    }

    /// Entry offsets of the movable blocks.
    pub fn movable_blocks(&self) -> &BTreeSet<u64> {
        &self.movable
    }

    /// Destinations recorded for a source instruction.
    pub fn branch_targets_of(&self, source: u64) -> Option<&BTreeSet<u64>> {
        self.br_targets.get(&source)
    }

    /// True when some recorded edge lands on `off`.
    pub fn is_branch_target(&self, off: u64) -> bool {
        self.br_sources.contains_key(&off)
    }

    /// True when `off` is a recorded call destination.
    pub fn is_call_target(&self, off: u64) -> bool {
        self.call_targets.contains(&off)
    }

    /// True when any instruction addresses memory through the gs segment;
    /// relevant when the shadow stack itself is gs-addressed.
    pub fn uses_gs_segment(&self) -> bool {
        self.instrs.values().any(|i| i.uses_gs)
    }

    /// The block whose byte range covers `off`.
    pub fn block_covering(&self, off: u64) -> Option<&BasicBlock> {
        self.blocks
            .range(..=off)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.contains(off))
    }
}

/// Process-wide analysis context: every loaded module keyed by name.
///
/// Constructed once at attach time and torn down at detach; components that
/// need cross-module lookups receive a reference instead of reaching into
/// process-wide statics.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Module>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module under its image name.
    pub fn insert(&mut self, module: Module) {
        self.modules.insert(module.name(), module);
    }

    pub fn get(&self, name: &str) -> Result<&Module> {
        self.modules
            .get(name)
            .ok_or_else(|| Error::UnknownModule(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Module> {
        self.modules
            .get_mut(name)
            .ok_or_else(|| Error::UnknownModule(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Module)> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Runs the analysis pipeline over every registered module.
    pub fn analyze_all(&mut self) -> Result<Vec<CoverageReport>> {
        let mut reports = Vec::with_capacity(self.modules.len());
        for module in self.modules.values_mut() {
            reports.push(module.analyze()?);
        }
        Ok(reports)
    }
}
