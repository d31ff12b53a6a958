//! Relocatable block templates.
//!
//! Every basic block is lowered once into a position-independent template:
//! verbatim instruction bytes plus the fixups that re-aim its control flow
//! and rip-relative operands at generation time. Terminating branches are
//! re-encoded to their rel32 forms and a fallthrough jump is appended where
//! the original relied on adjacency, since the packed order is random.
//! Templates are built once per module and reused across every variant
//! generation; only their placement changes.

use crate::encode::{self, JMP32_LEN};
use crate::result::{Error, Result};
use rondel_core::block::BasicBlock;
use rondel_core::insn::{BranchInfo, Instruction};
use rondel_core::module::Module;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A patch applied once final cache addresses exist.
#[derive(Debug, Clone, Copy)]
pub enum Fixup {
    /// rel32 branch displacement to the relocated body of `target`.
    BranchRel32 { pos: usize, target: u64 },
    /// rip-relative displacement that must keep pointing at original data.
    /// `next` is the template offset of the instruction end the displacement
    /// is relative to.
    DataRipRel32 {
        pos: usize,
        next: usize,
        orig_target: u64,
    },
    /// rip-relative displacement into original code; re-aimed at the cache's
    /// fixed zone, where the referenced offsets keep their trampolines.
    CodeRipRel32 {
        pos: usize,
        next: usize,
        orig_target: u64,
    },
    /// Additive slide moving a computed dispatch target into the jump-target
    /// zone.
    ZoneSlide { pos: usize },
}

/// The runtime-generation-ready counterpart of a basic block.
#[derive(Debug, Clone)]
pub struct RandomBlock {
    /// Originating block's file offset.
    pub offset: u64,
    /// Template byte sequence.
    pub template: Vec<u8>,
    /// Patches applied at generation time.
    pub fixups: Vec<Fixup>,
    /// First instruction carries a lock/repeat prefix; the cache records a
    /// second entry point one byte in.
    pub has_lock_or_rep: bool,
}

/// Per-buffer values the generator patches against.
pub struct GenContext<'a> {
    /// Process address of the module's executable mapping.
    pub x_load_base: u64,
    /// Process address of the code-cache mapping.
    pub cc_load_base: u64,
    /// Original block offset to cache-relative placement for this buffer.
    pub block_sites: &'a BTreeMap<u64, u64>,
}

impl RandomBlock {
    /// Template size in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.template.len() as u64
    }

    /// Emits the block at cache-relative address `at`, patching every fixup
    /// against the final layout. `zone_slide` is required for switch-jump
    /// blocks and ignored otherwise.
    pub fn generate(
        &self,
        buf: &mut [u8],
        at: u64,
        ctx: &GenContext,
        zone_slide: Option<u64>,
    ) -> Result<()> {
        encode::write_bytes(buf, at, &self.template)?;
        for fixup in &self.fixups {
            match *fixup {
                Fixup::BranchRel32 { pos, target } => {
                    let site = ctx
                        .block_sites
                        .get(&target)
                        .copied()
                        .ok_or(Error::MissingBlockLocation(target))?;
                    let disp = site as i64 - (at + pos as u64 + 4) as i64;
                    self.patch(buf, at, pos, disp)?;
                }
                Fixup::DataRipRel32 {
                    pos,
                    next,
                    orig_target,
                } => {
                    let disp = (ctx.x_load_base + orig_target) as i64
                        - (ctx.cc_load_base + at + next as u64) as i64;
                    self.patch(buf, at, pos, disp)?;
                }
                Fixup::CodeRipRel32 {
                    pos,
                    next,
                    orig_target,
                } => {
                    let disp = orig_target as i64 - (at + next as u64) as i64;
                    self.patch(buf, at, pos, disp)?;
                }
                Fixup::ZoneSlide { pos } => {
                    let slide = zone_slide.ok_or(Error::MissingZoneSlide(self.offset))?;
                    self.patch(buf, at, pos, slide as i64)?;
                }
            }
        }
        Ok(())
    }

    fn patch(&self, buf: &mut [u8], at: u64, pos: usize, disp: i64) -> Result<()> {
        let disp = i32::try_from(disp).map_err(|_| Error::DisplacementOutOfRange {
            at: at + pos as u64,
            displacement: disp,
        })?;
        encode::patch_disp32(buf, at + pos as u64, disp)
    }
}

/// Every template for one module, keyed by original block offset, plus the
/// switch-jump map the layout pass reserves the jump-target zone from.
#[derive(Debug, Clone, Default)]
pub struct BlockTemplates {
    pub fixed: BTreeMap<u64, RandomBlock>,
    pub movable: BTreeMap<u64, RandomBlock>,
    /// Switch-jump block offset to its resolved target set.
    pub switch_jumps: BTreeMap<u64, BTreeSet<u64>>,
}

impl BlockTemplates {
    /// Looks a template up in either pool.
    pub fn get(&self, offset: u64) -> Option<&RandomBlock> {
        self.fixed.get(&offset).or_else(|| self.movable.get(&offset))
    }

    /// Total number of templates.
    pub fn len(&self) -> usize {
        self.fixed.len() + self.movable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixed.is_empty() && self.movable.is_empty()
    }
}

/// Lowers every classified block of a module into templates.
pub fn build_templates(module: &Module) -> Result<BlockTemplates> {
    let mut out = BlockTemplates::default();
    for (off, info) in module.jumpins() {
        if info.is_switch() {
            if let Some(block) = module.block_covering(*off) {
                out.switch_jumps.insert(block.entry, info.targets.clone());
            }
        }
    }
    for (&entry, block) in module.blocks() {
        let rb = build_one(module, block, out.switch_jumps.contains_key(&entry))?;
        if block.is_movable() {
            out.movable.insert(entry, rb);
        } else {
            out.fixed.insert(entry, rb);
        }
    }
    debug!(
        module = %module.name(),
        fixed = out.fixed.len(),
        movable = out.movable.len(),
        switch_jumps = out.switch_jumps.len(),
        "built block templates"
    );
    Ok(out)
}

fn build_one(module: &Module, block: &BasicBlock, is_switch: bool) -> Result<RandomBlock> {
    let mut template = Vec::new();
    let mut fixups = Vec::new();
    let mut has_lock_or_rep = false;
    let count = block.instrs.len();

    for (i, &ioff) in block.instrs.iter().enumerate() {
        let insn = &module.instrs()[&ioff];
        if i == 0 {
            has_lock_or_rep = insn.has_lock_or_rep;
        }
        let last = i + 1 == count;
        match insn.branch {
            BranchInfo::Jump { target } if last => {
                emit_jump32(&mut template, &mut fixups, encode::JMP32_OPCODE, target);
            }
            BranchInfo::CondJump { target } if last => {
                let cc = cond_code(insn)?;
                let pos = template.len();
                template.extend_from_slice(&[0x0f, 0x80 | cc, 0, 0, 0, 0]);
                fixups.push(Fixup::BranchRel32 {
                    pos: pos + 2,
                    target,
                });
                emit_fallthrough(module, insn, &mut template, &mut fixups);
            }
            BranchInfo::Call { target } if last => {
                emit_jump32(&mut template, &mut fixups, encode::CALL32_OPCODE, target);
                emit_fallthrough(module, insn, &mut template, &mut fixups);
            }
            BranchInfo::IndirectJump if last && is_switch => {
                // The dispatch already computed the original-space target;
                // slide it into the jump-target zone and jump.
                let reg = insn.jump_reg.unwrap_or(0);
                let (lea, disp_pos) = encode::lea_reg_disp32(reg);
                let pos = template.len();
                template.extend_from_slice(&lea);
                fixups.push(Fixup::ZoneSlide {
                    pos: pos + disp_pos,
                });
                template.extend_from_slice(&encode::jump_reg(reg));
            }
            BranchInfo::IndirectCall if last => {
                copy_verbatim(module, insn, &mut template, &mut fixups);
                emit_fallthrough(module, insn, &mut template, &mut fixups);
            }
            BranchInfo::None if last => {
                copy_verbatim(module, insn, &mut template, &mut fixups);
                emit_fallthrough(module, insn, &mut template, &mut fixups);
            }
            _ => copy_verbatim(module, insn, &mut template, &mut fixups),
        }
    }

    Ok(RandomBlock {
        offset: block.entry,
        template,
        fixups,
        has_lock_or_rep,
    })
}

fn emit_jump32(template: &mut Vec<u8>, fixups: &mut Vec<Fixup>, opcode: u8, target: u64) {
    let pos = template.len();
    template.push(opcode);
    template.extend_from_slice(&[0, 0, 0, 0]);
    fixups.push(Fixup::BranchRel32 {
        pos: pos + 1,
        target,
    });
    debug_assert_eq!(template.len() - pos, JMP32_LEN as usize);
}

/// Appends the explicit continuation jump the random packing requires where
/// the original fell through by adjacency.
fn emit_fallthrough(
    module: &Module,
    insn: &Instruction,
    template: &mut Vec<u8>,
    fixups: &mut Vec<Fixup>,
) {
    let next = insn.end_offset();
    if module.instrs().contains_key(&next) {
        emit_jump32(template, fixups, encode::JMP32_OPCODE, next);
    }
}

fn copy_verbatim(
    module: &Module,
    insn: &Instruction,
    template: &mut Vec<u8>,
    fixups: &mut Vec<Fixup>,
) {
    let pos = template.len();
    template.extend_from_slice(&insn.bytes);
    if let Some(dp) = insn.rip_disp_pos {
        let dp = dp as usize;
        let disp = i32::from_le_bytes([
            insn.bytes[dp],
            insn.bytes[dp + 1],
            insn.bytes[dp + 2],
            insn.bytes[dp + 3],
        ]);
        let orig_target = insn.end_offset().wrapping_add(disp as i64 as u64);
        let fixup = if module.image().is_executable(orig_target) {
            Fixup::CodeRipRel32 {
                pos: pos + dp,
                next: pos + insn.len(),
                orig_target,
            }
        } else {
            Fixup::DataRipRel32 {
                pos: pos + dp,
                next: pos + insn.len(),
                orig_target,
            }
        };
        fixups.push(fixup);
    }
}

/// Condition nibble of a Jcc encoding, short or near.
fn cond_code(insn: &Instruction) -> Result<u8> {
    match insn.bytes.as_slice() {
        [b, ..] if (0x70..=0x7f).contains(b) => Ok(b & 0x0f),
        [0x0f, b, ..] if (0x80..=0x8f).contains(b) => Ok(b & 0x0f),
        _ => Err(Error::UnsupportedBranchEncoding(insn.offset)),
    }
}
