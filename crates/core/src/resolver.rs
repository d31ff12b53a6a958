//! Indirect-jump classification.
//!
//! Every computed jump in a module is matched against a fixed priority of
//! compiler dispatch patterns: switch-case tables (absolute entries in the
//! main executable, table-relative offsets in shared objects), PLT stubs,
//! longjmp sites, and the memset/type-conversion code-window idioms. Anything
//! unrecognized is conservatively `Unknown`, which the classifier treats as
//! "may land on any block".

use crate::insn::BranchInfo;
use crate::module::Module;
use crate::result::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// How many instructions before the jump are scanned for the table `lea`.
const TABLE_BASE_WINDOW: usize = 8;
/// Upper bound on switch-table entries; real tables stop at the first entry
/// that fails validation well before this.
const MAX_TABLE_ENTRIES: usize = 1024;
/// Code window enumerated for a memset-style dispatch run.
const MEMSET_WINDOW: u64 = 0x80;
/// Code window enumerated for a type-conversion dispatch run.
const CONVERT_WINDOW: u64 = 0x40;

/// Recognized dispatch pattern of one indirect jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpKind {
    /// Switch-case table of absolute entries in the main executable.
    SwitchAbsolute,
    /// Switch-case table of table-relative offsets in a shared object.
    SwitchOffset,
    /// Procedure-linkage-table stub.
    Plt,
    /// longjmp dispatch; targets are not enumerable.
    LongJump,
    /// memset-style size dispatch into a store run.
    Memset,
    /// Type-conversion dispatch into a stub run.
    Convert,
    /// Unrecognized; conservatively reaches any block.
    Unknown,
}

/// Classification record for one indirect jump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndirectJumpInfo {
    pub kind: JumpKind,
    /// Jump table (or dispatch window) file offset; zero when absent.
    pub table_offset: u64,
    /// Table (or window) size in bytes.
    pub table_size: u64,
    /// Offset of the instruction that materializes the table base.
    pub base_insn: Option<u64>,
    /// Every resolvable destination.
    pub targets: BTreeSet<u64>,
    /// Destinations in table order; recorded for main-executable tables only,
    /// where case indices must be reconstructible.
    pub ordered_targets: Vec<u64>,
}

impl IndirectJumpInfo {
    fn unresolved(kind: JumpKind) -> Self {
        Self {
            kind,
            table_offset: 0,
            table_size: 0,
            base_insn: None,
            targets: BTreeSet::new(),
            ordered_targets: Vec::new(),
        }
    }

    /// True for both switch-table kinds.
    pub fn is_switch(&self) -> bool {
        matches!(self.kind, JumpKind::SwitchAbsolute | JumpKind::SwitchOffset)
    }
}

/// Classifies every indirect jump in the module and folds the discovered
/// targets into the branch-target map.
pub(crate) fn resolve_all(module: &mut Module) -> Result<()> {
    let jumps: Vec<u64> = module
        .instrs
        .iter()
        .filter(|(_, i)| matches!(i.branch, BranchInfo::IndirectJump))
        .map(|(&off, _)| off)
        .collect();

    let mut unknown = 0usize;
    for jump in jumps {
        let info = classify_jump(module, jump);
        debug!(jump, kind = ?info.kind, targets = info.targets.len(), "indirect jump");
        if info.kind == JumpKind::Unknown {
            unknown += 1;
        }
        let targets: Vec<u64> = info.targets.iter().copied().collect();
        for t in targets {
            module.insert_branch_target(jump, t);
        }
        module.jumpins.insert(jump, info);
    }
    if unknown > 0 {
        warn!(
            module = module.image.name(),
            unknown, "indirect jumps left unresolved; randomization coverage collapses"
        );
    }
    Ok(())
}

fn classify_jump(module: &Module, jump: u64) -> IndirectJumpInfo {
    // 1/2: register-indexed switch tables, distinguished by image kind.
    if let Some((base_insn, table)) = materialized_table(module, jump) {
        if !module.image.is_executable(table) {
            let read = if module.image.is_shared_object() {
                read_offset_table(module, base_insn, table)
            } else {
                read_absolute_table(module, base_insn, table)
            };
            if let Some(info) = read {
                return info;
            }
        } else {
            // A base pointing into code is a computed-dispatch idiom, not a
            // data table.
            if let Some(info) = code_window_dispatch(module, base_insn, table) {
                return info;
            }
        }
    }
    // 3: PLT stub, resolved through the relocation table.
    if module.image.in_plt(jump) {
        let mut info = IndirectJumpInfo::unresolved(JumpKind::Plt);
        info.base_insn = Some(jump);
        if let Some(local) = module.image.plt_link(jump) {
            info.targets.insert(local);
        }
        return info;
    }
    // 4: longjmp sites named by the image.
    if module.image.longjmp_sites().contains(&jump) {
        return IndirectJumpInfo::unresolved(JumpKind::LongJump);
    }
    IndirectJumpInfo::unresolved(JumpKind::Unknown)
}

/// Finds the rip-relative `lea` that materializes a table base within the
/// backward scan window of the jump.
fn materialized_table(module: &Module, jump: u64) -> Option<(u64, u64)> {
    module
        .instrs
        .range(..jump)
        .rev()
        .take(TABLE_BASE_WINDOW)
        .find_map(|(&off, insn)| insn.table_base.map(|t| (off, t)))
}

/// Reads a table of absolute 8-byte entries. Entries are validated against
/// the executable range and the instruction map; the table ends at the first
/// entry that fails validation.
fn read_absolute_table(module: &Module, base_insn: u64, table: u64) -> Option<IndirectJumpInfo> {
    let mut ordered = Vec::new();
    let mut targets = BTreeSet::new();
    for idx in 0..MAX_TABLE_ENTRIES {
        let Ok(entry) = module.image.read_u64(table + idx as u64 * 8) else {
            break;
        };
        if !module.image.is_executable(entry) || !module.is_instr_entry(entry, true) {
            break;
        }
        ordered.push(entry);
        targets.insert(entry);
    }
    if ordered.len() < 2 {
        return None;
    }
    Some(IndirectJumpInfo {
        kind: JumpKind::SwitchAbsolute,
        table_offset: table,
        table_size: ordered.len() as u64 * 8,
        base_insn: Some(base_insn),
        targets,
        ordered_targets: ordered,
    })
}

/// Reads a table of signed 4-byte entries relative to the table base.
fn read_offset_table(module: &Module, base_insn: u64, table: u64) -> Option<IndirectJumpInfo> {
    let mut targets = BTreeSet::new();
    let mut count = 0usize;
    for idx in 0..MAX_TABLE_ENTRIES {
        let Ok(entry) = module.image.read_i32(table + idx as u64 * 4) else {
            break;
        };
        let target = table.wrapping_add(entry as i64 as u64);
        if !module.image.is_executable(target) || !module.is_instr_entry(target, true) {
            break;
        }
        targets.insert(target);
        count += 1;
    }
    if count < 2 {
        return None;
    }
    Some(IndirectJumpInfo {
        kind: JumpKind::SwitchOffset,
        table_offset: table,
        table_size: count as u64 * 4,
        base_insn: Some(base_insn),
        targets,
        ordered_targets: Vec::new(),
    })
}

/// Enumerates a computed-dispatch code window. A run containing a return is a
/// memset-style store run; otherwise it is the shorter conversion-stub run.
fn code_window_dispatch(module: &Module, base_insn: u64, base: u64) -> Option<IndirectJumpInfo> {
    let has_ret = module
        .instrs
        .range(base..base + MEMSET_WINDOW)
        .any(|(_, i)| matches!(i.branch, BranchInfo::Return));
    let (kind, window) = if has_ret {
        (JumpKind::Memset, MEMSET_WINDOW)
    } else {
        (JumpKind::Convert, CONVERT_WINDOW)
    };
    let targets: BTreeSet<u64> = module.instrs.range(base..base + window).map(|(&o, _)| o).collect();
    if targets.len() < 2 {
        return None;
    }
    Some(IndirectJumpInfo {
        kind,
        table_offset: base,
        table_size: window,
        base_insn: Some(base_insn),
        targets,
        ordered_targets: Vec::new(),
    })
}
