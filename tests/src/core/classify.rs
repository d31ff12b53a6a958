//! Classifier properties: disjoint partition and dispatch pinning.

use crate::common::{init_tracing, sample_module, switch_module};
use rondel_core::block::{FixedReason, Mobility};
use rondel_core::image::StaticImage;
use rondel_core::insn::{BranchInfo, Instruction};
use rondel_core::module::Module;
use rondel_core::resolver::JumpKind;
use std::collections::BTreeSet;

#[test]
fn partition_is_disjoint_and_total() {
    init_tracing();
    let module = sample_module();
    let fixed = module.fixed_blocks();
    let movable = module.movable_blocks();
    assert!(fixed.is_disjoint(movable));
    let union: BTreeSet<u64> = fixed.union(movable).copied().collect();
    let all: BTreeSet<u64> = module.blocks().keys().copied().collect();
    assert_eq!(union, all);
    assert!(fixed.contains(&0x10) && fixed.contains(&0x30));
    assert!(movable.contains(&0x20));
}

#[test]
fn switch_targets_stay_movable() {
    init_tracing();
    let module = switch_module(&[0x50, 0x60]);
    assert_eq!(module.jumpins()[&0x09].kind, JumpKind::SwitchAbsolute);
    // Retargetable through the jump-target zone, so free to move.
    assert!(module.movable_blocks().contains(&0x50));
    assert!(module.movable_blocks().contains(&0x60));
}

#[test]
fn dispatch_window_targets_are_pinned() {
    init_tracing();
    // A memset-style computed jump: the lea materializes a base inside the
    // executable range and the window ends in a ret.
    let mut image = StaticImage::new("main", vec![0; 0x100]);
    image.symbols.insert(0x00);
    let mut module = Module::new(Box::new(image));
    module
        .insert_instr(Instruction::new(0x00, vec![0x90, 0x90], BranchInfo::None))
        .unwrap();
    let mut lea = Instruction::new(
        0x02,
        vec![0x48, 0x8d, 0x05, 0x17, 0x00, 0x00, 0x00],
        BranchInfo::None,
    );
    lea.table_base = Some(0x20);
    lea.rip_disp_pos = Some(3);
    module.insert_instr(lea).unwrap();
    let mut jmp = Instruction::new(0x09, vec![0xff, 0xe1], BranchInfo::IndirectJump);
    jmp.jump_reg = Some(1);
    module.insert_instr(jmp).unwrap();
    module
        .insert_instr(Instruction::new(0x20, vec![0x90; 8], BranchInfo::None))
        .unwrap();
    module
        .insert_instr(Instruction::new(0x28, vec![0x90; 4], BranchInfo::None))
        .unwrap();
    module
        .insert_instr(Instruction::new(0x2c, vec![0xc3], BranchInfo::Return))
        .unwrap();
    module.analyze().unwrap();

    assert_eq!(module.jumpins()[&0x09].kind, JumpKind::Memset);
    // The computed targets depend on the original layout; they must not move.
    for off in [0x20u64, 0x28, 0x2c] {
        assert_eq!(
            module.blocks()[&off].mobility,
            Mobility::Fixed(FixedReason::PinnedByDispatch),
            "0x{off:x} should be pinned"
        );
    }
}

#[test]
fn unknown_jump_collapses_coverage() {
    init_tracing();
    let image = StaticImage::new("main", vec![0; 0x20]);
    let mut module = Module::new(Box::new(image));
    module
        .insert_instr(Instruction::new(0x00, vec![0xff, 0xe0], BranchInfo::IndirectJump))
        .unwrap();
    module
        .insert_instr(Instruction::new(0x02, vec![0x90], BranchInfo::None))
        .unwrap();
    module
        .insert_instr(Instruction::new(0x10, vec![0xc3], BranchInfo::Return))
        .unwrap();
    let report = module.analyze().unwrap();
    assert_eq!(report.unknown_jumps, 1);
    assert_eq!(report.movable_blocks, 0);
    assert_eq!(report.fixed_blocks, report.total_blocks);
    assert_eq!(report.movable_ratio(), 0.0);
}
