//! Model-building properties: block coverage and branch-target closure.

use crate::common::{init_tracing, sample_module, sample_snapshot};
use rondel_core::image::{ModuleSnapshot, StaticImage};
use rondel_core::insn::{BranchInfo, Instruction};
use rondel_core::module::{Module, ModuleRegistry};
use rondel_core::Error;
use std::collections::BTreeSet;

#[test]
fn blocks_partition_the_instruction_stream() {
    init_tracing();
    let module = sample_module();

    // Every instruction belongs to exactly one block.
    let mut seen = BTreeSet::new();
    for block in module.blocks().values() {
        for &off in &block.instrs {
            assert!(seen.insert(off), "instruction 0x{off:x} in two blocks");
        }
    }
    assert_eq!(seen.len(), module.instrs().len());

    // Inside a block the byte range is gapless.
    for block in module.blocks().values() {
        let mut expect = block.entry;
        for &off in &block.instrs {
            assert_eq!(off, expect, "gap inside block 0x{:x}", block.entry);
            expect = module.instrs()[&off].end_offset();
        }
        assert_eq!(expect, block.end());
    }
}

#[test]
fn branch_target_closure_is_enforced() {
    init_tracing();
    // A jump into the void must fail the consistency check, deterministically.
    let image = StaticImage::new("bad", vec![0; 0x10]);
    let instructions = vec![Instruction::new(
        0,
        vec![0xe9, 0x0b, 0x00, 0x00, 0x00],
        BranchInfo::Jump { target: 0x10 },
    )];
    for _ in 0..3 {
        let mut module = Module::from_snapshot(ModuleSnapshot {
            image: image.clone(),
            instructions: instructions.clone(),
        })
        .unwrap();
        let err = module.analyze().unwrap_err();
        assert!(matches!(
            err,
            Error::BranchTargetMissing {
                target: 0x10,
                from_instr: 0
            }
        ));
    }
}

#[test]
fn exception_edges_surface_landing_pads() {
    init_tracing();
    let mut snapshot = sample_snapshot();
    // Pretend the unwind tables route the call site at 0x14 to 0x20.
    snapshot.image.exception_edges.push((0x14, 0x20));
    let mut module = Module::from_snapshot(snapshot).unwrap();
    module.analyze().unwrap();
    assert!(module.branch_targets_of(0x14).unwrap().contains(&0x20));
}

#[test]
fn registry_analyzes_every_module() {
    init_tracing();
    let mut registry = ModuleRegistry::new();
    registry.insert(Module::from_snapshot(sample_snapshot()).unwrap());
    let reports = registry.analyze_all().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].module, "prot");
    assert!(registry.get("prot").is_ok());
    assert!(matches!(
        registry.get("absent"),
        Err(Error::UnknownModule(_))
    ));
}

#[test]
fn snapshot_serialization_round_trips() {
    init_tracing();
    let snapshot = sample_snapshot();
    let json = serde_json::to_string(&snapshot).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("prot.json");
    std::fs::write(&path, &json).unwrap();

    let back: ModuleSnapshot =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(back.instructions, snapshot.instructions);
    let mut module = Module::from_snapshot(back).unwrap();
    let report = module.analyze().unwrap();
    assert_eq!(report.total_blocks, module.blocks().len());
}
