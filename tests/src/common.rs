//! Shared fixtures for the integration tests.

use rondel_core::image::{ModuleSnapshot, StaticImage};
use rondel_core::insn::{BranchInfo, Instruction};
use rondel_core::module::Module;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .try_init();
}

fn nops(offset: u64, len: usize) -> Instruction {
    Instruction::new(offset, vec![0x90; len], BranchInfo::None)
}

fn ret(offset: u64) -> Instruction {
    Instruction::new(offset, vec![0xc3], BranchInfo::Return)
}

/// A small program with two exported functions, a conditional branch and a
/// call: enough shape for layout and translation scenarios.
///
/// ```text
/// 0x10  sym A: nop nop; jz 0x20
/// 0x14         call 0x30
/// 0x19         ret
/// 0x20         ret            (branch target)
/// 0x30  sym B: nop x4
/// 0x34         ret
/// ```
pub fn sample_snapshot() -> ModuleSnapshot {
    let mut image = StaticImage::new("prot", vec![0; 0x40]);
    image.symbols.insert(0x10);
    image.symbols.insert(0x30);

    let instructions = vec![
        nops(0x10, 2),
        Instruction::new(0x12, vec![0x74, 0x0c], BranchInfo::CondJump { target: 0x20 }),
        Instruction::new(
            0x14,
            vec![0xe8, 0x17, 0x00, 0x00, 0x00],
            BranchInfo::Call { target: 0x30 },
        ),
        ret(0x19),
        ret(0x20),
        nops(0x30, 4),
        ret(0x34),
    ];
    ModuleSnapshot {
        image,
        instructions,
    }
}

/// The sample program, fully analyzed.
pub fn sample_module() -> Module {
    let mut module = Module::from_snapshot(sample_snapshot()).unwrap();
    module.analyze().unwrap();
    module
}

/// A main-executable module dispatching through an absolute switch table.
/// The table lives at `0x100` with one 8-byte entry per target; each target
/// offset holds a `ret`.
pub fn switch_module(targets: &[u64]) -> Module {
    let table = 0x100u64;
    let mut bytes = vec![0u8; table as usize + targets.len() * 8];
    for (i, t) in targets.iter().enumerate() {
        let at = table as usize + i * 8;
        bytes[at..at + 8].copy_from_slice(&t.to_le_bytes());
    }
    let mut image = StaticImage::new("main", bytes);
    image.exec = 0..table;

    let mut module = Module::new(Box::new(image));
    module
        .insert_instr(nops(0x00, 2))
        .unwrap();
    let mut lea = Instruction::new(
        0x02,
        vec![0x48, 0x8d, 0x05, 0xf7, 0x00, 0x00, 0x00],
        BranchInfo::None,
    );
    lea.table_base = Some(table);
    lea.rip_disp_pos = Some(3);
    module.insert_instr(lea).unwrap();
    let mut jmp = Instruction::new(0x09, vec![0xff, 0xe0], BranchInfo::IndirectJump);
    jmp.jump_reg = Some(0);
    module.insert_instr(jmp).unwrap();
    for &t in targets {
        module.insert_instr(ret(t)).unwrap();
    }
    module.analyze().unwrap();
    module
}
