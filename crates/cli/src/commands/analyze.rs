use clap::Args;
use rondel_core::image::ModuleSnapshot;
use rondel_core::module::Module;
use std::fs;
use std::path::PathBuf;

/// Arguments for `rondel analyze`.
#[derive(Args)]
pub struct AnalyzeArgs {
    /// Module snapshot (JSON) produced by the disassembler side
    pub snapshot: PathBuf,
    /// Emit the coverage report as JSON
    #[arg(long)]
    pub json: bool,
    /// Also list every basic block
    #[arg(long)]
    pub blocks: bool,
}

pub fn execute(args: AnalyzeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(&args.snapshot)?;
    let snapshot: ModuleSnapshot = serde_json::from_str(&text)?;
    let mut module = Module::from_snapshot(snapshot)?;
    let report = module.analyze()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "module {}: {} instructions in {} blocks",
        module.name(),
        module.instrs().len(),
        module.blocks().len()
    );
    println!(
        "  fixed {} / movable {} (movable ratio {:.1}%)",
        report.fixed_blocks,
        report.movable_blocks,
        report.movable_ratio() * 100.0
    );
    if module.uses_gs_segment() {
        println!("  gs-segment addressing present");
    }
    if !module.jumpins().is_empty() {
        println!("  indirect jumps:");
        for (off, info) in module.jumpins() {
            println!(
                "    0x{off:x}: {:?}, table 0x{:x}+{:#x}, {} targets",
                info.kind,
                info.table_offset,
                info.table_size,
                info.targets.len()
            );
        }
    }
    if report.unknown_jumps > 0 {
        println!(
            "  warning: {} unresolved indirect jumps pinned the whole module",
            report.unknown_jumps
        );
    }
    if args.blocks {
        for block in module.blocks().values() {
            println!("  {block}");
        }
    }
    Ok(())
}
