use clap::Args;
use rondel_core::image::ModuleSnapshot;
use rondel_core::module::Module;
use rondel_core::seed::Seed;
use rondel_variant::encode::invalid_instr;
use rondel_variant::layout::{self, LayoutInputs, Placement};
use rondel_variant::rbbl::{self, GenContext};
use rondel_variant::relocate;
use std::fs;
use std::path::PathBuf;

/// Mirrors the kernel side's default cache displacement.
const CC_OFFSET: u64 = 1 << 30;
const X_LOAD_BASE: u64 = 0x40_0000;

/// Arguments for `rondel variant`.
#[derive(Args)]
pub struct VariantArgs {
    /// Module snapshot (JSON) produced by the disassembler side
    pub snapshot: PathBuf,
    /// Per-buffer cache size in bytes
    #[arg(long, default_value_t = 0x0080_0000)]
    pub cache_size: usize,
    /// Hex seed for reproducible layouts; a fresh one is drawn when omitted
    #[arg(long)]
    pub seed: Option<String>,
    /// How many variants to generate back to back
    #[arg(long, default_value_t = 2)]
    pub count: usize,
}

pub fn execute(args: VariantArgs) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(&args.snapshot)?;
    let snapshot: ModuleSnapshot = serde_json::from_str(&text)?;
    let mut module = Module::from_snapshot(snapshot)?;
    let report = module.analyze()?;
    let templates = rbbl::build_templates(&module)?;

    let seed = match &args.seed {
        Some(hex_str) => Seed::from_hex(hex_str)?,
        None => Seed::generate(),
    };
    println!(
        "module {}: {} templates ({} fixed, {} movable), seed {}",
        module.name(),
        templates.len(),
        templates.fixed.len(),
        templates.movable.len(),
        seed.to_hex()
    );
    if report.unknown_jumps > 0 {
        println!(
            "  note: {} unresolved indirect jumps, nothing will move",
            report.unknown_jumps
        );
    }

    let inputs = LayoutInputs {
        fixed: &templates.fixed,
        movable: &templates.movable,
        switch_jumps: &templates.switch_jumps,
        cc_offset: CC_OFFSET,
    };
    let mut rng = seed.layout_rng();
    let mut buf = vec![invalid_instr()[0]; args.cache_size];

    for cycle in 0..args.count {
        buf.fill(invalid_instr()[0]);
        let arranged = layout::arrange(&mut buf, &inputs, &mut rng)?;
        let ctx = GenContext {
            x_load_base: X_LOAD_BASE,
            cc_load_base: X_LOAD_BASE + CC_OFFSET,
            block_sites: &arranged.block_sites,
        };
        relocate::relocate(&mut buf, &arranged, &templates, &ctx)?;

        let mut tramp32 = 0usize;
        let mut tramp8 = 0usize;
        let mut fillers = 0usize;
        let mut blocks = 0usize;
        for (_, _, placement) in arranged.layout.iter() {
            match placement {
                Placement::Trampoline32 { .. } => tramp32 += 1,
                Placement::Trampoline8 { .. } | Placement::OverlapTrampoline32 { .. } => {
                    tramp8 += 1
                }
                Placement::InvalidFiller => fillers += 1,
                Placement::Block { .. } => blocks += 1,
                Placement::Boundary => {}
            }
        }
        println!(
            "variant {cycle}: used 0x{:x}/0x{:x}, {} blocks, {} near + {} short trampolines, {} degraded entries",
            arranged.used,
            buf.len(),
            blocks,
            tramp32,
            tramp8,
            fillers
        );
    }
    Ok(())
}
