pub mod analyze;
pub mod variant;

use clap::Subcommand;

/// CLI subcommands.
#[derive(Subcommand)]
pub enum Cmd {
    /// Analyze a module snapshot: blocks, indirect jumps, classification
    Analyze(analyze::AnalyzeArgs),
    /// Generate randomized code-variant layouts and report statistics
    Variant(variant::VariantArgs),
}

impl Cmd {
    pub fn execute(self) -> Result<(), Box<dyn std::error::Error>> {
        match self {
            Cmd::Analyze(args) => analyze::execute(args),
            Cmd::Variant(args) => variant::execute(args),
        }
    }
}
