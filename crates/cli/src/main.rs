mod commands;

use clap::Parser;
use commands::Cmd;

/// Rondel CLI
///
/// Rondel is a binary-level moving-target-defense engine. The CLI drives the
/// static half over module snapshots produced by the disassembler side:
/// analyzing a module into classified basic blocks and generating randomized
/// code-variant layouts for inspection.
#[derive(Parser)]
#[command(name = "rondel")]
#[command(about = "rondel: continuous code re-randomization engine")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .init();

    let cli = Cli::parse();
    cli.command.execute()
}
