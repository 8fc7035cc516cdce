use anyhow::Result;
use clap::Parser;
use glyph_match_cli::{init_tracing, run_cli, Cli};

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli)
}
