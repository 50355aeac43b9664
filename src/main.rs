use anyhow::Result;

use pcsc_card_monitor::cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}
