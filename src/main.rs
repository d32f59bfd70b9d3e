mod cli;
mod execute;
mod logging;

use clap::Parser;
use crate::cli::CLI;
use anyhow::Result;

fn main() -> Result<()> {
    let cli = CLI::parse();
    logging::init(cli.verbose);
    execute::execute(cli)
}
