//! briefengine CLI: generate, validate, and deliver sourced news briefs.
//!
//! One invocation runs one `(module, run type)` brief end to end and exits
//! non-zero, naming the failing stage and error kind, if any stage fails.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
