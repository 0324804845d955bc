#![recursion_limit = "256"]

use adapter_tune::cli::Cli;
use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("adapter_tune=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    cli.run()
}
