mod checkpoint;
mod cli;
mod data;
#[cfg(test)]
mod fixtures;
mod loader;
mod metrics;
mod model;
mod optim;
mod pipeline;
mod train;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("length_regressor=info")),
        )
        .init();

    cli::Cli::parse().run()
}
