//! `sealkv`: developer CLI for SealKV stores.
//!
//! Uses the file-backed development credential subsystem, so stores written
//! here are only as protected as the device key file.

mod cli;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_env("SEALKV_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = cli::Cli::parse();
    if let Some(output) = cli::run(&cli).await? {
        println!("{output}");
    }
    Ok(())
}
