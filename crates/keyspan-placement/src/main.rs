#![warn(missing_docs)]

//! `ksp-placement`: offline validation of placement rule files.

use anyhow::Result;
use clap::Parser;
use keyspan_placement::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let output = cli.run()?;
    println!("{}", output);
    Ok(())
}
