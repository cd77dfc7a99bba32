use anyhow::Result;
use clap::Parser;
use seqcraft_trainer::{LmArgs, lm};
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = LmArgs::parse().into_config()?;
    info!(?config, "starting language model training");
    let report = lm::run(&config)?;
    info!(
        answers = report.answers.len(),
        output = %config.output.display(),
        "done"
    );
    Ok(())
}
