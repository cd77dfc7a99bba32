use anyhow::Result;
use clap::Parser;
use seqcraft_trainer::{CaptionArgs, caption};
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = CaptionArgs::parse().into_config()?;
    info!(?config, "starting captioner training");
    let report = caption::run(&config)?;
    info!(
        captions = report.captions.len(),
        output = %config.output.display(),
        "done"
    );
    Ok(())
}
