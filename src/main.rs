use anyhow::Result;
use clap::Parser;

use ugc_cache::{cli::Cli, logging, metrics, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(settings.log)?;
    run(settings, cli.command).await?;
    if cli.metrics {
        eprint!("{}", String::from_utf8_lossy(&metrics::gather()));
    }
    Ok(())
}
