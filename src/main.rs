mod cli;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use stagehand::config::Config;
use stagehand::observability;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    observability::init_tracing(&config.logging.filter);

    match cli.command {
        Commands::Run(args) => runner::run(&config, args.devices).await?,
        Commands::Harvest(args) => {
            let summary = runner::harvest(&config, args).await?;
            for (device_id, job) in &summary.jobs {
                println!(
                    "device {device_id}: copied {} skipped {} failed {}{}",
                    job.counts.copied,
                    job.counts.skipped,
                    job.counts.failed,
                    job.error
                        .as_deref()
                        .map(|err| format!(" ({err})"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Devices => runner::list_devices(&config).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}
