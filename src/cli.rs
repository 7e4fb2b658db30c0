use clap::{Parser, Subcommand};
use stagehand::harvest::MatchMode;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(about = "Drive capture devices and harvest their recordings", long_about = None)]
pub struct Cli {
    /// Configuration file (overrides STAGEHAND_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect all devices and forward commands read from stdin
    Run(RunArgs),
    /// Download recorded files from devices
    Harvest(HarvestArgs),
    /// List persisted devices
    Devices,
    /// Print the effective configuration
    Config,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Devices file (defaults to registry.devices_file)
    #[arg(long)]
    pub devices: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct HarvestArgs {
    /// Destination root; each device gets its own subdirectory
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Copy every listed file instead of filtering by take
    #[arg(long, conflicts_with = "take")]
    pub all: bool,

    /// Take to harvest (repeatable)
    #[arg(long = "take", value_name = "NAME")]
    pub take: Vec<String>,

    /// Device to harvest (repeatable, default: all enabled devices)
    #[arg(long = "device", value_name = "NAME")]
    pub device: Vec<String>,

    /// How take names are compared with file names
    #[arg(long, value_enum)]
    pub match_mode: Option<MatchMode>,

    /// Devices file (defaults to registry.devices_file)
    #[arg(long)]
    pub devices: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_harvest_args() {
        let cli = Cli::parse_from([
            "stagehand", "harvest", "--root", "/tmp/out", "--take", "shot_01", "--take", "shot_02",
            "--device", "deck", "--match-mode", "exact",
        ]);
        let Commands::Harvest(args) = cli.command else {
            panic!("expected harvest");
        };
        assert_eq!(args.root, Some(PathBuf::from("/tmp/out")));
        assert_eq!(args.take, vec!["shot_01", "shot_02"]);
        assert_eq!(args.device, vec!["deck"]);
        assert_eq!(args.match_mode, Some(MatchMode::Exact));
        assert!(!args.all);
    }

    #[test]
    fn test_all_conflicts_with_take() {
        let result = Cli::try_parse_from(["stagehand", "harvest", "--all", "--take", "x"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["stagehand", "devices", "--config", "alt.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("alt.toml")));
        assert!(matches!(cli.command, Commands::Devices));
    }
}
