use futures::StreamExt;
use stagehand::config::Config;
use stagehand::events::{self, Event, EventReceiver};
use stagehand::harvest::{HarvestCoordinator, HarvestRequest, HarvestSummary, TakeFilter, ThroughputSampler};
use stagehand::humanize::ByteSize;
use stagehand::observability::Metrics;
use stagehand::registry::{DeviceRegistry, LoadMode, RegistryContext, read_records};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::cli::HarvestArgs;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Host-side lines handled here instead of being fanned out to devices.
enum HostLine {
    Quit,
    Status,
    Command { name: String, argument: String },
    Blank,
}

fn parse_line(line: &str) -> HostLine {
    let line = line.trim();
    if line.is_empty() {
        return HostLine::Blank;
    }
    let (name, argument) = line
        .split_once(char::is_whitespace)
        .map(|(name, rest)| (name, rest.trim()))
        .unwrap_or((line, ""));
    match name {
        "quit" | "exit" => HostLine::Quit,
        "status" => HostLine::Status,
        _ => HostLine::Command {
            name: name.to_string(),
            argument: argument.to_string(),
        },
    }
}

async fn open_registry(config: &Config, devices_file: &Path) -> (DeviceRegistry, EventReceiver, Arc<Metrics>) {
    let (tx, rx) = events::channel();
    let metrics = Arc::new(Metrics::new());
    let mut ctx = RegistryContext::new(tx, metrics.clone());
    ctx.network = config.network.settings();

    let mut registry = DeviceRegistry::new(ctx);
    if devices_file.exists() {
        match registry.load_file(devices_file, LoadMode::Replace).await {
            Ok(report) => {
                for skipped in &report.skipped {
                    warn!(index = skipped.index, reason = %skipped.reason, "Device entry skipped");
                }
            }
            Err(err) => error!(path = %devices_file.display(), error = %err, "Failed to load devices"),
        }
    } else {
        warn!(path = %devices_file.display(), "Devices file not found, starting empty");
    }
    (registry, rx, metrics)
}

fn log_event(event: &Event) {
    match event {
        Event::StateChanged { device_id, state, info } => {
            info!(%device_id, %state, %info, "Device state");
        }
        Event::FileTransfer {
            device_id,
            local_name,
            status,
            error,
        } => match error {
            Some(error) => warn!(%device_id, file = %local_name, %status, %error, "File transfer"),
            None => debug!(%device_id, file = %local_name, %status, "File transfer"),
        },
        Event::JobFinished {
            device_id,
            copied,
            skipped,
            failed,
            error,
        } => {
            info!(%device_id, copied, skipped, failed, error = ?error, "Harvest job finished");
        }
    }
}

/// Connect every device and forward stdin commands until stdin closes or a
/// shutdown signal arrives.
pub async fn run(config: &Config, devices: Option<PathBuf>) -> Result<(), AnyError> {
    let devices_file = devices.unwrap_or_else(|| config.registry.devices_file.clone());
    let (mut registry, mut events, metrics) = open_registry(config, &devices_file).await;
    info!(devices = registry.len(), "stagehand running");

    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    let mut refresh = interval(std::time::Duration::from_millis(config.registry.refresh_interval_ms));
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(event) = events.recv() => log_event(&event),
            _ = refresh.tick() => registry.refresh_all().await,
            line = lines.next() => match line {
                Some(Ok(line)) => match parse_line(&line) {
                    HostLine::Quit => break,
                    HostLine::Status => {
                        for status in registry.statuses() {
                            println!(
                                "{:>3} {:<10} {:<20} {:<9} {}",
                                status.id, status.kind, status.name, status.state, status.info
                            );
                        }
                    }
                    HostLine::Command { name, argument } => registry.command(&name, &argument).await,
                    HostLine::Blank => {}
                },
                Some(Err(err)) => warn!(error = %err, "Unreadable command line"),
                None => {
                    info!("stdin closed");
                    break;
                }
            },
        }
    }

    if config.registry.save_on_exit {
        if let Err(err) = registry.save_file(&devices_file).await {
            error!(path = %devices_file.display(), error = %err, "Failed to save devices");
        }
    }
    registry.teardown().await;
    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }

    let snapshot = metrics.snapshot();
    info!(
        commands = snapshot.commands_dispatched,
        state_changes = snapshot.state_changes,
        "stagehand stopped"
    );
    Ok(())
}

/// Harvest the selected devices, logging progress until every job is done.
pub async fn harvest(config: &Config, args: HarvestArgs) -> Result<HarvestSummary, AnyError> {
    let devices_file = args
        .devices
        .clone()
        .unwrap_or_else(|| config.registry.devices_file.clone());
    let (mut registry, mut events, metrics) = open_registry(config, &devices_file).await;

    let targets = registry.harvest_targets(&args.device, &config.harvest.source_settings());
    if targets.is_empty() {
        warn!("No devices with a harvest source selected");
    }

    let filter = if args.all || args.take.is_empty() {
        TakeFilter::All
    } else {
        TakeFilter::takes(args.take, args.match_mode.unwrap_or(config.harvest.match_mode))
    };
    let root = args.root.unwrap_or_else(|| config.harvest.root.clone());

    let mut coordinator = HarvestCoordinator::new(
        registry_events(&registry),
        metrics,
        config.harvest.cancel_wait(),
    );
    let run_id = coordinator
        .start(
            HarvestRequest::builder()
                .root(root.clone())
                .targets(targets)
                .filter(filter)
                .build(),
        )
        .await;
    info!(%run_id, root = %root.display(), "Harvest started");

    let mut ticker = interval(config.harvest.progress_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sampler = ThroughputSampler::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let summary = loop {
        if coordinator.is_done() {
            break coordinator.wait().await;
        }
        tokio::select! {
            _ = &mut shutdown => {
                warn!("Cancelling harvest");
                break coordinator.cancel_all().await;
            }
            Some(event) = events.recv() => log_event(&event),
            _ = ticker.tick() => {
                let bytes = coordinator.bytes_transferred();
                let totals = coordinator.totals();
                info!(
                    progress = %format!("{:.1}%", coordinator.progress() * 100.0),
                    copied = totals.copied,
                    skipped = totals.skipped,
                    failed = totals.failed,
                    transferred = %ByteSize(bytes).to_human_readable(),
                    rate = %sampler.sample_formatted(Instant::now(), bytes),
                    "Harvesting"
                );
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }
    registry.teardown().await;

    info!(
        %run_id,
        elapsed_ms = (chrono::Utc::now() - summary.started_at).num_milliseconds(),
        copied = summary.totals.copied,
        skipped = summary.totals.skipped,
        failed = summary.totals.failed,
        "Harvest complete"
    );
    Ok(summary)
}

fn registry_events(registry: &DeviceRegistry) -> events::EventSender {
    registry.context().events.clone()
}

/// Print the persisted devices without connecting to them.
pub async fn list_devices(config: &Config) -> Result<(), AnyError> {
    let path = &config.registry.devices_file;
    if !path.exists() {
        println!("No devices file at {}", path.display());
        return Ok(());
    }
    let (records, malformed) = read_records(path).await?;
    for (index, record) in &records {
        let fields = record.config();
        println!(
            "{:>3} {:<10} {:<20} {}",
            index,
            record.kind(),
            fields.name().unwrap_or("-"),
            if fields.bool_or("enabled", true).unwrap_or(true) {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
    for entry in malformed {
        println!("{:>3} (unreadable: {})", entry.index, entry.reason);
    }
    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert!(matches!(parse_line("   "), HostLine::Blank));
        assert!(matches!(parse_line("quit"), HostLine::Quit));
        assert!(matches!(parse_line("status"), HostLine::Status));
        match parse_line("takeName  shot 01 ") {
            HostLine::Command { name, argument } => {
                assert_eq!(name, "takeName");
                assert_eq!(argument, "shot 01");
            }
            _ => panic!("expected command"),
        }
        match parse_line("stop") {
            HostLine::Command { name, argument } => {
                assert_eq!(name, "stop");
                assert!(argument.is_empty());
            }
            _ => panic!("expected command"),
        }
    }
}
